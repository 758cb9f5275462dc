use anyhow::{Context, Result};
use clap::Parser;
use crabble_conversation::{
    init_logger, ConversationController, ConversationEvent, ConversationHandle, ConversationState,
    LoggerConfig, PromptType, Settings,
};
use crabble_engine::{metrics, LlamaCppEngine, LlamaCppOptions, LocalModelProvider};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{info, warn};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug)]
#[command(
    name = "crabble-cli",
    version,
    about = "Crabble - chat with Crabby on device"
)]
struct Args {
    /// Settings file without extension (default: config/crabble)
    #[arg(long)]
    config: Option<String>,

    /// Directory holding downloaded models
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Directory holding bundled models
    #[arg(long)]
    bundle_dir: Option<PathBuf>,

    /// Wrap every message in a Crabby prompt template
    /// (task-breakdown, motivation, productivity, stress-management, goal-setting)
    #[arg(long)]
    prompt_type: Option<PromptType>,

    /// Number of CPU threads for decoding and prefill
    #[arg(long, default_value_t = 4)]
    threads: i32,

    /// Send a single message, print the answer and exit
    #[arg(long)]
    once: Option<String>,

    /// Also write logs to stderr
    #[arg(long, default_value_t = false)]
    log_stderr: bool,
}

const HELP: &str = "commands: /new  /dismiss  /clear  /reload  /status  /quit";

#[tokio::main]
async fn main() -> Result<()> {
    // Set OpenBLAS threads to 1 to avoid oversubscription
    std::env::set_var("OPENBLAS_NUM_THREADS", "1");

    let args = Args::parse();
    init_logger(&LoggerConfig {
        stderr: args.log_stderr,
        ..Default::default()
    })?;

    let mut settings = Settings::load_from(args.config.as_deref()).context("loading settings")?;
    if let Some(dir) = args.model_dir {
        settings.model.download_dir = dir;
    }
    if let Some(dir) = args.bundle_dir {
        settings.model.bundle_dir = dir;
    }
    info!(model = %settings.model.category, "Crabble CLI - llama.cpp backend");

    let before = metrics::RuntimeMetrics::capture();

    let engine = LlamaCppEngine::new(LlamaCppOptions {
        threads: Some(args.threads),
        threads_batch: Some(args.threads),
        ..Default::default()
    })?;
    let provider = LocalModelProvider::new(&settings.model.download_dir, &settings.model.bundle_dir);
    let destination = provider.download_destination(settings.model.category);

    let controller = ConversationController::from_settings(Arc::new(engine), Arc::new(provider), &settings);
    let (handle, task) = ConversationHandle::spawn(controller);
    let mut events = handle.subscribe();

    if handle.snapshot().await?.download_required {
        eprintln!(
            "{} is not on this device. Place it at {} and run again.",
            settings.model.category.file_name(),
            destination.display()
        );
        handle.shutdown()?;
        task.await?;
        return Ok(());
    }

    eprintln!("Loading {}...", settings.model.category);
    handle.load_model()?;
    render_until_settled(&mut events).await?;

    match args.once {
        Some(text) => {
            submit(&handle, &mut events, &text, args.prompt_type).await?;
        }
        None => {
            eprintln!("{}", HELP);
            repl(&handle, &mut events, args.prompt_type).await?;
        }
    }

    handle.shutdown()?;
    task.await?;

    let after = metrics::RuntimeMetrics::capture();
    eprintln!("{}", before);
    eprintln!("{}", after);
    Ok(())
}

async fn repl(
    handle: &ConversationHandle,
    events: &mut broadcast::Receiver<ConversationEvent>,
    prompt_type: Option<PromptType>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                drain(events);
                handle.start_new_chat()?;
                render_until_settled(events).await?;
            }
            "/dismiss" => {
                handle.reset_state_after_error_intimation()?;
                print_status(handle).await?;
            }
            "/clear" => {
                handle.clear_model()?;
                eprintln!("model unloaded, /reload to load it again");
            }
            "/reload" => {
                drain(events);
                handle.handle_model_download_completed()?;
                render_until_settled(events).await?;
            }
            "/status" => print_status(handle).await?,
            "/help" => eprintln!("{}", HELP),
            text => submit(handle, events, text, prompt_type).await?,
        }
    }

    Ok(())
}

async fn submit(
    handle: &ConversationHandle,
    events: &mut broadcast::Receiver<ConversationEvent>,
    text: &str,
    prompt_type: Option<PromptType>,
) -> Result<()> {
    let snapshot = handle.snapshot().await?;
    if snapshot.interactions_disabled {
        match snapshot.state.inference_error() {
            Some(e) => eprintln!("{} Use /dismiss or /new.", e.failure_reason()),
            None if snapshot.remaining_tokens.is_exhausted() => {
                eprintln!("This chat is full. Use /new to start over.")
            }
            None => eprintln!("Not ready yet ({}).", snapshot.state),
        }
        return Ok(());
    }

    drain(events);
    match prompt_type {
        Some(prompt_type) => handle.send_prompt(text, prompt_type)?,
        None => handle.send_message(text)?,
    }
    render_until_settled(events).await
}

/// Prints the streamed response until the conversation settles in `Done`
/// or an error state.
async fn render_until_settled(events: &mut broadcast::Receiver<ConversationEvent>) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut current = None;
    let mut printed = 0;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "renderer fell behind");
                continue;
            }
            Err(RecvError::Closed) => anyhow::bail!("conversation controller stopped"),
        };

        match event {
            ConversationEvent::MessageAppended(message) if message.participant().is_system() => {
                if current.is_some() {
                    writeln!(stdout)?;
                }
                write!(stdout, "{}: {}", message.participant().title(), message.text())?;
                printed = message.text().len();
                current = Some(message.id());
            }
            ConversationEvent::MessageUpdated(message) if current == Some(message.id()) => {
                if let Some(delta) = message.text().get(printed..) {
                    write!(stdout, "{}", delta)?;
                }
                printed = message.text().len();
            }
            ConversationEvent::StateChanged(state) => match state {
                ConversationState::Done => {
                    if current.is_some() {
                        writeln!(stdout)?;
                    }
                    return Ok(());
                }
                ConversationState::CriticalError(e) | ConversationState::NonCriticalError(e) => {
                    if current.is_some() {
                        writeln!(stdout)?;
                    }
                    eprintln!("[{}] {}", e, e.failure_reason());
                    return Ok(());
                }
                _ => {}
            },
            _ => {}
        }
        stdout.flush()?;
    }
}

async fn print_status(handle: &ConversationHandle) -> Result<()> {
    let snapshot = handle.snapshot().await?;
    eprintln!(
        "state: {} | messages: {} | tokens left: {} | input {}",
        snapshot.state,
        snapshot.messages.len(),
        snapshot.remaining_tokens,
        if snapshot.interactions_disabled { "disabled" } else { "enabled" }
    );
    Ok(())
}

/// Discards events left over from earlier commands.
fn drain(events: &mut broadcast::Receiver<ConversationEvent>) {
    loop {
        match events.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
