//! Actor wrapper around [`ConversationController`].
//!
//! The controller lives on one task. UI commands and forwarded stream events
//! are multiplexed there, so state and the message log are only ever mutated
//! from that task.

use crate::controller::conversation::ConversationController;
use crate::models::ConversationSnapshot;
use crate::services::event_bus::{ConversationEvent, EventBus};
use crate::services::prompts::{render_prompt, PromptType};
use crate::utils::error::ConversationError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

enum Command {
    LoadModel,
    SendMessage(String),
    StartNewChat,
    ClearModel,
    ResetAfterError,
    DownloadCompleted,
    Snapshot(oneshot::Sender<ConversationSnapshot>),
    Shutdown,
}

#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl ConversationHandle {
    /// Moves `controller` onto its own task.
    pub fn spawn(controller: ConversationController) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let events = controller.event_bus();
        let task = tokio::spawn(run(controller, rx));
        (Self { commands, events }, task)
    }

    fn dispatch(&self, command: Command) -> Result<(), ConversationError> {
        self.commands
            .send(command)
            .map_err(|_| ConversationError::ControllerStopped)
    }

    pub fn load_model(&self) -> Result<(), ConversationError> {
        self.dispatch(Command::LoadModel)
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<(), ConversationError> {
        self.dispatch(Command::SendMessage(text.into()))
    }

    pub fn send_prompt(&self, context: &str, prompt_type: PromptType) -> Result<(), ConversationError> {
        self.send_message(render_prompt(context, prompt_type))
    }

    pub fn start_new_chat(&self) -> Result<(), ConversationError> {
        self.dispatch(Command::StartNewChat)
    }

    pub fn clear_model(&self) -> Result<(), ConversationError> {
        self.dispatch(Command::ClearModel)
    }

    pub fn reset_state_after_error_intimation(&self) -> Result<(), ConversationError> {
        self.dispatch(Command::ResetAfterError)
    }

    pub fn handle_model_download_completed(&self) -> Result<(), ConversationError> {
        self.dispatch(Command::DownloadCompleted)
    }

    pub async fn snapshot(&self) -> Result<ConversationSnapshot, ConversationError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ConversationError::ControllerStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) -> Result<(), ConversationError> {
        self.dispatch(Command::Shutdown)
    }
}

async fn run(mut controller: ConversationController, mut commands: mpsc::UnboundedReceiver<Command>) {
    info!(model = %controller.category(), "conversation controller started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => handle_command(&mut controller, command).await,
            },
            Some(event) = controller.next_stream_event() => controller.apply_stream_event(event),
        }
    }

    controller.shutdown();
    info!("conversation controller stopped");
}

async fn handle_command(controller: &mut ConversationController, command: Command) {
    match command {
        Command::LoadModel => controller.load_model().await,
        Command::SendMessage(text) => controller.send_message(&text),
        Command::StartNewChat => controller.start_new_chat(),
        Command::ClearModel => controller.clear_model(),
        Command::ResetAfterError => controller.reset_state_after_error_intimation(),
        Command::DownloadCompleted => controller.handle_model_download_completed().await,
        Command::Snapshot(reply) => {
            if reply.send(controller.snapshot()).is_err() {
                debug!("snapshot requester went away");
            }
        }
        Command::Shutdown => {}
    }
}
