//! LlamaCpp backend - llama.cpp bindings behind the engine contracts
//!
//! A session keeps the running transcript and re-renders it with the model's
//! chat template on every turn. Generation runs on a dedicated thread and
//! hands UTF-8 chunks back through a channel.

use crate::backend::{ChatMessage, EngineSession, InferenceBackend, LoadedModel, ResponseStream};
use crate::error::{EngineError, Result};
use crate::model::GenerationConfig;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// System and penalty options for the llama.cpp backend.
///
/// Sampling (temperature, top-k, top-p) comes from the session's
/// [`GenerationConfig`], and the context length from the model's `max_tokens`.
#[derive(Debug, Clone)]
pub struct LlamaCppOptions {
    /// Jumlah thread untuk decoding (generasi token per token).
    /// Disarankan: 50-75% dari physical cores.
    pub threads: Option<i32>,

    /// Jumlah thread untuk prefill (prompt processing) dan batching.
    pub threads_batch: Option<i32>,

    /// Logical batch size. Raised to the context length when smaller,
    /// so a full prompt always fits one prefill batch.
    pub batch_size: usize,

    /// Physical batch size (sub-batch yang dieksekusi per step).
    pub ubatch_size: usize,

    /// Fixed RNG seed for reproducible sampling.
    pub seed: u32,

    /// Kunci model di RAM agar tidak kena swap ke disk.
    pub use_mlock: bool,

    /// Drop tokens whose probability is below `min_p` times the best token's.
    pub min_p: f32,

    /// 1.0 disables the multiplicative repeat penalty.
    pub repeat_penalty: f32,

    /// Lookback window for penalties.
    pub repeat_last_n: i32,

    pub frequency_penalty: f32,

    pub presence_penalty: f32,
}

impl Default for LlamaCppOptions {
    fn default() -> Self {
        Self {
            threads: Some(4),
            threads_batch: Some(4),
            batch_size: 1024,
            ubatch_size: 512,

            seed: 1234,
            use_mlock: false,

            min_p: 0.05,

            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// On-device inference backend using llama.cpp
pub struct LlamaCppEngine {
    backend: Arc<LlamaBackend>,
    opts: LlamaCppOptions,
}

impl LlamaCppEngine {
    /// Initialize the llama.cpp backend. Only one engine may exist per process.
    pub fn new(opts: LlamaCppOptions) -> Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::BackendInit(format!("failed to init llama backend: {e}")))?;
        info!("LlamaCpp backend initialized");
        Ok(Self {
            backend: Arc::new(backend),
            opts,
        })
    }
}

#[async_trait::async_trait]
impl InferenceBackend for LlamaCppEngine {
    async fn load_model(&self, path: &Path, max_tokens: u32) -> Result<Arc<dyn LoadedModel>> {
        let backend = self.backend.clone();
        let opts = self.opts.clone();
        let path = path.to_path_buf();

        let model = tokio::task::spawn_blocking(move || {
            LlamaLoadedModel::load(backend, opts, &path, max_tokens)
        })
        .await
        .map_err(|e| EngineError::ModelLoad(format!("load task failed: {e}")))??;

        Ok(Arc::new(model))
    }
}

fn gen_err(stage: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Generation(format!("{stage}: {e}"))
}

struct LlamaLoadedModel {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    opts: LlamaCppOptions,
    max_tokens: u32,
}

impl LlamaLoadedModel {
    fn load(
        backend: Arc<LlamaBackend>,
        opts: LlamaCppOptions,
        path: &Path,
        max_tokens: u32,
    ) -> Result<Self> {
        let t0 = Instant::now();
        info!("loading GGUF model: {}", path.display());

        let mut model_params = LlamaModelParams::default();
        if opts.use_mlock {
            model_params = model_params.with_use_mlock(true);
        }
        let model_params = pin!(model_params);

        let model = LlamaModel::load_from_file(&backend, path, &model_params).map_err(|e| {
            EngineError::ModelLoad(format!("failed to load model {}: {e}", path.display()))
        })?;

        info!("model loaded in {} ms", t0.elapsed().as_millis());

        Ok(Self {
            backend,
            model,
            opts,
            max_tokens,
        })
    }

    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String> {
        let chat_messages: Vec<LlamaChatMessage> = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::QueryRejected(format!("invalid chat message: {:?}", e)))?;

        let template = self
            .model
            .chat_template(None)
            .map_err(|e| EngineError::Generation(format!("failed to get chat template: {:?}", e)))?;

        self.model
            .apply_chat_template(&template, &chat_messages, true)
            .map_err(|e| EngineError::Generation(format!("failed to apply chat template: {:?}", e)))
    }

    /// Generate until end-of-generation or a full context window.
    /// Callback receives each decoded piece and returns false to abort.
    fn generate_with_callback<F>(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        mut callback: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(String) -> bool,
    {
        let t_start = Instant::now();

        let ctx_size = NonZeroU32::new(self.max_tokens)
            .ok_or_else(|| EngineError::Generation("context length must be non-zero".to_string()))?;
        let n_batch = self.opts.batch_size.max(self.max_tokens as usize);

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(ctx_size))
            .with_n_batch(n_batch as u32)
            .with_n_ubatch(self.opts.ubatch_size as u32);

        if let Some(threads) = self.opts.threads {
            ctx_params = ctx_params.with_n_threads(threads);
        }
        if let Some(threads_batch) = self.opts.threads_batch.or(self.opts.threads) {
            ctx_params = ctx_params.with_n_threads_batch(threads_batch);
        }

        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| gen_err("failed to create context", e))?;

        let tokens_list = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        let n_ctx = self.max_tokens as i32;
        if tokens_list.is_empty() || tokens_list.len() as i32 >= n_ctx {
            return Err(EngineError::Generation(format!(
                "prompt of {} tokens does not fit a context of {}",
                tokens_list.len(),
                n_ctx
            )));
        }
        debug!("prompt tokens: {}", tokens_list.len());

        let mut batch = LlamaBatch::new(n_batch, 1);
        let last_index = (tokens_list.len() - 1) as i32;
        for (i, token) in (0_i32..).zip(tokens_list.iter()) {
            batch
                .add(*token, i, &[0], i == last_index)
                .map_err(|e| gen_err("batch add failed", e))?;
        }

        ctx.decode(&mut batch)
            .map_err(|e| gen_err("prefill decode failed", e))?;
        let prefill_ms = t_start.elapsed().as_millis();

        let mut n_cur = batch.n_tokens();
        let mut n_decode = 0;
        let mut output = String::new();

        let t_gen_start = Instant::now();
        let mut first_token_time: Option<u128> = None;
        let mut decoder = encoding_rs::UTF_8.new_decoder();

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::penalties(
                self.opts.repeat_last_n,
                self.opts.repeat_penalty,
                self.opts.frequency_penalty,
                self.opts.presence_penalty,
            ),
            LlamaSampler::top_k(config.top_k),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::min_p(self.opts.min_p, 1),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(self.opts.seed),
        ]);

        while n_cur < n_ctx {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);

            if first_token_time.is_none() {
                first_token_time = Some(t_start.elapsed().as_millis());
            }

            if self.model.is_eog_token(token) {
                break;
            }

            let output_bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| gen_err("detokenize failed", e))?;
            let mut token_str = String::with_capacity(32);
            let _ = decoder.decode_to_string(&output_bytes, &mut token_str, false);

            output.push_str(&token_str);

            if !token_str.is_empty() && !callback(token_str) {
                debug!("generation aborted by consumer");
                break;
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| gen_err("batch add failed", e))?;

            n_cur += 1;
            ctx.decode(&mut batch)
                .map_err(|e| gen_err("decode failed", e))?;
            n_decode += 1;
        }

        let total_ms = t_start.elapsed().as_millis();
        let gen_ms = t_gen_start.elapsed().as_millis();
        let tokens_per_sec = if gen_ms > 0 {
            (n_decode as f32) / (gen_ms as f32 / 1000.0)
        } else {
            0.0
        };

        Ok(GenerationResult {
            output,
            tokens_generated: n_decode,
            prefill_ms,
            first_token_ms: first_token_time.unwrap_or(0),
            total_ms,
            tokens_per_sec,
        })
    }
}

impl LoadedModel for LlamaLoadedModel {
    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn create_session(self: Arc<Self>, config: GenerationConfig) -> Result<Box<dyn EngineSession>> {
        Ok(Box::new(LlamaSession {
            model: self,
            config,
            transcript: Arc::new(Mutex::new(Vec::new())),
            pending: String::new(),
        }))
    }
}

struct LlamaSession {
    model: Arc<LlamaLoadedModel>,
    config: GenerationConfig,
    transcript: Arc<Mutex<Vec<ChatMessage>>>,
    pending: String,
}

impl EngineSession for LlamaSession {
    fn append_prompt(&mut self, text: &str) -> Result<()> {
        self.pending.push_str(text);
        Ok(())
    }

    fn stream_response(&mut self) -> Result<ResponseStream> {
        let prompt = std::mem::take(&mut self.pending);
        let model = self.model.clone();
        let config = self.config;
        let transcript = self.transcript.clone();

        let rx = with_user_turn(&self.transcript, prompt, |messages| {
            let rendered = model.apply_chat_template(&messages)?;
            let (tx, rx) = mpsc::unbounded_channel::<Result<String>>();

            std::thread::Builder::new()
                .name("llama-generate".to_string())
                .spawn(move || {
                    let mut delivered = String::new();
                    let result = model.generate_with_callback(&rendered, &config, |token| {
                        delivered.push_str(&token);
                        tx.send(Ok(token)).is_ok()
                    });

                    match result {
                        Ok(result) => {
                            info!("{}", result);
                            transcript.lock().push(ChatMessage::assistant(result.output));
                        }
                        Err(e) => {
                            warn!("generation failed: {}", e);
                            // keep user/assistant alternation for the next turn
                            transcript.lock().push(ChatMessage::assistant(delivered));
                            let _ = tx.send(Err(e));
                        }
                    }
                })?;
            Ok(rx)
        })?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    fn size_in_tokens(&self, text: &str) -> Result<usize> {
        self.model
            .model
            .str_to_token(text, AddBos::Never)
            .map(|tokens| tokens.len())
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }
}

/// Result of text generation
#[derive(Debug)]
pub struct GenerationResult {
    pub output: String,
    pub tokens_generated: i32,
    pub prefill_ms: u128,
    pub first_token_ms: u128,
    pub total_ms: u128,
    pub tokens_per_sec: f32,
}

impl std::fmt::Display for GenerationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[metrics] prefill: {} ms, ftl: {} ms, tokens: {}, time: {} ms, speed: {:.2} tok/s",
            self.prefill_ms, self.first_token_ms, self.tokens_generated, self.total_ms, self.tokens_per_sec
        )
    }
}

/// Pushes the user turn and hands the transcript to `start`. The turn is
/// rolled back when `start` fails so the transcript never holds two user
/// messages in a row.
fn with_user_turn<T>(
    transcript: &Mutex<Vec<ChatMessage>>,
    prompt: String,
    start: impl FnOnce(Vec<ChatMessage>) -> Result<T>,
) -> Result<T> {
    let messages = {
        let mut transcript = transcript.lock();
        transcript.push(ChatMessage::user(prompt));
        transcript.clone()
    };

    start(messages).inspect_err(|_| {
        transcript.lock().pop();
    })
}
