//! Bundled llama-cpp backend
//!
//! Implements the [`Engine`] seam on top of llama-cpp-2.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`)
//! contain raw pointers that are not `Send`, so a dedicated worker
//! thread owns them for the lifetime of the engine. The trait methods
//! relay commands to the worker over channels and block on the reply;
//! generated tokens stream back as [`StreamToken`]s.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use crate::inference::engine::{
    Engine, EngineError, FragmentSink, GenerationParams, GenerationRequest, PromptInput,
};
use crate::inference::model::{find_model_file, validate_gguf};
use crate::inference::streaming::StreamToken;
use crate::types::Message;

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    RenderChat {
        messages: Vec<Message>,
        response_tx: Sender<Result<String, EngineError>>,
    },
    Generate {
        prompt: String,
        params: GenerationParams,
        token_tx: Sender<StreamToken>,
        stop: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Text inference engine backed by llama-cpp-2.
///
/// Construction loads the model eagerly; a failed load never leaves a
/// half-started worker behind. Multimodal prompts are rejected with
/// [`EngineError::Unsupported`] since this backend has no media towers.
pub struct LlamaCppEngine {
    /// Channel to send commands to the worker thread
    command_tx: Sender<WorkerCommand>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Model info captured at load time
    info: LoadedModelInfo,
}

impl LlamaCppEngine {
    /// Loads a GGUF model from the given model directory.
    ///
    /// # Arguments
    /// * `model_dir` - Directory containing the `.gguf` weights file
    /// * `gpu_layers` - Number of layers to offload to GPU (0 = CPU only)
    pub fn load(model_dir: &Path, gpu_layers: u32) -> Result<Self, EngineError> {
        let model_path = find_model_file(model_dir)?;

        // Validate the GGUF header before standing up the worker (just file I/O)
        let metadata = validate_gguf(&model_path)?;
        tracing::debug!(
            "GGUF validation passed for {:?} (v{}, {} tensors)",
            model_path,
            metadata.version,
            metadata.tensor_count
        );

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let path = model_path.clone();
        let worker_handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(path, gpu_layers, ready_tx, command_rx))
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        // Block until the worker reports the load outcome
        let info = ready_rx
            .recv()
            .map_err(|e| EngineError::Worker(e.to_string()))??;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            info.path,
            info.param_count,
            info.vocab_size,
            info.context_length
        );

        Ok(Self {
            command_tx,
            worker_handle: Some(worker_handle),
            info,
        })
    }

    /// Returns information about the loaded model
    pub fn info(&self) -> &LoadedModelInfo {
        &self.info
    }
}

impl Engine for LlamaCppEngine {
    fn render_chat(&self, messages: &[Message]) -> Result<String, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::RenderChat {
                messages: messages.to_vec(),
                response_tx,
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }

    fn generate(
        &self,
        request: GenerationRequest,
        sink: &mut dyn FragmentSink,
        stop: &Arc<AtomicBool>,
    ) -> Result<(), EngineError> {
        let prompt = match request.prompt {
            PromptInput::Text(text) => text,
            PromptInput::Multimodal(_) => {
                return Err(EngineError::Unsupported(
                    "multimodal prompts require an omni-capable backend".to_string(),
                ))
            }
        };

        let (token_tx, token_rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::Generate {
                prompt,
                params: request.params,
                token_tx,
                stop: Arc::clone(stop),
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        // Relay worker tokens into the caller's sink until the stream ends
        loop {
            match token_rx.recv() {
                Ok(StreamToken::Token(text)) => sink.push(&text),
                Ok(StreamToken::Done) => return Ok(()),
                Ok(StreamToken::Error(e)) => return Err(EngineError::Inference(e)),
                Err(_) => {
                    return Err(EngineError::Worker(
                        "token channel closed before completion".to_string(),
                    ))
                }
            }
        }
    }

    fn reset(&self) {
        // The context is rebuilt per generation; there is no engine-side
        // conversational state to clear.
        tracing::debug!("Engine reset: per-generation context, nothing to clear");
    }
}

impl Drop for LlamaCppEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands until
/// shutdown or channel closure.
fn worker_thread_main(
    model_path: PathBuf,
    gpu_layers: u32,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let backend = match LlamaBackend::init() {
        Ok(b) => b,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
            return;
        }
    };

    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = match LlamaModel::load_from_file(&backend, &model_path, &model_params) {
        Ok(m) => m,
        Err(e) => {
            let _ = ready_tx.send(Err(EngineError::ModelLoad(e.to_string())));
            return;
        }
    };

    let info = LoadedModelInfo {
        path: model_path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    if ready_tx.send(Ok(info)).is_err() {
        // Caller went away during load
        return;
    }

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::RenderChat {
                messages,
                response_tx,
            }) => {
                let _ = response_tx.send(render_chat_prompt(&model, &messages));
            }
            Ok(WorkerCommand::Generate {
                prompt,
                params,
                token_tx,
                stop,
            }) => {
                if let Err(e) = run_generation(&backend, &model, &prompt, params, &token_tx, &stop)
                {
                    let _ = token_tx.send(StreamToken::Error(e));
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Render a message sequence through the model's chat template.
///
/// Models without a usable template fall back to a plain transcript
/// rendering so generation still has something sensible to work with.
fn render_chat_prompt(model: &LlamaModel, messages: &[Message]) -> Result<String, EngineError> {
    let chat: Result<Vec<LlamaChatMessage>, _> = messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect();
    let chat = chat.map_err(|e| EngineError::Template(e.to_string()))?;

    match model.chat_template(None) {
        Ok(template) => model
            .apply_chat_template(&template, &chat, true)
            .map_err(|e| EngineError::Template(e.to_string())),
        Err(e) => {
            tracing::warn!("Chat template not available, using plain rendering: {e}");
            let mut prompt = String::new();
            for m in messages {
                prompt.push_str(m.role.as_str());
                prompt.push_str(": ");
                prompt.push_str(&m.content);
                prompt.push('\n');
            }
            prompt.push_str("assistant: ");
            Ok(prompt)
        }
    }
}

/// Run text generation (called from worker thread)
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    params: GenerationParams,
    tx: &Sender<StreamToken>,
    stop: &Arc<AtomicBool>,
) -> Result<(), String> {
    // Create context for this generation, capped at the model's trained length
    let n_ctx = std::cmp::min(params.max_context_size, model.n_ctx_train());
    let n_ctx = std::cmp::max(n_ctx, 2048); // Minimum 2K context

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(512);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    // Tokenize the prompt
    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;

    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    run_inference(&mut ctx, model, tokens, params, tx, stop)
}

/// Build the sampler chain for one generation.
///
/// Repetition penalties sit ahead of the chain in both paths. The
/// n-gram penalty setting maps onto the frequency-penalty term, the
/// closest knob this backend exposes.
fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    let freq_penalty = (params.ngram_penalty.max(1.0) - 1.0).max(0.0);
    let penalties = LlamaSampler::penalties(64, params.repeat_penalty, freq_penalty, 0.0);

    if params.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()])
    } else {
        let seed = if params.seed == 0 {
            rand_seed()
        } else {
            params.seed
        };
        LlamaSampler::chain_simple([
            penalties,
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    }
}

/// Runs the inference loop
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<llama_cpp_2::token::LlamaToken>,
    params: GenerationParams,
    tx: &Sender<StreamToken>,
    stop: &Arc<AtomicBool>,
) -> Result<(), String> {
    // Create batch and add prompt tokens
    let mut batch = LlamaBatch::new(512, 1);

    for (i, token) in prompt_tokens.iter().enumerate() {
        let is_last = i == prompt_tokens.len() - 1;
        batch
            .add(*token, i as i32, &[0], is_last)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
    }

    // Process prompt
    ctx.decode(&mut batch)
        .map_err(|e| format!("Failed to decode prompt: {}", e))?;

    let mut sampler = build_sampler(&params);
    let mut n_decoded = prompt_tokens.len() as i32;

    // Carry buffer so emitted fragments always land on UTF-8 boundaries
    let mut utf8_buffer: Vec<u8> = Vec::new();

    // Generation loop
    for _ in 0..params.max_tokens {
        // Cancellation is cooperative: the flag is polled once per step
        if stop.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped by cancellation signal");
            break;
        }

        // Sample next token
        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        // Check for end of generation
        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;

        utf8_buffer.extend_from_slice(&token_bytes);

        // Emit the longest valid UTF-8 prefix, keep the incomplete tail
        let valid_len = match std::str::from_utf8(&utf8_buffer) {
            Ok(_) => utf8_buffer.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_len > 0 {
            let chunk = String::from_utf8_lossy(&utf8_buffer[..valid_len]).into_owned();
            utf8_buffer.drain(..valid_len);
            if !chunk.is_empty() && tx.send(StreamToken::Token(chunk)).is_err() {
                // Receiver dropped, stop generation
                tracing::debug!("Receiver dropped, stopping generation");
                break;
            }
        }

        // Prepare batch for next iteration
        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;

        // Decode
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;

        n_decoded += 1;
    }

    // Flush whatever remains in the carry buffer
    if !utf8_buffer.is_empty() {
        let tail = String::from_utf8_lossy(&utf8_buffer).into_owned();
        if !tail.is_empty() {
            let _ = tx.send(StreamToken::Token(tail));
        }
    }

    // Send done signal
    let _ = tx.send(StreamToken::Done);

    Ok(())
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
