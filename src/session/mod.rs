//! Session lifecycle
//!
//! [`ModelSession`] owns the engine, serializes lifecycle operations,
//! and coordinates cancellation against in-flight generation. The
//! session lock guards only short state transitions; it is never held
//! across a blocking engine call.

pub mod bridge;
pub mod sink;

// Re-export main types for convenience
pub use bridge::{CallbackBridge, ChatObserver};
pub use sink::StreamSink;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use thiserror::Error;
use uuid::Uuid;

use crate::config;
use crate::inference::{
    resolve_config_source, EngineError, EngineHandle, GenerationParams, GenerationRequest,
    LlamaCppEngine, ModelError, PromptInput,
};
use crate::prompt::{extract, normalize_history, MultimodalPrompt};
use crate::truncate_str;
use crate::types::Message;

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Model configuration error: {0}")]
    Config(#[from] ModelError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Session is not initialized")]
    NotInitialized,

    #[error("A generation is already in flight")]
    Busy,

    #[error("Session has been released")]
    Released,
}

/// Where the session currently sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Ready,
    Generating,
    Released,
}

/// Control handle for one in-flight generation task
struct GenerationHandle {
    id: Uuid,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl GenerationHandle {
    fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// What a generation task starts from
enum TaskInput {
    /// Normalized turns, rendered through the engine's chat template
    Turns(Vec<Message>),
    /// A preprocessed multimodal prompt, handed to the engine as-is
    Multimodal(MultimodalPrompt),
}

struct SessionState {
    engine: Option<EngineHandle>,
    bridge: Option<CallbackBridge>,
    transcript: Vec<Message>,
    params: GenerationParams,
    active: Option<GenerationHandle>,
    /// Bumped by reset/release/init so a stale task won't write back
    /// into a transcript it no longer belongs to
    epoch: u64,
    loading: bool,
    released: bool,
}

/// A streaming chat session around a shared inference engine.
///
/// Clones share state. Lifecycle: `Uninitialized → Ready ⇄ Generating`,
/// with `Released` terminal. `chat_*` calls return immediately; output
/// arrives through the registered [`ChatObserver`]. At most one
/// generation is in flight at a time; a second call fails with
/// [`SessionError::Busy`].
#[derive(Clone)]
pub struct ModelSession {
    inner: Arc<Mutex<SessionState>>,
}

impl ModelSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionState {
                engine: None,
                bridge: None,
                transcript: Vec::new(),
                params: GenerationParams::default(),
                active: None,
                epoch: 0,
                loading: false,
                released: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialize the session from a model directory.
    ///
    /// Resolves the configuration source (engine-specific config file,
    /// then generic config file, then the bare directory), loads the
    /// bundled backend, and applies the default sampling configuration
    /// merged with any overrides found in the config file. Valid from
    /// `Uninitialized` or `Ready`; re-init replaces the engine and
    /// starts a fresh conversation.
    pub fn init(&self, model_dir: &Path) -> Result<(), SessionError> {
        {
            let mut state = self.lock();
            if state.released {
                return Err(SessionError::Released);
            }
            if state.loading || state.active.as_ref().is_some_and(|a| !a.is_finished()) {
                return Err(SessionError::Busy);
            }
            state.loading = true;
        }

        // Engine construction can block for seconds; the session lock
        // is not held for it.
        let loaded = load_engine(model_dir);

        let mut state = self.lock();
        state.loading = false;
        match loaded {
            Ok((engine, params)) => {
                if state.released {
                    return Err(SessionError::Released);
                }
                state.engine = Some(engine);
                state.params = params;
                state.transcript.clear();
                state.epoch += 1;
                tracing::info!("Session initialized from {}", model_dir.display());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Session init failed: {e}");
                Err(e)
            }
        }
    }

    /// Install a caller-constructed engine, replacing any current one.
    ///
    /// This is the seam for hosts that bring their own backend; `init`
    /// is a convenience wrapper around it for the bundled one.
    pub fn install_engine(&self, engine: EngineHandle) -> Result<(), SessionError> {
        let mut state = self.lock();
        if state.released {
            return Err(SessionError::Released);
        }
        if state.loading || state.active.as_ref().is_some_and(|a| !a.is_finished()) {
            return Err(SessionError::Busy);
        }
        state.engine = Some(engine);
        state.transcript.clear();
        state.epoch += 1;
        Ok(())
    }

    /// Replace the sampling parameters used for subsequent chats
    pub fn set_params(&self, params: GenerationParams) {
        self.lock().params = params;
    }

    /// Send a free-text prompt.
    ///
    /// Inline `<img>`/`<audio>` tags switch the call onto the
    /// multimodal path; otherwise the full conversation history is
    /// rendered through the engine's chat template. Returns as soon as
    /// the generation task is launched.
    pub fn chat_text(
        &self,
        text: &str,
        observer: &Arc<dyn ChatObserver>,
    ) -> Result<(), SessionError> {
        let (prompt, has_multimodal) = extract(text);

        let mut state = self.lock();
        self.begin_chat(&mut state, observer)?;

        state.transcript.push(Message::user(prompt.template.clone()));
        let input = if has_multimodal {
            TaskInput::Multimodal(prompt)
        } else {
            TaskInput::Turns(normalize_history(&state.transcript))
        };

        if let Err(e) = self.spawn_generation(&mut state, input) {
            state.transcript.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Send an explicit turn sequence, replacing the session transcript.
    ///
    /// The sequence is normalized (default system turn injected when
    /// missing) before rendering.
    pub fn chat_turns(
        &self,
        turns: &[Message],
        observer: &Arc<dyn ChatObserver>,
    ) -> Result<(), SessionError> {
        let mut state = self.lock();
        self.begin_chat(&mut state, observer)?;

        state.transcript = normalize_history(turns);
        let input = TaskInput::Turns(state.transcript.clone());
        self.spawn_generation(&mut state, input)
    }

    /// Cancel any in-flight generation and clear the conversation.
    ///
    /// The engine survives a reset; only conversational state goes.
    /// Before a successful `init` this is a no-op with a diagnostic.
    pub fn reset(&self) {
        let engine = {
            let mut state = self.lock();
            if state.released {
                tracing::warn!("reset called on a released session");
                return;
            }
            let Some(engine) = state.engine.clone() else {
                tracing::warn!("reset called before init");
                return;
            };
            if let Some(active) = &state.active {
                if !active.is_finished() {
                    tracing::info!(id = %active.id, "Cancelling in-flight generation for reset");
                    active.cancel();
                }
            }
            state.transcript.clear();
            state.epoch += 1;
            engine
        };

        // Engine-side clear happens outside the session lock
        engine.reset();
    }

    /// Tear the session down. Terminal: no operation succeeds afterwards.
    ///
    /// The engine reference is swapped out atomically; an in-flight
    /// generation task keeps its own shared reference and winds down at
    /// its next stop-flag check. The callback registration is revoked,
    /// so any notification the task still produces (fragments and the
    /// terminal one alike) is silently dropped.
    pub fn release(&self) {
        let (engine, bridge) = {
            let mut state = self.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.epoch += 1;
            if let Some(active) = &state.active {
                if !active.is_finished() {
                    tracing::info!(id = %active.id, "Cancelling in-flight generation for release");
                    active.cancel();
                }
            }
            state.transcript.clear();
            (state.engine.take(), state.bridge.take())
        };

        if let Some(bridge) = bridge {
            bridge.revoke();
        }
        drop(engine);
        tracing::info!("Session released");
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        let state = self.lock();
        if state.released {
            SessionPhase::Released
        } else if state.engine.is_none() {
            SessionPhase::Uninitialized
        } else if state.active.as_ref().is_some_and(|a| !a.is_finished()) {
            SessionPhase::Generating
        } else {
            SessionPhase::Ready
        }
    }

    /// Whether a generation is currently in flight
    pub fn is_generating(&self) -> bool {
        self.phase() == SessionPhase::Generating
    }

    /// Snapshot of the current conversation transcript
    pub fn transcript(&self) -> Vec<Message> {
        self.lock().transcript.clone()
    }

    /// Validate session state for a chat call and register the observer
    /// on first use. The registration is kept until `release`.
    fn begin_chat(
        &self,
        state: &mut SessionState,
        observer: &Arc<dyn ChatObserver>,
    ) -> Result<(), SessionError> {
        if state.released {
            return Err(SessionError::Released);
        }
        if state.engine.is_none() {
            tracing::warn!("chat called before init");
            return Err(SessionError::NotInitialized);
        }
        if state.loading || state.active.as_ref().is_some_and(|a| !a.is_finished()) {
            return Err(SessionError::Busy);
        }
        if state.bridge.is_none() {
            state.bridge = Some(CallbackBridge::new(observer));
            tracing::debug!("Observer registered");
        }
        Ok(())
    }

    /// Launch the generation task for `input`. Called with the session
    /// lock held; the task itself runs without it.
    fn spawn_generation(
        &self,
        state: &mut SessionState,
        input: TaskInput,
    ) -> Result<(), SessionError> {
        let engine = state.engine.clone().ok_or(SessionError::NotInitialized)?;
        let bridge = state.bridge.clone().ok_or(SessionError::NotInitialized)?;
        let params = state.params.clone();
        let epoch = state.epoch;
        let id = Uuid::new_v4();

        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let session = Arc::downgrade(&self.inner);

        let task_stop = Arc::clone(&stop);
        let task_done = Arc::clone(&done);
        thread::Builder::new()
            .name(format!("generation-{id}"))
            .spawn(move || {
                run_generation_task(
                    engine, bridge, input, params, task_stop, task_done, session, epoch, id,
                )
            })
            .map_err(|e| SessionError::Engine(EngineError::Worker(e.to_string())))?;

        state.active = Some(GenerationHandle { id, stop, done });
        tracing::info!(%id, "Generation task started");
        Ok(())
    }
}

impl Default for ModelSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve configuration and construct the bundled backend.
fn load_engine(model_dir: &Path) -> Result<(EngineHandle, GenerationParams), SessionError> {
    let source = resolve_config_source(model_dir)?;

    let settings = config::load_settings();
    let mut params = settings.generation_params();
    if let Some(config_file) = source.config_file() {
        match config::SamplingOverrides::from_file(config_file) {
            Ok(overrides) => overrides.apply(&mut params),
            Err(e) => tracing::warn!("Ignoring unreadable config overrides: {e}"),
        }
    }

    let engine = LlamaCppEngine::load(model_dir, settings.gpu_layers)?;
    Ok((Arc::new(engine), params))
}

/// Body of one generation task.
///
/// Engine failures (including panics) end the task without propagating
/// anywhere; the terminal notification still fires with whatever text
/// accumulated. The transcript write-back is skipped when a
/// reset/release bumped the epoch mid-flight.
#[allow(clippy::too_many_arguments)]
fn run_generation_task(
    engine: EngineHandle,
    bridge: CallbackBridge,
    input: TaskInput,
    params: GenerationParams,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    session: Weak<Mutex<SessionState>>,
    epoch: u64,
    id: Uuid,
) {
    let mut sink = StreamSink::new(bridge.clone());

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), EngineError> {
        let prompt = match input {
            TaskInput::Turns(messages) => {
                let rendered = engine.render_chat(&messages)?;
                tracing::debug!(%id, "Rendered prompt: {}", truncate_str(&rendered, 120));
                PromptInput::Text(rendered)
            }
            TaskInput::Multimodal(prompt) => PromptInput::Multimodal(prompt),
        };
        engine.generate(GenerationRequest { prompt, params }, &mut sink, &stop)
    }));

    match &outcome {
        Ok(Ok(())) => tracing::debug!(%id, "Generation completed"),
        Ok(Err(e)) => tracing::error!(%id, "Generation failed: {e}"),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(%id, "Generation panicked: {msg}");
        }
    }

    let text = sink.into_text();

    // Write back and mark finished before notifying, so an observer
    // reacting to the terminal sees a Ready session.
    if let Some(inner) = session.upgrade() {
        let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.epoch == epoch && !text.is_empty() {
            state.transcript.push(Message::assistant(text.clone()));
        }
        done.store(true, Ordering::SeqCst);
    } else {
        done.store(true, Ordering::SeqCst);
    }

    bridge.notify_finished(&text);
}
