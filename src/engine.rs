//! Frame engine contract and its process-wide shared instance
//!
//! A frame engine is an opaque transcoder with a private working namespace:
//! files are written into it, a command runs against them, results are read
//! back. The only progress signal it offers is its log stream, published on a
//! [`LogBus`]. Listeners are scoped to one operation through
//! [`LogSubscription`] guards, so sequential jobs reusing the same engine never
//! see each other's lines.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("FFmpeg not found: {0}")]
    NotInstalled(String),

    #[error("Engine failed to load: {0}")]
    Load(String),

    #[error("Engine command failed: {0}")]
    ExecutionFailed(String),

    #[error("Working file not found: {0}")]
    MissingFile(String),

    #[error("Invalid working file name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Fan-out of engine log lines to the listeners of the running operation
#[derive(Default)]
pub struct LogBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl LogBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `listener` until the returned guard is dropped
    pub fn subscribe(self: &Arc<Self>, listener: impl Fn(&str) + Send + Sync + 'static) -> LogSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(listener)));
        LogSubscription {
            bus: Arc::clone(self),
            id,
        }
    }

    pub fn emit(&self, line: &str) {
        // Listeners run outside the lock so they may subscribe or drop guards
        let listeners: Vec<Listener> = self.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(line);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(listener_id, _)| *listener_id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deregisters its listener on drop
pub struct LogSubscription {
    bus: Arc<LogBus>,
    id: u64,
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[async_trait]
pub trait FrameEngine: Send + Sync {
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError>;

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError>;

    async fn delete_file(&self, name: &str) -> Result<(), EngineError>;

    /// Run one command; log lines go to [`FrameEngine::log_bus`] while it runs
    async fn exec(&self, args: &[String]) -> Result<(), EngineError>;

    fn log_bus(&self) -> &Arc<LogBus>;
}

/// Run `args` with `listener` attached for this command only.
///
/// The subscription guard lives on this stack frame, so the listener is gone
/// once the command settles whichever way it ends.
pub async fn exec_with_listener(
    engine: &dyn FrameEngine,
    args: &[String],
    listener: impl Fn(&str) + Send + Sync + 'static,
) -> Result<(), EngineError> {
    let _subscription = engine.log_bus().subscribe(listener);
    engine.exec(args).await
}

#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn FrameEngine>, EngineError>;
}

/// Lazily loaded engine shared by every conversion in the process.
///
/// Concurrent callers of [`SharedEngine::get`] wait on the same load. A failed
/// load leaves the slot empty so the next caller tries again.
pub struct SharedEngine {
    loader: Box<dyn EngineLoader>,
    slot: tokio::sync::Mutex<Option<Arc<dyn FrameEngine>>>,
    load_attempts: AtomicU64,
}

impl SharedEngine {
    pub fn new(loader: impl EngineLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slot: tokio::sync::Mutex::new(None),
            load_attempts: AtomicU64::new(0),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn FrameEngine>, EngineError> {
        let mut slot = self.slot.lock().await;
        if let Some(engine) = slot.as_ref() {
            debug!("Reusing loaded conversion engine");
            return Ok(Arc::clone(engine));
        }

        let attempt = self.load_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(attempt, "Loading conversion engine");
        match self.loader.load().await {
            Ok(engine) => {
                *slot = Some(Arc::clone(&engine));
                info!("Conversion engine ready");
                Ok(engine)
            }
            Err(e) => {
                warn!(attempt, "Conversion engine failed to load: {}", e);
                Err(e)
            }
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Drop the loaded engine; the next `get` loads a fresh one
    pub async fn reset(&self) {
        *self.slot.lock().await = None;
    }

    pub fn load_attempts(&self) -> u64 {
        self.load_attempts.load(Ordering::Relaxed)
    }
}

/// Collision-free input/output names in the engine's working namespace
#[derive(Debug, Clone)]
pub struct WorkingFiles {
    pub input: String,
    pub output: String,
}

impl WorkingFiles {
    pub fn new(source_name: &str, output_extension: &str) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        let input_extension = crate::classify::extension_of(source_name)
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".to_string());
        Self {
            input: format!("input_{}.{}", token, input_extension),
            output: format!("output_{}.{}", token, output_extension),
        }
    }

    /// Delete both entries. Missing files are expected after early failures;
    /// anything else is logged and swallowed.
    pub async fn cleanup(&self, engine: &dyn FrameEngine) {
        for name in [&self.input, &self.output] {
            match engine.delete_file(name).await {
                Ok(()) => debug!(file = %name, "Removed working file"),
                Err(EngineError::MissingFile(_)) => {}
                Err(e) => warn!(file = %name, "Failed to remove working file: {}", e),
            }
        }
    }
}
