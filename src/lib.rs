//! ezconvert - batch media conversion queue
//!
//! Accepts video, image and audio files, runs them one at a time through a
//! conversion backend and tracks per-file progress scraped from the engine's
//! log output. Video and audio shell out to the system `ffmpeg` binary (no
//! linking); images are resampled and re-encoded in process.

pub mod audio;
pub mod backend;
pub mod catalog;
pub mod classify;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod handle;
pub mod image;
pub mod job;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod resolution;
pub mod service;
pub mod validation;
pub mod video;

pub use backend::{Backends, Converter, ProgressFn};
pub use catalog::{Catalog, ConversionSettings};
pub use classify::{classify, MediaCategory};
pub use engine::{EngineError, EngineLoader, FrameEngine, SharedEngine};
pub use error::{ConvertError, Result};
pub use ffmpeg::{FfmpegEngine, FfmpegLoader};
pub use handle::HandleId;
pub use job::{Download, JobId, JobSnapshot, JobStatus, QueueSnapshot, SourceFile};
pub use metrics::MetricsSnapshot;
pub use progress::{Progress, ProgressStep};
pub use queue::JobQueue;
pub use resolution::{target_dimensions, Bound};
pub use service::{QueueHandle, QueueService};
