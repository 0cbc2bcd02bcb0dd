//! Audio transcoding via the frame engine
//!
//! Same staging flow as video, minus the frame-count pre-pass: progress is
//! tracked in stream time against the `Duration:` the engine prints.

use crate::backend::{Converter, ProgressFn};
use crate::catalog::QualityParams;
use crate::engine::{exec_with_listener, FrameEngine, SharedEngine, WorkingFiles};
use crate::error::{ConvertError, Result};
use crate::ffmpeg::FfmpegCommand;
use crate::job::SourceFile;
use crate::progress::{LogProgress, Progress, ProgressStep};
use crate::validation::ResolvedSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct AudioConverter {
    engine: Arc<SharedEngine>,
}

impl AudioConverter {
    pub fn new(engine: Arc<SharedEngine>) -> Self {
        Self { engine }
    }

    async fn run(
        &self,
        engine: &dyn FrameEngine,
        files: &WorkingFiles,
        input: &SourceFile,
        settings: &ResolvedSettings,
        on_progress: &ProgressFn,
    ) -> Result<Bytes> {
        let args = audio_args(files, settings)?;

        on_progress(Progress::step(ProgressStep::Uploading));
        engine.write_file(&files.input, &input.data).await?;

        on_progress(Progress::step(ProgressStep::Preparing));
        let log = Arc::new(Mutex::new(LogProgress::timed()));
        let listener = {
            let on_progress = Arc::clone(on_progress);
            move |line: &str| {
                let event = log.lock().unwrap_or_else(|p| p.into_inner()).observe(line);
                if let Some(event) = event {
                    on_progress(event);
                }
            }
        };
        exec_with_listener(engine, &args, listener).await?;

        on_progress(Progress::step(ProgressStep::ReadingOutput));
        let data = engine.read_file(&files.output).await?;
        if data.is_empty() {
            return Err(ConvertError::Encode("engine produced an empty output".to_string()));
        }
        debug!(file = %input.name, bytes = data.len(), "Read converted audio");

        on_progress(Progress::step(ProgressStep::Done));
        Ok(Bytes::from(data))
    }
}

#[async_trait]
impl Converter for AudioConverter {
    async fn convert(
        &self,
        input: &SourceFile,
        settings: &ResolvedSettings,
        on_progress: ProgressFn,
    ) -> Result<Bytes> {
        let engine = self.engine.get().await?;
        let files = WorkingFiles::new(&input.name, &settings.format.extension);

        let result = self
            .run(engine.as_ref(), &files, input, settings, &on_progress)
            .await;
        files.cleanup(engine.as_ref()).await;
        result
    }
}

pub fn audio_args(files: &WorkingFiles, settings: &ResolvedSettings) -> Result<Vec<String>> {
    let quality: Vec<String> = match &settings.quality {
        QualityParams::Bitrate { bitrate } => vec!["-b:a".to_string(), bitrate.clone()],
        QualityParams::Engine { args, .. } => args.clone(),
        _ => {
            return Err(ConvertError::UnsupportedFormat(format!(
                "quality '{}' of {} is not an audio preset",
                settings.settings.quality,
                settings.format_key()
            )))
        }
    };

    Ok(FfmpegCommand::new()
        .input(&files.input)
        .args(&quality)
        .args(&settings.format.output_args)
        .output(&files.output)
        .into_args())
}
