//! Video conversion via the frame engine

use crate::backend::{Converter, ProgressFn};
use crate::catalog::QualityParams;
use crate::engine::{exec_with_listener, FrameEngine, SharedEngine, WorkingFiles};
use crate::error::{ConvertError, Result};
use crate::ffmpeg::FfmpegCommand;
use crate::job::SourceFile;
use crate::progress::{LogProgress, Progress, ProgressStep};
use crate::resolution::{even_target_dimensions, Bound};
use crate::validation::ResolvedSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What the frame-count pre-pass learned about the input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoProbe {
    pub total_frames: Option<u64>,
    pub dimensions: Option<(u32, u32)>,
}

pub struct VideoConverter {
    engine: Arc<SharedEngine>,
}

impl VideoConverter {
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
        on_progress(Progress::step(ProgressStep::Uploading));
        engine.write_file(&files.input, &input.data).await?;

        on_progress(Progress::step(ProgressStep::CountingFrames));
        let probe = count_frames(engine, &files.input, on_progress).await;
        match probe.total_frames {
            Some(total) => {
                info!(file = %input.name, total, "Counted frames");
                on_progress(
                    Progress::step(ProgressStep::Preparing).with_detail(format!("{} frames total", total)),
                );
            }
            None => on_progress(Progress::step(ProgressStep::Preparing)),
        }

        let args = video_args(files, settings, probe)?;
        let log = Arc::new(Mutex::new(LogProgress::frames(probe.total_frames)));
        let listener = {
            let log = Arc::clone(&log);
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
        debug!(file = %input.name, bytes = data.len(), "Read converted output");

        on_progress(Progress::step(ProgressStep::Done));
        Ok(Bytes::from(data))
    }
}

#[async_trait]
impl Converter for VideoConverter {
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

/// Count frames by remuxing the first video stream to a null sink.
///
/// Best effort: a failed pre-pass only means the total stays unknown.
pub async fn count_frames(engine: &dyn FrameEngine, input: &str, on_progress: &ProgressFn) -> VideoProbe {
    let args = FfmpegCommand::new()
        .input(input)
        .args(&["-map", "0:v:0", "-c", "copy", "-f", "null", "-"])
        .into_args();

    let log = Arc::new(Mutex::new(LogProgress::frame_count()));
    let listener = {
        let log = Arc::clone(&log);
        let on_progress = Arc::clone(on_progress);
        move |line: &str| {
            let event = log.lock().unwrap_or_else(|p| p.into_inner()).observe(line);
            if let Some(event) = event {
                on_progress(event);
            }
        }
    };
    let outcome = exec_with_listener(engine, &args, listener).await;

    let log = log.lock().unwrap_or_else(|p| p.into_inner());
    let dimensions = log.dimensions();
    match outcome {
        Ok(()) => VideoProbe {
            total_frames: log.last_counter().filter(|total| *total > 0),
            dimensions,
        },
        Err(e) => {
            warn!("Frame counting failed, total frames unknown: {}", e);
            VideoProbe {
                total_frames: None,
                dimensions,
            }
        }
    }
}

/// Scale filter for the requested bound, exact when the source size is known.
///
/// Bounded output always has even sides. `even` also forces them at the
/// `original` resolution, for encoders that reject odd frame sizes.
pub fn scale_filter(bound: Option<Bound>, dimensions: Option<(u32, u32)>, even: bool) -> Option<String> {
    let Some(bound) = bound else {
        return even.then(|| "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string());
    };
    Some(match dimensions {
        Some((width, height)) => {
            let (w, h) = even_target_dimensions(width, height, Some(bound));
            format!("scale={}:{}", w, h)
        }
        None => format!(
            "scale={}:{}:force_original_aspect_ratio=decrease:force_divisible_by=2",
            bound.width, bound.height
        ),
    })
}

/// Full engine argument list for converting `files.input` into `files.output`
pub fn video_args(files: &WorkingFiles, settings: &ResolvedSettings, probe: VideoProbe) -> Result<Vec<String>> {
    let QualityParams::Engine { args, filter } = &settings.quality else {
        return Err(ConvertError::UnsupportedFormat(format!(
            "quality '{}' of {} is not a frame engine preset",
            settings.settings.quality,
            settings.format_key()
        )));
    };

    let filters: Vec<String> = scale_filter(settings.bound, probe.dimensions, settings.format.even_dimensions)
        .into_iter()
        .chain(filter.clone())
        .collect();

    Ok(FfmpegCommand::new()
        .input(&files.input)
        .args(args)
        .filters(&filters)
        .args(&settings.format.output_args)
        .output(&files.output)
        .into_args())
}
