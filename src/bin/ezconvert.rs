// ezconvert - convert a batch of media files through the job queue

use anyhow::{bail, Context, Result};
use clap::Parser;
use ezconvert::{
    Backends, Catalog, ConversionSettings, FfmpegLoader, JobStatus, QueueService, SharedEngine, SourceFile,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ezconvert", version, about = "Convert video, image and audio files one at a time")]
struct Args {
    /// Files to convert
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output format key (defaults to the first file's category default)
    #[arg(long)]
    format: Option<String>,

    /// Quality preset key
    #[arg(long)]
    quality: Option<String>,

    /// Resolution preset key
    #[arg(long)]
    resolution: Option<String>,

    /// Directory converted files are written to
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// JSON preset catalog replacing the built-in one
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// ffmpeg binary used for video and audio
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();

    let catalog = match &args.catalog {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => Catalog::builtin(),
    };

    let engine = Arc::new(SharedEngine::new(FfmpegLoader::new(args.ffmpeg.clone())));
    let queue = QueueService::spawn(Arc::new(catalog), Backends::standard(engine));

    let mut sources = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let kind = infer::get(&data).map(|t| t.mime_type()).unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        sources.push(SourceFile::new(name, kind, data));
    }

    let ids = queue.add_files(sources).await?;

    // Flags override whatever defaults the first file selected
    if args.format.is_some() || args.quality.is_some() || args.resolution.is_some() {
        let current = queue.snapshot().settings;
        let settings = ConversionSettings {
            output_format: args.format.clone().unwrap_or(current.output_format),
            quality: args.quality.clone().unwrap_or(current.quality),
            resolution: args.resolution.clone().unwrap_or(current.resolution),
        };
        queue.update_settings(settings).await?;
    }

    let settings = queue.snapshot().settings;
    info!(
        "Converting {} file(s) to {} ({}, {})",
        ids.len(),
        settings.output_format,
        settings.quality,
        settings.resolution
    );

    let mut updates = queue.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last: HashMap<_, String> = HashMap::new();
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            for job in &snapshot.jobs {
                let line = match (job.percent, &job.progress.detail) {
                    (Some(percent), _) => format!("{} {:.0}%", job.progress.step.label(), percent),
                    (None, Some(detail)) => format!("{} ({})", job.progress.step.label(), detail),
                    (None, None) => job.progress.step.label().to_string(),
                };
                if last.get(&job.id) != Some(&line) {
                    info!("{}: {}", job.name, line);
                    last.insert(job.id, line);
                }
            }
        }
    });

    queue.start_all().await?;
    let snapshot = queue.wait_idle().await?;
    reporter.abort();

    tokio::fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;

    let mut failed = 0;
    let mut written = HashSet::new();
    for job in &snapshot.jobs {
        match job.status {
            JobStatus::Completed => {
                let Some(download) = queue.download(job.id).await? else {
                    warn!("{}: output is no longer available", job.name);
                    continue;
                };
                let filename = unique_filename(&mut written, &download.filename);
                if filename != download.filename {
                    warn!("{}: {} already written, saving as {}", job.name, download.filename, filename);
                }
                let path = args.out_dir.join(&filename);
                tokio::fs::write(&path, &download.data)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("{} -> {} ({} bytes)", job.name, path.display(), download.data.len());
            }
            JobStatus::Error => {
                failed += 1;
                error!("{}: {}", job.name, job.error.as_deref().unwrap_or("unknown error"));
            }
            _ => {}
        }
    }

    let metrics = queue.metrics();
    info!(
        "Done: {} converted, {} failed, avg {} ms",
        metrics.completed, metrics.failed, metrics.avg_latency_ms
    );

    if failed > 0 {
        bail!("{} of {} conversions failed", failed, snapshot.jobs.len());
    }
    Ok(())
}

/// Claim `filename` for this run, suffixing the stem when an earlier output
/// (say `a.webp` from `a.png` and `a.jpg`) already took it
fn unique_filename(taken: &mut HashSet<String>, filename: &str) -> String {
    if taken.insert(filename.to_string()) {
        return filename.to_string();
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1;
    loop {
        let candidate = match &extension {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
