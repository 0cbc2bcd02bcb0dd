//! FFmpeg-backed frame engine
//!
//! Shells out to the system `ffmpeg` binary (no linking). The working
//! namespace is a private temporary directory owned by the engine, and stderr
//! is pumped line by line onto the engine's [`LogBus`].

use crate::engine::{EngineError, EngineLoader, FrameEngine, LogBus};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// Argument list builder for one engine invocation
#[derive(Debug, Clone, Default)]
pub struct FfmpegCommand {
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    pub fn input(mut self, name: &str) -> Self {
        self.args.push("-i".to_string());
        self.args.push(name.to_string());
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.args.push(name.to_string());
        self
    }

    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args.extend(args.iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Add a `-vf` chain, skipping empty chains
    pub fn filters(mut self, filters: &[String]) -> Self {
        if !filters.is_empty() {
            self.args.push("-vf".to_string());
            self.args.push(filters.join(","));
        }
        self
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// Splits a byte stream on both `\n` and `\r`.
///
/// FFmpeg rewrites its stats line in place with carriage returns, so a plain
/// line reader would only see the counters once the process exits.
#[derive(Debug, Default)]
pub struct LogLineSplitter {
    pending: Vec<u8>,
}

impl LogLineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

const ERROR_TAIL_LINES: usize = 8;

pub struct FfmpegEngine {
    binary: PathBuf,
    workdir: TempDir,
    logs: Arc<LogBus>,
}

impl FfmpegEngine {
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, EngineError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(|c: char| c == '/' || c == '\\');
        if !valid {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        Ok(self.workdir.path().join(name))
    }
}

fn not_found_as_missing(name: &str, err: std::io::Error) -> EngineError {
    if err.kind() == std::io::ErrorKind::NotFound {
        EngineError::MissingFile(name.to_string())
    } else {
        EngineError::Io(err)
    }
}

#[async_trait]
impl FrameEngine for FfmpegEngine {
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::write(&path, data).await?;
        debug!(file = %name, bytes = data.len(), "Wrote working file");
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::read(&path).await.map_err(|e| not_found_as_missing(name, e))
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::remove_file(&path).await.map_err(|e| not_found_as_missing(name, e))
    }

    async fn exec(&self, args: &[String]) -> Result<(), EngineError> {
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(["-hide_banner", "-nostdin", "-y"])
            .args(args)
            .current_dir(self.workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::ExecutionFailed(e.to_string()))?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
        let mut publish = |line: String| {
            trace!(target: "ezconvert::ffmpeg::log", "{}", line);
            self.logs.emit(&line);
            if tail.len() == ERROR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        };

        if let Some(mut stderr) = child.stderr.take() {
            let mut splitter = LogLineSplitter::default();
            let mut buf = [0u8; 4096];
            loop {
                let n = stderr.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                for line in splitter.push(&buf[..n]) {
                    publish(line);
                }
            }
            if let Some(line) = splitter.finish() {
                publish(line);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let tail: Vec<String> = tail.into_iter().collect();
            return Err(EngineError::ExecutionFailed(format!(
                "ffmpeg exited with {}: {}",
                status,
                tail.join(" | ")
            )));
        }
        Ok(())
    }

    fn log_bus(&self) -> &Arc<LogBus> {
        &self.logs
    }
}

/// Loads an [`FfmpegEngine`] after checking the binary actually runs
pub struct FfmpegLoader {
    binary: PathBuf,
}

impl FfmpegLoader {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegLoader {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl EngineLoader for FfmpegLoader {
    async fn load(&self) -> Result<Arc<dyn FrameEngine>, EngineError> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::NotInstalled(format!("{}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(EngineError::Load(format!(
                "{} -version exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        debug!("{}", version.lines().next().unwrap_or("ffmpeg"));

        let workdir = tempfile::Builder::new()
            .prefix("ezconvert-")
            .tempdir()
            .map_err(|e| EngineError::Load(format!("cannot create working directory: {}", e)))?;

        Ok(Arc::new(FfmpegEngine {
            binary: self.binary.clone(),
            workdir,
            logs: LogBus::new(),
        }))
    }
}
