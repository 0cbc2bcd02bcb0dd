//! Job data model and the read-only snapshots handed to callers

use crate::catalog::ConversionSettings;
use crate::classify::{classify, MediaCategory};
use crate::handle::HandleId;
use crate::progress::{Progress, ProgressStep};
use crate::validation::ResolvedSettings;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// One input file as accepted from the caller
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    /// MIME-like kind declared by whoever supplied the file; may be empty
    pub declared_kind: String,
    pub data: Bytes,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, declared_kind: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            declared_kind: declared_kind.into(),
            data,
        }
    }

    pub fn category(&self) -> MediaCategory {
        classify(&self.declared_kind, &self.name)
    }

    /// Source name with its last extension swapped for `extension`
    pub fn output_name(&self, extension: &str) -> String {
        let stem = match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => self.name.as_str(),
        };
        format!("{}.{}", stem, extension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Ready,
    Processing,
    Completed,
    Error,
}

/// Converted payload of a completed job
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub handle: HandleId,
    pub completed_at: DateTime<Utc>,
}

/// Lifecycle state; the output only exists when completed and the error only
/// when failed
#[derive(Debug, Clone)]
pub enum JobState {
    Idle,
    Ready,
    Processing,
    Completed(JobOutput),
    Error(String),
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Idle => JobStatus::Idle,
            JobState::Ready => JobStatus::Ready,
            JobState::Processing => JobStatus::Processing,
            JobState::Completed(_) => JobStatus::Completed,
            JobState::Error(_) => JobStatus::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source: SourceFile,
    pub category: MediaCategory,
    pub state: JobState,
    /// Settings in effect when processing started
    pub settings: Option<ResolvedSettings>,
    pub progress: Progress,
    pub original_handle: Option<HandleId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub removal_pending: bool,
}

impl Job {
    pub(crate) fn new(source: SourceFile, original_handle: HandleId) -> Self {
        let category = source.category();
        Self {
            id: JobId::new(),
            source,
            category,
            state: JobState::Idle,
            settings: None,
            progress: Progress::step(ProgressStep::Waiting),
            original_handle: Some(original_handle),
            created_at: Utc::now(),
            started_at: None,
            removal_pending: false,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn output(&self) -> Option<&JobOutput> {
        match &self.state {
            JobState::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.source.name.clone(),
            size: self.source.size,
            category: self.category,
            status: self.status(),
            progress: self.progress.clone(),
            percent: self.progress.percent(),
            error: self.error().map(str::to_string),
            output: self.output().map(|output| OutputInfo {
                filename: output.filename.clone(),
                size: output.size,
                mime: output.mime.clone(),
                handle: output.handle,
            }),
            original_handle: self.original_handle,
            settings: self.settings.as_ref().map(|s| s.settings.clone()),
            created_at: self.created_at,
            removal_pending: self.removal_pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputInfo {
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub handle: HandleId,
}

/// Read-only view of a job for rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub size: u64,
    pub category: MediaCategory,
    pub status: JobStatus,
    pub progress: Progress,
    pub percent: Option<f32>,
    pub error: Option<String>,
    pub output: Option<OutputInfo>,
    pub original_handle: Option<HandleId>,
    pub settings: Option<ConversionSettings>,
    pub created_at: DateTime<Utc>,
    pub removal_pending: bool,
}

/// Read-only view of the whole queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub jobs: Vec<JobSnapshot>,
    /// Settings the next dispatched job will be validated against
    pub settings: ConversionSettings,
    pub current_category: Option<MediaCategory>,
    pub category_counts: BTreeMap<MediaCategory, usize>,
    pub live_handles: usize,
}

impl QueueSnapshot {
    pub fn job(&self, id: JobId) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    /// True while any job is queued or converting
    pub fn has_pending_work(&self) -> bool {
        self.jobs
            .iter()
            .any(|job| matches!(job.status, JobStatus::Ready | JobStatus::Processing))
    }
}

/// Converted file resolved through its output handle
#[derive(Debug, Clone)]
pub struct Download {
    pub filename: String,
    pub mime: String,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_name() {
        let file = SourceFile::new("holiday.clip.mp4", "video/mp4", Bytes::new());
        assert_eq!(file.output_name("webp"), "holiday.clip.webp");

        let bare = SourceFile::new("README", "", Bytes::new());
        assert_eq!(bare.output_name("png"), "README.png");

        let hidden = SourceFile::new(".hidden", "", Bytes::new());
        assert_eq!(hidden.output_name("png"), ".hidden.png");
    }

    #[test]
    fn test_source_size_follows_data() {
        let file = SourceFile::new("a.png", "image/png", vec![0u8; 42]);
        assert_eq!(file.size, 42);
        assert_eq!(file.category(), MediaCategory::Image);
    }
}
