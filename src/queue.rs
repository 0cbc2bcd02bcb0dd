//! Job queue state machine
//!
//! ```text
//! IDLE -> READY -> PROCESSING -> COMPLETED
//!          ^  |                \-> ERROR
//!          |  \-> IDLE (cancel)       |
//!          \--------------------------/ (retry)
//! ```
//!
//! [`JobQueue`] is plain synchronous state. It never runs a conversion itself;
//! the service asks it for the next [`Dispatch`] and reports the outcome back
//! through [`JobQueue::settle`]. The admission gate is a state check: a job is
//! only handed out while no other job is PROCESSING.

use crate::catalog::{Catalog, ConversionSettings, ORIGINAL};
use crate::classify::MediaCategory;
use crate::error::ConvertError;
use crate::handle::HandleRegistry;
use crate::job::{Download, Job, JobId, JobOutput, JobSnapshot, JobState, JobStatus, QueueSnapshot, SourceFile};
use crate::progress::{Progress, ProgressStep};
use crate::validation::{validate_settings, ResolvedSettings};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A job that just moved to PROCESSING, with everything its backend needs
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: JobId,
    pub source: SourceFile,
    pub settings: ResolvedSettings,
}

pub struct JobQueue {
    catalog: Arc<Catalog>,
    /// Creation order, oldest first
    jobs: Vec<Job>,
    settings: ConversionSettings,
    current_category: Option<MediaCategory>,
    handles: HandleRegistry,
}

impl JobQueue {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let settings = catalog
            .default_settings(MediaCategory::Video)
            .unwrap_or_else(|| ConversionSettings::new("webp", "standard", ORIGINAL));
        Self {
            catalog,
            jobs: Vec::new(),
            settings,
            current_category: None,
            handles: HandleRegistry::new(),
        }
    }

    /// Accept a batch of files as IDLE jobs, in order.
    ///
    /// When the first file of the batch is of a known category other than the
    /// current one, the active settings switch to that category's defaults.
    pub fn add_files(&mut self, files: Vec<SourceFile>) -> Vec<JobId> {
        if let Some(first) = files.first() {
            let category = first.category();
            if category != MediaCategory::Unknown && self.current_category != Some(category) {
                if let Some(defaults) = self.catalog.default_settings(category) {
                    info!(%category, format = %defaults.output_format, "Switching settings to category defaults");
                    self.settings = defaults;
                }
                self.current_category = Some(category);
            }
        }

        files
            .into_iter()
            .map(|source| {
                let handle = self.handles.create(source.data.clone());
                let job = Job::new(source, handle);
                debug!(job = %job.id, file = %job.source.name, category = %job.category, "Job added");
                let id = job.id;
                self.jobs.push(job);
                id
            })
            .collect()
    }

    /// Move every IDLE job and every failed job to READY. Returns how many moved.
    pub fn start_all(&mut self) -> usize {
        let ids: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|job| matches!(job.status(), JobStatus::Idle | JobStatus::Error))
            .map(|job| job.id)
            .collect();
        ids.into_iter().filter(|id| self.start_one(*id)).count()
    }

    /// IDLE -> READY, or ERROR -> READY as a retry. Any other state is a no-op.
    pub fn start_one(&mut self, id: JobId) -> bool {
        let Some(job) = self.job_mut(id) else {
            return false;
        };
        let step = match job.status() {
            JobStatus::Idle => ProgressStep::Queued,
            JobStatus::Error => ProgressStep::Retrying,
            _ => return false,
        };
        job.state = JobState::Ready;
        job.progress = Progress::step(step);
        debug!(job = %id, step = step.label(), "Job ready");
        true
    }

    /// READY -> IDLE. Only effective before the scheduler picked the job; a
    /// PROCESSING job is never interrupted.
    pub fn cancel_one(&mut self, id: JobId) -> bool {
        match self.job_mut(id) {
            Some(job) if job.status() == JobStatus::Ready => {
                job.state = JobState::Idle;
                job.progress = Progress::step(ProgressStep::Cancelled);
                debug!(job = %id, "Job cancelled");
                true
            }
            _ => false,
        }
    }

    /// Delete a job and release its handles.
    ///
    /// A PROCESSING job is only flagged; it is deleted once its conversion
    /// settles. Returns `false` for an unknown id.
    pub fn remove(&mut self, id: JobId) -> bool {
        let Some(index) = self.position(id) else {
            debug!(job = %id, "Remove of unknown job ignored");
            return false;
        };

        if self.jobs[index].status() == JobStatus::Processing {
            self.jobs[index].removal_pending = true;
            info!(job = %id, "Job is converting, removal deferred until it settles");
            return true;
        }

        let job = self.jobs.remove(index);
        self.release(job);
        true
    }

    /// Delete every job. Refused while a job is PROCESSING.
    pub fn clear_all(&mut self) -> bool {
        if self.is_processing() {
            warn!("Refusing to clear the queue while a job is converting");
            return false;
        }
        for job in std::mem::take(&mut self.jobs) {
            self.release(job);
        }
        self.current_category = None;
        info!("Queue cleared");
        true
    }

    /// Replace the active settings. Jobs already PROCESSING keep the snapshot
    /// they started with.
    pub fn update_settings(&mut self, settings: ConversionSettings) {
        debug!(
            format = %settings.output_format,
            quality = %settings.quality,
            resolution = %settings.resolution,
            "Settings updated"
        );
        self.settings = settings;
    }

    pub fn settings(&self) -> &ConversionSettings {
        &self.settings
    }

    pub fn is_processing(&self) -> bool {
        self.jobs.iter().any(|job| job.status() == JobStatus::Processing)
    }

    /// Admission gate plus FIFO pick.
    ///
    /// Returns `None` while a job is PROCESSING or when nothing is READY. The
    /// oldest READY job is validated against the current settings; on failure
    /// it goes straight to ERROR and the next READY job is considered.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        if self.is_processing() {
            return None;
        }

        loop {
            let index = self.jobs.iter().position(|job| job.status() == JobStatus::Ready)?;
            let category = self.jobs[index].category;

            match validate_settings(&self.catalog, category, &self.settings) {
                Ok(resolved) => {
                    let job = &mut self.jobs[index];
                    job.state = JobState::Processing;
                    job.settings = Some(resolved.clone());
                    job.started_at = Some(Utc::now());
                    job.progress = Progress::step(ProgressStep::Starting);
                    info!(
                        job = %job.id,
                        file = %job.source.name,
                        format = %resolved.format_key(),
                        quality = %resolved.settings.quality,
                        "Job processing"
                    );
                    return Some(Dispatch {
                        job_id: job.id,
                        source: job.source.clone(),
                        settings: resolved,
                    });
                }
                Err(e) => {
                    let job = &mut self.jobs[index];
                    warn!(job = %job.id, file = %job.source.name, "Settings rejected: {}", e);
                    job.settings = None;
                    Self::fail(job, &e);
                }
            }
        }
    }

    /// Merge a progress event into a PROCESSING job. Stale events for a job
    /// that already settled are dropped.
    pub fn apply_progress(&mut self, id: JobId, progress: Progress) -> bool {
        match self.job_mut(id) {
            Some(job) if job.status() == JobStatus::Processing => {
                job.progress.merge(progress);
                true
            }
            _ => false,
        }
    }

    /// Record the outcome of a PROCESSING job's conversion
    pub fn settle(&mut self, id: JobId, result: Result<Bytes, ConvertError>) -> bool {
        let Some(index) = self.position(id) else {
            warn!(job = %id, "Settlement for unknown job ignored");
            return false;
        };
        if self.jobs[index].status() != JobStatus::Processing {
            warn!(job = %id, "Settlement for a job that is not converting ignored");
            return false;
        }

        let job = &mut self.jobs[index];
        match result {
            Ok(data) => {
                let (filename, mime) = match &job.settings {
                    Some(settings) => (
                        job.source.output_name(&settings.format.extension),
                        settings.format.mime.clone(),
                    ),
                    None => (job.source.name.clone(), "application/octet-stream".to_string()),
                };
                let size = data.len() as u64;
                let handle = self.handles.create(data);
                info!(job = %id, file = %filename, bytes = size, "Job completed");
                job.state = JobState::Completed(JobOutput {
                    filename,
                    size,
                    mime,
                    handle,
                    completed_at: Utc::now(),
                });
                job.progress = Progress::step(ProgressStep::Done);
            }
            Err(e) => {
                warn!(job = %id, file = %job.source.name, "Job failed: {}", e);
                Self::fail(job, &e);
            }
        }

        if self.jobs[index].removal_pending {
            let job = self.jobs.remove(index);
            info!(job = %id, "Completing deferred removal");
            self.release(job);
        }
        true
    }

    /// Converted payload of a COMPLETED job
    pub fn download(&self, id: JobId) -> Option<Download> {
        let job = self.jobs.iter().find(|job| job.id == id)?;
        let output = job.output()?;
        let data = self.handles.resolve(output.handle)?;
        Some(Download {
            filename: output.filename.clone(),
            mime: output.mime.clone(),
            data,
        })
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut category_counts = BTreeMap::new();
        for job in &self.jobs {
            *category_counts.entry(job.category).or_insert(0) += 1;
        }
        QueueSnapshot {
            jobs: self.jobs.iter().map(Job::snapshot).collect::<Vec<JobSnapshot>>(),
            settings: self.settings.clone(),
            current_category: self.current_category,
            category_counts,
            live_handles: self.handles.live_count(),
        }
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn fail(job: &mut Job, err: &ConvertError) {
        let message = err.to_string();
        job.progress = Progress::step(ProgressStep::Failed).with_detail(message.clone());
        job.state = JobState::Error(message);
    }

    fn release(&mut self, mut job: Job) {
        if let Some(handle) = job.original_handle.take() {
            self.handles.revoke(handle);
        }
        if let Some(output) = job.output() {
            self.handles.revoke(output.handle);
        }
        debug!(job = %job.id, file = %job.source.name, "Job removed");
    }

    fn position(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|job| job.id == id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }
}
