//! Event loop that owns the job queue
//!
//! Every command and every backend event is applied on one task, so the queue
//! needs no locks: ordering alone keeps it consistent. After each change the
//! loop runs [`QueueService::on_queue_changed`], which is the only place a
//! conversion is started, and then publishes a fresh [`QueueSnapshot`].
//!
//! Cancellation is cooperative and only applies to READY jobs. A conversion
//! in flight always runs to completion; there is no internal timeout, so a
//! hung backend stalls the queue.

use crate::backend::{Backends, Converter, ProgressFn};
use crate::catalog::{Catalog, ConversionSettings};
use crate::classify::MediaCategory;
use crate::error::{ConvertError, Result};
use crate::job::{Download, JobId, QueueSnapshot, SourceFile};
use crate::metrics::{Metrics, MetricsSnapshot, Timer};
use crate::progress::Progress;
use crate::queue::{Dispatch, JobQueue};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

const COMMAND_BUFFER: usize = 64;

enum Command {
    AddFiles {
        files: Vec<SourceFile>,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    StartAll {
        reply: oneshot::Sender<usize>,
    },
    StartOne {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    CancelOne {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    ClearAll {
        reply: oneshot::Sender<bool>,
    },
    UpdateSettings {
        settings: ConversionSettings,
        reply: oneshot::Sender<()>,
    },
    Download {
        id: JobId,
        reply: oneshot::Sender<Option<Download>>,
    },
}

/// Backend to event loop traffic
enum Event {
    Progress { id: JobId, progress: Progress },
    Settled { id: JobId, result: Result<Bytes> },
}

struct InFlight {
    id: JobId,
    category: MediaCategory,
    timer: Timer,
}

pub struct QueueService {
    queue: JobQueue,
    backends: Backends,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    snapshots: watch::Sender<QueueSnapshot>,
    metrics: Arc<Metrics>,
    in_flight: Option<InFlight>,
}

impl QueueService {
    /// Start the event loop on the current tokio runtime.
    ///
    /// The loop stops once every [`QueueHandle`] is dropped and no job is
    /// left READY or PROCESSING.
    pub fn spawn(catalog: Arc<Catalog>, backends: Backends) -> QueueHandle {
        let queue = JobQueue::new(catalog);
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = watch::channel(queue.snapshot());
        let metrics = Metrics::new();

        let service = QueueService {
            queue,
            backends,
            commands,
            events_tx,
            events_rx,
            snapshots,
            metrics: Arc::clone(&metrics),
            in_flight: None,
        };
        tokio::spawn(service.run());

        QueueHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
            metrics,
        }
    }

    async fn run(mut self) {
        info!("Conversion queue started");
        let mut accepting = true;

        loop {
            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All queue handles dropped");
                        accepting = false;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }

            if !accepting && self.in_flight.is_none() {
                break;
            }
        }
        info!("Conversion queue stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddFiles { files, reply } => {
                let ids = self.queue.add_files(files);
                self.changed();
                let _ = reply.send(ids);
            }
            Command::StartAll { reply } => {
                let started = self.queue.start_all();
                self.changed();
                let _ = reply.send(started);
            }
            Command::StartOne { id, reply } => {
                let started = self.queue.start_one(id);
                self.changed();
                let _ = reply.send(started);
            }
            Command::CancelOne { id, reply } => {
                let cancelled = self.queue.cancel_one(id);
                self.changed();
                let _ = reply.send(cancelled);
            }
            Command::Remove { id, reply } => {
                let removed = self.queue.remove(id);
                self.changed();
                let _ = reply.send(removed);
            }
            Command::ClearAll { reply } => {
                let cleared = self.queue.clear_all();
                self.changed();
                let _ = reply.send(cleared);
            }
            Command::UpdateSettings { settings, reply } => {
                self.queue.update_settings(settings);
                self.changed();
                let _ = reply.send(());
            }
            Command::Download { id, reply } => {
                let _ = reply.send(self.queue.download(id));
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Progress { id, progress } => {
                if self.queue.apply_progress(id, progress) {
                    self.publish();
                }
            }
            Event::Settled { id, result } => {
                match self.in_flight.take() {
                    Some(in_flight) if in_flight.id == id => {
                        self.metrics
                            .record_settlement(in_flight.category, result.is_ok(), in_flight.timer.elapsed_ms());
                    }
                    other => {
                        error!(job = %id, "Settlement does not match the conversion in flight");
                        self.in_flight = other;
                    }
                }
                self.queue.settle(id, result);
                self.changed();
            }
        }
    }

    fn changed(&mut self) {
        self.on_queue_changed();
        self.publish();
    }

    /// Scheduling trigger: start the next READY job if none is in flight
    fn on_queue_changed(&mut self) {
        if self.in_flight.is_some() {
            return;
        }

        while let Some(dispatch) = self.queue.next_dispatch() {
            match self.backends.for_category(dispatch.settings.category) {
                Ok(converter) => {
                    self.launch(dispatch, converter);
                    return;
                }
                Err(e) => {
                    self.metrics.record_settlement(dispatch.settings.category, false, 0);
                    self.queue.settle(dispatch.job_id, Err(e));
                }
            }
        }
    }

    fn launch(&mut self, dispatch: Dispatch, converter: Arc<dyn Converter>) {
        let id = dispatch.job_id;
        self.in_flight = Some(InFlight {
            id,
            category: dispatch.settings.category,
            timer: Timer::new(),
        });

        let events = self.events_tx.clone();
        let on_progress: ProgressFn = {
            let events = events.clone();
            Arc::new(move |progress: Progress| {
                let _ = events.send(Event::Progress { id, progress });
            })
        };

        tokio::spawn(async move {
            // A panicking backend still has to settle its job
            let worker = tokio::spawn(async move {
                converter
                    .convert(&dispatch.source, &dispatch.settings, on_progress)
                    .await
            });
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(ConvertError::Encode(format!("conversion task failed: {}", e))),
            };
            let _ = events.send(Event::Settled { id, result });
        });
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.queue.snapshot());
    }
}

/// Cloneable client of a running [`QueueService`].
///
/// Commands resolve once the event loop applied them; their effects are
/// observed through [`QueueHandle::snapshot`] or [`QueueHandle::subscribe`].
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<QueueSnapshot>,
    metrics: Arc<Metrics>,
}

impl QueueHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ConvertError::QueueClosed)?;
        response.await.map_err(|_| ConvertError::QueueClosed)
    }

    pub async fn add_files(&self, files: Vec<SourceFile>) -> Result<Vec<JobId>> {
        self.request(|reply| Command::AddFiles { files, reply }).await
    }

    pub async fn start_all(&self) -> Result<usize> {
        self.request(|reply| Command::StartAll { reply }).await
    }

    pub async fn start_one(&self, id: JobId) -> Result<bool> {
        self.request(|reply| Command::StartOne { id, reply }).await
    }

    /// Return a READY job to IDLE. A job already converting is not touched.
    pub async fn cancel_one(&self, id: JobId) -> Result<bool> {
        self.request(|reply| Command::CancelOne { id, reply }).await
    }

    pub async fn remove(&self, id: JobId) -> Result<bool> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    pub async fn clear_all(&self) -> Result<bool> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    pub async fn update_settings(&self, settings: ConversionSettings) -> Result<()> {
        self.request(|reply| Command::UpdateSettings { settings, reply }).await
    }

    pub async fn download(&self, id: JobId) -> Result<Option<Download>> {
        self.request(|reply| Command::Download { id, reply }).await
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until no job is READY or PROCESSING
    pub async fn wait_idle(&self) -> Result<QueueSnapshot> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|snapshot| !snapshot.has_pending_work())
            .await
            .map_err(|_| ConvertError::QueueClosed)?;
        Ok(snapshot.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
