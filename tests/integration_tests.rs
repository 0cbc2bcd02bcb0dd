//! Integration tests for the conversion queue service

use async_trait::async_trait;
use bytes::Bytes;
use ezconvert::backend::{Converter, ProgressFn};
use ezconvert::catalog::{Catalog, ConversionSettings};
use ezconvert::classify::MediaCategory;
use ezconvert::progress::{Progress, ProgressStep};
use ezconvert::validation::ResolvedSettings;
use ezconvert::{Backends, ConvertError, JobStatus, QueueHandle, QueueService, SourceFile};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Converter that records calls and tracks how many run at once
#[derive(Default)]
struct MockConverter {
    calls: Mutex<Vec<String>>,
    settled: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    fail: AtomicBool,
    /// When set, each conversion waits for one permit
    gate: Option<Arc<Semaphore>>,
}

impl MockConverter {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(
        &self,
        input: &SourceFile,
        settings: &ResolvedSettings,
        on_progress: ProgressFn,
    ) -> ezconvert::Result<Bytes> {
        self.calls.lock().unwrap().push(input.name.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        on_progress(Progress::frames(ProgressStep::Converting, 1, Some(2)));
        match &self.gate {
            Some(gate) => gate.acquire().await.expect("gate closed").forget(),
            None => tokio::time::sleep(Duration::from_millis(10)).await,
        }
        on_progress(Progress::frames(ProgressStep::Converting, 2, Some(2)));

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.settled.lock().unwrap().push(input.name.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConvertError::Decode(format!("cannot read {}", input.name)));
        }
        Ok(Bytes::from(format!("{}:{}", input.name, settings.format_key())))
    }
}

fn spawn(converter: Arc<MockConverter>) -> QueueHandle {
    let backends = Backends::new()
        .with_shared(MediaCategory::Video, converter.clone())
        .with_shared(MediaCategory::Image, converter);
    QueueService::spawn(Arc::new(Catalog::builtin()), backends)
}

fn video(name: &str) -> SourceFile {
    SourceFile::new(name, "video/mp4", Bytes::from_static(b"video"))
}

async fn wait_for_status(queue: &QueueHandle, name: &str, status: JobStatus) {
    let mut updates = queue.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.jobs.iter().any(|j| j.name == name && j.status == status)),
    )
    .await
    .expect("timed out waiting for status")
    .expect("queue stopped");
}

#[tokio::test]
async fn test_jobs_settle_in_enqueue_order_one_at_a_time() {
    let converter = Arc::new(MockConverter::default());
    let queue = spawn(converter.clone());

    let violations = Arc::new(AtomicUsize::new(0));
    let mut updates = queue.subscribe();
    let watcher = {
        let violations = Arc::clone(&violations);
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                if updates.borrow_and_update().count(JobStatus::Processing) > 1 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    };

    queue
        .add_files(vec![video("a.mp4"), video("b.mp4"), video("c.mp4")])
        .await
        .unwrap();
    assert_eq!(queue.start_all().await.unwrap(), 3);
    let snapshot = queue.wait_idle().await.unwrap();

    assert_eq!(snapshot.count(JobStatus::Completed), 3);
    assert_eq!(converter.calls(), vec!["a.mp4", "b.mp4", "c.mp4"]);
    assert_eq!(*converter.settled.lock().unwrap(), vec!["a.mp4", "b.mp4", "c.mp4"]);
    assert_eq!(converter.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    watcher.abort();

    let metrics = queue.metrics();
    assert_eq!(metrics.completed, 3);
    assert_eq!(metrics.categories.video, 3);
}

#[tokio::test]
async fn test_cancel_is_a_no_op_outside_ready() {
    let gate = Arc::new(Semaphore::new(0));
    let converter = Arc::new(MockConverter::gated(gate.clone()));
    let queue = spawn(converter.clone());

    let ids = queue.add_files(vec![video("a.mp4"), video("b.mp4")]).await.unwrap();
    assert!(!queue.cancel_one(ids[0]).await.unwrap());

    queue.start_all().await.unwrap();
    wait_for_status(&queue, "a.mp4", JobStatus::Processing).await;

    assert!(!queue.cancel_one(ids[0]).await.unwrap());
    assert!(queue.cancel_one(ids[1]).await.unwrap());
    let snapshot = queue.snapshot();
    assert_eq!(snapshot.job(ids[1]).unwrap().status, JobStatus::Idle);
    assert_eq!(snapshot.job(ids[1]).unwrap().progress.step, ProgressStep::Cancelled);

    gate.add_permits(1);
    let snapshot = queue.wait_idle().await.unwrap();
    assert_eq!(snapshot.job(ids[0]).unwrap().status, JobStatus::Completed);
    assert!(!queue.cancel_one(ids[0]).await.unwrap());
    assert_eq!(converter.calls(), vec!["a.mp4"]);
}

#[tokio::test]
async fn test_progress_is_visible_while_processing() {
    let gate = Arc::new(Semaphore::new(0));
    let converter = Arc::new(MockConverter::gated(gate.clone()));
    let queue = spawn(converter);

    let ids = queue.add_files(vec![video("a.mp4")]).await.unwrap();
    queue.start_all().await.unwrap();

    let mut updates = queue.subscribe();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.jobs.iter().any(|j| j.progress.current == Some(1))),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    let job = snapshot.job(ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.percent, Some(50.0));

    gate.add_permits(1);
    let snapshot = queue.wait_idle().await.unwrap();
    assert_eq!(snapshot.job(ids[0]).unwrap().percent, Some(100.0));
}

#[tokio::test]
async fn test_invalid_settings_never_reach_the_backend() {
    let converter = Arc::new(MockConverter::default());
    let queue = spawn(converter.clone());

    let ids = queue.add_files(vec![video("a.mp4")]).await.unwrap();
    queue
        .update_settings(ConversionSettings::new("webp", "ultra", "original"))
        .await
        .unwrap();
    queue.start_all().await.unwrap();

    let snapshot = queue.wait_idle().await.unwrap();
    let job = snapshot.job(ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.as_deref().unwrap().contains("ultra"));
    assert!(converter.calls().is_empty());

    // Retrying re-validates against the settings in effect now
    queue.start_one(ids[0]).await.unwrap();
    assert_eq!(queue.wait_idle().await.unwrap().job(ids[0]).unwrap().status, JobStatus::Error);
    assert!(converter.calls().is_empty());

    queue
        .update_settings(ConversionSettings::new("gif", "standard", "original"))
        .await
        .unwrap();
    queue.start_one(ids[0]).await.unwrap();
    let snapshot = queue.wait_idle().await.unwrap();
    let job = snapshot.job(ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error.is_none());
    assert_eq!(job.output.as_ref().unwrap().filename, "a.gif");
}

#[tokio::test]
async fn test_failure_does_not_block_the_queue() {
    let converter = Arc::new(MockConverter::default());
    converter.fail.store(true, Ordering::SeqCst);
    let queue = spawn(converter.clone());

    let ids = queue.add_files(vec![video("a.mp4"), video("b.mp4")]).await.unwrap();
    queue.start_all().await.unwrap();
    let snapshot = queue.wait_idle().await.unwrap();

    assert_eq!(snapshot.count(JobStatus::Error), 2);
    let job = snapshot.job(ids[0]).unwrap();
    assert!(job.output.is_none());
    assert!(job.error.as_deref().unwrap().contains("cannot read a.mp4"));
    assert_eq!(queue.metrics().failed, 2);

    converter.fail.store(false, Ordering::SeqCst);
    assert_eq!(queue.start_all().await.unwrap(), 2);
    let snapshot = queue.wait_idle().await.unwrap();
    assert_eq!(snapshot.count(JobStatus::Completed), 2);
}

#[tokio::test]
async fn test_settings_are_read_when_processing_starts() {
    let gate = Arc::new(Semaphore::new(0));
    let converter = Arc::new(MockConverter::gated(gate.clone()));
    let queue = spawn(converter);

    let ids = queue.add_files(vec![video("a.mp4"), video("b.mp4")]).await.unwrap();
    queue.start_all().await.unwrap();
    wait_for_status(&queue, "a.mp4", JobStatus::Processing).await;

    // b is READY but not started, so it picks up the new settings
    queue
        .update_settings(ConversionSettings::new("mp4", "high", "720p"))
        .await
        .unwrap();
    gate.add_permits(2);
    let snapshot = queue.wait_idle().await.unwrap();

    let a = queue.download(ids[0]).await.unwrap().unwrap();
    let b = queue.download(ids[1]).await.unwrap().unwrap();
    assert_eq!(a.filename, "a.webp");
    assert_eq!(&a.data[..], b"a.mp4:webp");
    assert_eq!(b.filename, "b.mp4");
    assert_eq!(b.mime, "video/mp4");
    assert_eq!(snapshot.job(ids[1]).unwrap().settings.as_ref().unwrap().resolution, "720p");
}

#[tokio::test]
async fn test_remove_while_processing_waits_for_settlement() {
    let gate = Arc::new(Semaphore::new(0));
    let converter = Arc::new(MockConverter::gated(gate.clone()));
    let queue = spawn(converter.clone());

    let ids = queue.add_files(vec![video("a.mp4"), video("b.mp4")]).await.unwrap();
    queue.start_all().await.unwrap();
    wait_for_status(&queue, "a.mp4", JobStatus::Processing).await;

    assert!(queue.remove(ids[0]).await.unwrap());
    let snapshot = queue.snapshot();
    assert!(snapshot.job(ids[0]).unwrap().removal_pending);
    assert!(!queue.clear_all().await.unwrap());

    gate.add_permits(2);
    let snapshot = queue.wait_idle().await.unwrap();
    assert!(snapshot.job(ids[0]).is_none());
    assert_eq!(snapshot.job(ids[1]).unwrap().status, JobStatus::Completed);
    assert_eq!(converter.calls(), vec!["a.mp4", "b.mp4"]);
    // b's original and output handles remain
    assert_eq!(snapshot.live_handles, 2);
}

#[tokio::test]
async fn test_remove_twice_and_clear_release_handles() {
    let converter = Arc::new(MockConverter::default());
    let queue = spawn(converter);

    let ids = queue.add_files(vec![video("a.mp4"), video("b.mp4")]).await.unwrap();
    queue.start_one(ids[0]).await.unwrap();
    let snapshot = queue.wait_idle().await.unwrap();
    assert_eq!(snapshot.live_handles, 3);

    assert!(queue.remove(ids[0]).await.unwrap());
    assert!(!queue.remove(ids[0]).await.unwrap());
    assert_eq!(queue.snapshot().live_handles, 1);
    assert!(queue.download(ids[0]).await.unwrap().is_none());

    assert!(queue.clear_all().await.unwrap());
    let snapshot = queue.snapshot();
    assert!(snapshot.jobs.is_empty());
    assert_eq!(snapshot.live_handles, 0);
}

#[tokio::test]
async fn test_mixed_batch_uses_first_category_defaults() {
    let converter = Arc::new(MockConverter::default());
    let queue = spawn(converter.clone());

    let ids = queue
        .add_files(vec![
            SourceFile::new("photo.jpg", "image/jpeg", Bytes::from_static(b"jpg")),
            SourceFile::new("notes.txt", "", Bytes::from_static(b"txt")),
        ])
        .await
        .unwrap();
    let snapshot = queue.snapshot();
    assert_eq!(snapshot.current_category, Some(MediaCategory::Image));
    assert_eq!(snapshot.category_counts[&MediaCategory::Unknown], 1);

    queue.start_all().await.unwrap();
    let snapshot = queue.wait_idle().await.unwrap();
    assert_eq!(snapshot.job(ids[0]).unwrap().output.as_ref().unwrap().filename, "photo.webp");
    assert_eq!(snapshot.job(ids[1]).unwrap().status, JobStatus::Error);
    assert_eq!(converter.calls(), vec!["photo.jpg"]);
}

#[tokio::test]
async fn test_image_backend_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pixel.png");
    image::RgbaImage::from_pixel(64, 32, image::Rgba([255, 0, 0, 255]))
        .save(&path)
        .unwrap();
    let data = std::fs::read(&path).unwrap();

    let backends = Backends::new().with(MediaCategory::Image, ezconvert::image::ImageConverter::new());
    let queue = QueueService::spawn(Arc::new(Catalog::builtin()), backends);

    let ids = queue
        .add_files(vec![SourceFile::new("pixel.png", "image/png", data)])
        .await
        .unwrap();
    queue
        .update_settings(ConversionSettings::new("jpg", "high", "original"))
        .await
        .unwrap();
    queue.start_all().await.unwrap();
    queue.wait_idle().await.unwrap();

    let download = queue.download(ids[0]).await.unwrap().unwrap();
    assert_eq!(download.filename, "pixel.jpg");
    assert_eq!(download.mime, "image/jpeg");
    let decoded = image::load_from_memory(&download.data).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 32));
}

/// Small deterministic generator so command orders are reproducible per seed
struct XorShift(u64);

impl XorShift {
    fn next(&mut self, bound: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % bound as u64) as usize
    }
}

#[tokio::test]
async fn test_interleaved_commands_keep_a_single_conversion() {
    for seed in 1..=8u64 {
        let gate = Arc::new(Semaphore::new(0));
        let converter = Arc::new(MockConverter::gated(gate.clone()));
        let queue = spawn(converter.clone());

        let violations = Arc::new(AtomicUsize::new(0));
        let mut updates = queue.subscribe();
        let watcher = {
            let violations = Arc::clone(&violations);
            tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    if updates.borrow_and_update().count(JobStatus::Processing) > 1 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };

        let mut ids = queue
            .add_files(vec![video("a.mp4"), video("b.mp4"), video("c.mp4")])
            .await
            .unwrap();
        queue.start_all().await.unwrap();
        wait_for_status(&queue, "a.mp4", JobStatus::Processing).await;

        let mut rng = XorShift(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        for step in 0..24 {
            let id = ids[rng.next(ids.len())];
            match rng.next(9) {
                0 => {
                    queue.cancel_one(id).await.unwrap();
                }
                1 => {
                    queue.remove(id).await.unwrap();
                }
                2 => {
                    queue.start_one(id).await.unwrap();
                }
                3 => {
                    queue.start_all().await.unwrap();
                }
                4 => {
                    let settings = if step % 2 == 0 {
                        ConversionSettings::new("gif", "high", "480p")
                    } else {
                        ConversionSettings::new("webp", "standard", "original")
                    };
                    queue.update_settings(settings).await.unwrap();
                }
                5 => {
                    let name = format!("extra-{}.mp4", step);
                    ids.extend(queue.add_files(vec![video(&name)]).await.unwrap());
                }
                6 => {
                    queue.clear_all().await.unwrap();
                }
                _ => {
                    gate.add_permits(1);
                    tokio::task::yield_now().await;
                }
            }
            assert!(
                queue.snapshot().count(JobStatus::Processing) <= 1,
                "seed {} step {}: more than one job converting",
                seed,
                step
            );
        }

        gate.add_permits(1000);
        let snapshot = tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue never drained")
            .unwrap();
        assert_eq!(snapshot.count(JobStatus::Processing), 0, "seed {}", seed);
        assert!(snapshot.jobs.iter().all(|job| !job.removal_pending), "seed {}", seed);
        assert!(converter.max_running.load(Ordering::SeqCst) <= 1, "seed {}", seed);
        assert_eq!(violations.load(Ordering::SeqCst), 0, "seed {}", seed);
        watcher.abort();
    }
}
