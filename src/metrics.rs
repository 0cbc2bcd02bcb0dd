//! Conversion counters for one queue

use crate::classify::MediaCategory;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Settled conversion counters, shared between the event loop and handles
#[derive(Default)]
pub struct Metrics {
    pub total_conversions: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Per-category counters
    pub video_count: AtomicU64,
    pub image_count: AtomicU64,
    pub audio_count: AtomicU64,
    pub unknown_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_settlement(&self, category: MediaCategory, success: bool, latency_ms: u64) {
        self.total_conversions.fetch_add(1, Ordering::Relaxed);

        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let counter = match category {
            MediaCategory::Video => &self.video_count,
            MediaCategory::Image => &self.image_count,
            MediaCategory::Audio => &self.audio_count,
            MediaCategory::Unknown => &self.unknown_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_conversions.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_conversions: total,
            completed: self.completed.load(Ordering::Relaxed),
            failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            categories: CategoryMetrics {
                video: self.video_count.load(Ordering::Relaxed),
                image: self.image_count.load(Ordering::Relaxed),
                audio: self.audio_count.load(Ordering::Relaxed),
                unknown: self.unknown_count.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_conversions: u64,
    pub completed: u64,
    pub failed: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub categories: CategoryMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub video: u64,
    pub image: u64,
    pub audio: u64,
    pub unknown: u64,
}

/// Timer for tracking conversion latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlements_are_counted() {
        let metrics = Metrics::new();
        metrics.record_settlement(MediaCategory::Video, true, 300);
        metrics.record_settlement(MediaCategory::Image, false, 100);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_conversions, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.error_rate, 0.5);
        assert_eq!(snapshot.avg_latency_ms, 200);
        assert_eq!(snapshot.categories.video, 1);
        assert_eq!(snapshot.categories.image, 1);
        assert_eq!(snapshot.categories.audio, 0);
    }

    #[test]
    fn test_empty_snapshot() {
        assert_eq!(Metrics::new().snapshot(), MetricsSnapshot::default());
    }
}
