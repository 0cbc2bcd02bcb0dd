//! Progress normalization
//!
//! The frame engine only reports progress as free-text log lines. Everything
//! that knows about that text lives here: [`LogProgress`] turns lines into
//! [`Progress`] values and the rest of the crate only sees structured events.
//!
//! Parsing is best effort. A conversion never fails because no counter could
//! be scraped; the job just shows coarser progress.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Named stage of a job, from queueing to settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Waiting,
    Queued,
    Retrying,
    Cancelled,
    Starting,
    Uploading,
    CountingFrames,
    Preparing,
    Converting,
    Finalizing,
    ReadingOutput,
    Loading,
    Processing,
    Encoding,
    Done,
    Failed,
}

impl ProgressStep {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressStep::Waiting => "waiting to start",
            ProgressStep::Queued => "queued",
            ProgressStep::Retrying => "retrying",
            ProgressStep::Cancelled => "cancelled",
            ProgressStep::Starting => "starting",
            ProgressStep::Uploading => "loading input",
            ProgressStep::CountingFrames => "counting frames",
            ProgressStep::Preparing => "preparing conversion",
            ProgressStep::Converting => "converting",
            ProgressStep::Finalizing => "finalizing output",
            ProgressStep::ReadingOutput => "reading output",
            ProgressStep::Loading => "loading image",
            ProgressStep::Processing => "processing image",
            ProgressStep::Encoding => "encoding image",
            ProgressStep::Done => "done",
            ProgressStep::Failed => "failed",
        }
    }

    /// Coarse percentage for steps that carry no unit counter
    fn milestone(&self) -> Option<f32> {
        match self {
            ProgressStep::Loading => Some(0.0),
            ProgressStep::Processing => Some(30.0),
            ProgressStep::Encoding => Some(60.0),
            ProgressStep::Finalizing | ProgressStep::ReadingOutput => Some(99.0),
            ProgressStep::Done => Some(100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressUnit {
    Frames,
    Millis,
}

/// Structured progress of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub step: ProgressStep,
    pub current: Option<u64>,
    pub total: Option<u64>,
    pub unit: Option<ProgressUnit>,
    pub detail: Option<String>,
}

impl Progress {
    pub fn step(step: ProgressStep) -> Self {
        Self {
            step,
            current: None,
            total: None,
            unit: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn frames(step: ProgressStep, current: u64, total: Option<u64>) -> Self {
        let detail = match total {
            Some(total) if total > 0 => format!("{}/{} frames", current, total),
            _ => format!("{} frames processed", current),
        };
        Self {
            step,
            current: Some(current),
            total,
            unit: Some(ProgressUnit::Frames),
            detail: Some(detail),
        }
    }

    pub fn millis(step: ProgressStep, current: u64, total: Option<u64>) -> Self {
        let detail = match total {
            Some(total) if total > 0 => format!("{:.1}s/{:.1}s", current as f64 / 1000.0, total as f64 / 1000.0),
            _ => format!("{:.1}s processed", current as f64 / 1000.0),
        };
        Self {
            step,
            current: Some(current),
            total,
            unit: Some(ProgressUnit::Millis),
            detail: Some(detail),
        }
    }

    /// Normalized percentage, from the unit counter when a total is known,
    /// otherwise from the step's milestone.
    ///
    /// Counters stop at 99 so that only [`ProgressStep::Done`] reports 100.
    pub fn percent(&self) -> Option<f32> {
        match (self.current, self.total) {
            (Some(current), Some(total)) if total > 0 => {
                Some((current as f32 / total as f32 * 100.0).min(99.0))
            }
            _ => self.step.milestone(),
        }
    }

    /// Fold a newer event into this one.
    ///
    /// A new step replaces everything. Within the same step a smaller counter
    /// (a repeated or stale log line) never moves progress backwards.
    pub fn merge(&mut self, next: Progress) {
        if next.step != self.step || next.unit != self.unit {
            *self = next;
            return;
        }

        let total = next.total.or(self.total);
        match (self.current, next.current) {
            (Some(current), Some(incoming)) if incoming < current => {}
            (Some(_), None) => {}
            _ => {
                self.current = next.current;
                self.detail = next.detail.or(self.detail.take());
            }
        }
        self.total = total;
    }
}

fn frame_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"frame=\s*(\d+)").expect("frame pattern"))
}

fn dimensions_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Video:.*?\b(\d{2,5})x(\d{2,5})\b").expect("dimensions pattern"))
}

fn rotation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:rotation of\s*(-?\d+(?:\.\d+)?)\s*degrees|^\s*rotate\s*:\s*(-?\d+(?:\.\d+)?))")
            .expect("rotation pattern")
    })
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("duration pattern"))
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("time pattern"))
}

/// Latest `frame=<n>` counter on a line
pub fn parse_frame(line: &str) -> Option<u64> {
    frame_regex()
        .captures_iter(line)
        .last()
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Input video stream size from a stream description line
pub fn parse_dimensions(line: &str) -> Option<(u32, u32)> {
    let cap = dimensions_regex().captures(line)?;
    let width = cap.get(1)?.as_str().parse().ok()?;
    let height = cap.get(2)?.as_str().parse().ok()?;
    Some((width, height))
}

/// Display rotation in degrees from a `displaymatrix` side data line or a
/// `rotate` metadata tag
pub fn parse_rotation(line: &str) -> Option<f64> {
    let cap = rotation_regex().captures(line)?;
    cap.get(1).or_else(|| cap.get(2))?.as_str().parse().ok()
}

/// Swap sides when the rotation turns the frame on its side
pub fn displayed_dimensions((width, height): (u32, u32), rotation: Option<f64>) -> (u32, u32) {
    match rotation.map(|r| r.rem_euclid(360.0).round() as i64) {
        Some(90) | Some(270) => (height, width),
        _ => (width, height),
    }
}

pub fn parse_duration_ms(line: &str) -> Option<u64> {
    hms_to_ms(duration_regex().captures(line)?)
}

pub fn parse_time_ms(line: &str) -> Option<u64> {
    hms_to_ms(time_regex().captures_iter(line).last()?)
}

fn hms_to_ms(cap: regex::Captures<'_>) -> Option<u64> {
    let h: u64 = cap.get(1)?.as_str().parse().ok()?;
    let m: u64 = cap.get(2)?.as_str().parse().ok()?;
    let s: f64 = cap.get(3)?.as_str().parse().ok()?;
    Some(h * 3_600_000 + m * 60_000 + (s * 1000.0).round() as u64)
}

/// Stream summary printed once muxing is over
pub fn is_trailer(line: &str) -> bool {
    line.contains("video:") && line.contains("audio:")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    CountFrames,
    Frames,
    Millis,
}

/// Incremental parser for one engine operation's log stream
#[derive(Debug, Clone)]
pub struct LogProgress {
    mode: Mode,
    total: Option<u64>,
    last: Option<u64>,
    dimensions: Option<(u32, u32)>,
    rotation: Option<f64>,
    finalized: bool,
}

impl LogProgress {
    /// Pre-pass that only counts frames; the last counter seen is the total
    pub fn frame_count() -> Self {
        Self::with_mode(Mode::CountFrames, None)
    }

    /// Real conversion tracked in frames against an optional total
    pub fn frames(total: Option<u64>) -> Self {
        Self::with_mode(Mode::Frames, total)
    }

    /// Real conversion tracked in stream time; the total comes from `Duration:`
    pub fn timed() -> Self {
        Self::with_mode(Mode::Millis, None)
    }

    fn with_mode(mode: Mode, total: Option<u64>) -> Self {
        Self {
            mode,
            total,
            last: None,
            dimensions: None,
            rotation: None,
            finalized: false,
        }
    }

    /// Feed one log line, returning the event it produced if any
    pub fn observe(&mut self, line: &str) -> Option<Progress> {
        if self.dimensions.is_none() {
            self.dimensions = parse_dimensions(line);
        } else if self.rotation.is_none() {
            // Side data follows the stream line it belongs to
            self.rotation = parse_rotation(line);
        }

        match self.mode {
            Mode::CountFrames => {
                let frame = parse_frame(line)?;
                self.last = Some(frame);
                Some(Progress::frames(ProgressStep::CountingFrames, frame, None))
            }
            Mode::Frames => {
                if let Some(frame) = parse_frame(line) {
                    self.last = Some(frame);
                    return Some(Progress::frames(ProgressStep::Converting, frame, self.total));
                }
                self.trailer(line)
            }
            Mode::Millis => {
                if self.total.is_none() {
                    if let Some(duration) = parse_duration_ms(line) {
                        self.total = Some(duration);
                        return None;
                    }
                }
                if let Some(time) = parse_time_ms(line) {
                    self.last = Some(time);
                    return Some(Progress::millis(ProgressStep::Converting, time, self.total));
                }
                self.trailer(line)
            }
        }
    }

    fn trailer(&mut self, line: &str) -> Option<Progress> {
        if !self.finalized && is_trailer(line) {
            self.finalized = true;
            return Some(Progress::step(ProgressStep::Finalizing));
        }
        None
    }

    /// Most recent counter, which is the total after a frame-count pass
    pub fn last_counter(&self) -> Option<u64> {
        self.last
    }

    /// Input size as displayed, after the engine applies any rotation
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions.map(|dims| displayed_dimensions(dims, self.rotation))
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "frame=   25 fps=0.0 q=25.0 size=      12kB time=00:00:01.00 bitrate= 98.3kbits/s speed=2.01x";
    const TRAILER: &str = "video:180kB audio:0kB subtitle:0kB other streams:0kB global headers:0kB muxing overhead: 0.1%";

    #[test]
    fn test_parse_frame_tolerates_padding() {
        assert_eq!(parse_frame(STATS), Some(25));
        assert_eq!(parse_frame("frame=10"), Some(10));
        assert_eq!(parse_frame("Input #0, mov,mp4"), None);
    }

    #[test]
    fn test_parse_dimensions() {
        let line = "  Stream #0:0(und): Video: h264 (High) (avc1 / 0x31637661), yuv420p(progressive), 1920x1080 [SAR 1:1 DAR 16:9], 4983 kb/s, 30 fps";
        assert_eq!(parse_dimensions(line), Some((1920, 1080)));
        assert_eq!(parse_dimensions("  Stream #0:1: Audio: aac, 48000 Hz, stereo"), None);
    }

    #[test]
    fn test_rotated_stream_reports_displayed_size() {
        let mut log = LogProgress::frame_count();
        log.observe("  Stream #0:0(und): Video: h264 (High), yuv420p(tv, bt709), 1920x1080, 17000 kb/s, 30 fps");
        log.observe("    Side data:");
        log.observe("      displaymatrix: rotation of -90.00 degrees");
        assert_eq!(log.dimensions(), Some((1080, 1920)));

        let mut tagged = LogProgress::frame_count();
        tagged.observe("  Stream #0:0: Video: h264, yuv420p, 1280x720, 30 fps");
        tagged.observe("      rotate          : 180");
        assert_eq!(tagged.dimensions(), Some((1280, 720)));
    }

    #[test]
    fn test_parse_rotation() {
        assert_eq!(parse_rotation("      displaymatrix: rotation of -90.00 degrees"), Some(-90.0));
        assert_eq!(parse_rotation("      rotate          : 270"), Some(270.0));
        assert_eq!(parse_rotation("frame=  25 fps=0.0"), None);
        assert_eq!(displayed_dimensions((1920, 1080), Some(-90.0)), (1080, 1920));
        assert_eq!(displayed_dimensions((1920, 1080), Some(90.0)), (1080, 1920));
        assert_eq!(displayed_dimensions((1920, 1080), None), (1920, 1080));
    }

    #[test]
    fn test_parse_times() {
        assert_eq!(parse_duration_ms("  Duration: 00:01:02.50, start: 0.000000, bitrate: 128 kb/s"), Some(62_500));
        assert_eq!(parse_time_ms("size=  512kB time=00:00:30.25 bitrate=128.0kbits/s"), Some(30_250));
    }

    #[test]
    fn test_duplicate_frames_emit_without_regression() {
        let mut log = LogProgress::frames(Some(100));
        let events: Vec<Progress> = ["frame=10", "frame=10", "frame=25"]
            .iter()
            .filter_map(|line| log.observe(line))
            .collect();

        let counters: Vec<u64> = events.iter().filter_map(|e| e.current).collect();
        assert_eq!(counters, vec![10, 10, 25]);
        assert!(events.iter().all(|e| e.total == Some(100)));
        assert_eq!(events[2].percent(), Some(25.0));
    }

    #[test]
    fn test_trailer_emits_finalizing_once() {
        let mut log = LogProgress::frames(None);
        assert_eq!(log.observe(TRAILER).map(|e| e.step), Some(ProgressStep::Finalizing));
        assert!(log.observe(TRAILER).is_none());
    }

    #[test]
    fn test_frame_count_pass_reports_total() {
        let mut log = LogProgress::frame_count();
        log.observe("  Stream #0:0: Video: h264, yuv420p, 640x360, 30 fps");
        log.observe("frame=  120 fps=0.0 q=-1.0 size=N/A time=00:00:04.00");
        log.observe("frame=  240 fps=0.0 q=-1.0 Lsize=N/A time=00:00:08.00");
        assert_eq!(log.last_counter(), Some(240));
        assert_eq!(log.dimensions(), Some((640, 360)));
    }

    #[test]
    fn test_timed_progress_uses_duration() {
        let mut log = LogProgress::timed();
        assert!(log.observe("  Duration: 00:00:10.00, start: 0.000000").is_none());
        let event = log.observe("size=  80kB time=00:00:05.00 bitrate=128.0kbits/s").unwrap();
        assert_eq!(event.unit, Some(ProgressUnit::Millis));
        assert_eq!(event.percent(), Some(50.0));
    }

    #[test]
    fn test_merge_never_regresses_within_step() {
        let mut progress = Progress::frames(ProgressStep::Converting, 25, Some(100));
        progress.merge(Progress::frames(ProgressStep::Converting, 10, Some(100)));
        assert_eq!(progress.current, Some(25));

        progress.merge(Progress::frames(ProgressStep::Converting, 25, Some(100)));
        assert_eq!(progress.current, Some(25));

        progress.merge(Progress::frames(ProgressStep::Converting, 40, None));
        assert_eq!(progress.current, Some(40));
        assert_eq!(progress.total, Some(100));
    }

    #[test]
    fn test_merge_step_change_replaces() {
        let mut progress = Progress::frames(ProgressStep::CountingFrames, 240, None);
        progress.merge(Progress::frames(ProgressStep::Converting, 1, Some(240)));
        assert_eq!(progress.current, Some(1));

        progress.merge(Progress::step(ProgressStep::Finalizing));
        assert_eq!(progress.current, None);
        assert_eq!(progress.percent(), Some(99.0));
    }

    #[test]
    fn test_percent_holds_through_finalizing() {
        let mut progress = Progress::frames(ProgressStep::Converting, 100, Some(100));
        let mut percents = vec![progress.percent()];
        for step in [ProgressStep::Finalizing, ProgressStep::ReadingOutput, ProgressStep::Done] {
            progress.merge(Progress::step(step));
            percents.push(progress.percent());
        }
        assert_eq!(percents, vec![Some(99.0), Some(99.0), Some(99.0), Some(100.0)]);
    }

    #[test]
    fn test_milestones() {
        assert_eq!(Progress::step(ProgressStep::Loading).percent(), Some(0.0));
        assert_eq!(Progress::step(ProgressStep::Done).percent(), Some(100.0));
        assert_eq!(Progress::step(ProgressStep::Queued).percent(), None);
    }
}
