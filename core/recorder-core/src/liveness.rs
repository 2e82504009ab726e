//! Liveness monitor: detects an encoder that is running but not writing.
//!
//! The monitor snapshots the recording directory when the session begins.
//! Each tick it stats every segment named at or after the session start and
//! notes which ones changed (size or mtime) since the previous look. The file
//! the encoder is writing is the one that changed most recently; files that
//! have not changed since the snapshot are never followed. Names only bound
//! the candidates, because a wall clock stepping back can give a finished
//! segment a later name than the live one.
//!
//! When the followed file changes the monitor reports
//! [`LivenessVerdict::Rolled`] and restarts its progress clock.

use chrono::{NaiveDateTime, Timelike};
use fs_err as fs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

use crate::segment::{as_segment, SegmentFile};
use crate::session::RecordingSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// No segment file appeared within the stale timeout of session start.
    NoOutput,
    /// The active segment stopped growing for the stale timeout.
    NoProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// No output yet, still inside the startup allowance.
    Waiting,
    Healthy,
    /// The encoder started writing a new segment.
    Rolled(PathBuf),
    Stale(StaleReason),
}

#[derive(Debug, Clone)]
struct Observation {
    started_at: NaiveDateTime,
    size: u64,
    modified: Option<SystemTime>,
    /// Last tick at which this file was seen to change. `None` while it is
    /// unchanged since the session began.
    changed_at: Option<Instant>,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    record_dir: PathBuf,
    extension: String,
    not_before: NaiveDateTime,
    started: Instant,
    stale_timeout: Duration,
    observed: HashMap<PathBuf, Observation>,
    active: Option<PathBuf>,
    last_size: u64,
    last_progress: Instant,
}

impl LivenessMonitor {
    /// Must be created before the encoder is launched so that files already
    /// in the directory are recognised as not belonging to the session.
    pub fn new(
        session: &RecordingSession,
        record_dir: &Path,
        extension: &str,
        stale_timeout: Duration,
    ) -> Self {
        Self::starting_at(
            session.started_at.naive_local(),
            session.started,
            record_dir,
            extension,
            stale_timeout,
        )
    }

    pub fn starting_at(
        not_before: NaiveDateTime,
        started: Instant,
        record_dir: &Path,
        extension: &str,
        stale_timeout: Duration,
    ) -> Self {
        let mut monitor = Self {
            record_dir: record_dir.to_path_buf(),
            extension: extension.to_string(),
            // Segment names have second resolution.
            not_before: truncate_to_second(not_before),
            started,
            stale_timeout,
            observed: HashMap::new(),
            active: None,
            last_size: 0,
            last_progress: started,
        };
        for segment in segments_since(&monitor.record_dir, &monitor.extension, monitor.not_before)
        {
            if let Some((size, modified)) = stat(&segment.path) {
                monitor.observed.insert(
                    segment.path,
                    Observation {
                        started_at: segment.started_at,
                        size,
                        modified,
                        changed_at: None,
                    },
                );
            }
        }
        monitor
    }

    /// Size of the followed segment at its last observed change.
    pub fn last_observed_size(&self) -> u64 {
        self.last_size
    }

    /// When the followed segment last changed (session start until then).
    pub fn last_observed_time(&self) -> Instant {
        self.last_progress
    }

    pub fn tick(&mut self, now: Instant) -> LivenessVerdict {
        self.observe(now);

        let Some((path, observation)) = self.most_recently_changed() else {
            if self.active.is_none() {
                if now.saturating_duration_since(self.started) >= self.stale_timeout {
                    return LivenessVerdict::Stale(StaleReason::NoOutput);
                }
                return LivenessVerdict::Waiting;
            }
            // The segment we were following vanished and nothing replaced it.
            return self.check_progress(now);
        };
        let (path, size, changed_at) = (path.clone(), observation.size, observation.changed_at);

        if self.active.as_ref() != Some(&path) {
            self.active = Some(path.clone());
            self.last_size = size;
            self.last_progress = now;
            return LivenessVerdict::Rolled(path);
        }

        if changed_at == Some(now) {
            self.last_size = size;
            self.last_progress = now;
            return LivenessVerdict::Healthy;
        }

        self.check_progress(now)
    }

    fn observe(&mut self, now: Instant) {
        let segments = segments_since(&self.record_dir, &self.extension, self.not_before);
        let mut present = HashMap::with_capacity(segments.len());

        for segment in segments {
            let Some((size, modified)) = stat(&segment.path) else {
                continue;
            };
            let observation = match self.observed.remove(&segment.path) {
                Some(mut seen) => {
                    if seen.size != size || seen.modified != modified {
                        seen.size = size;
                        seen.modified = modified;
                        seen.changed_at = Some(now);
                    }
                    seen
                }
                None => Observation {
                    started_at: segment.started_at,
                    size,
                    modified,
                    changed_at: Some(now),
                },
            };
            present.insert(segment.path, observation);
        }

        self.observed = present;
    }

    /// Latest change wins; a tie (roll-over between ticks) goes to the later name.
    fn most_recently_changed(&self) -> Option<(&PathBuf, &Observation)> {
        self.observed
            .iter()
            .filter(|(_, observation)| observation.changed_at.is_some())
            .max_by(|(left_path, left), (right_path, right)| {
                left.changed_at
                    .cmp(&right.changed_at)
                    .then_with(|| left.started_at.cmp(&right.started_at))
                    .then_with(|| left_path.cmp(right_path))
            })
    }

    fn check_progress(&self, now: Instant) -> LivenessVerdict {
        if now.saturating_duration_since(self.last_progress) >= self.stale_timeout {
            LivenessVerdict::Stale(StaleReason::NoProgress)
        } else {
            LivenessVerdict::Healthy
        }
    }
}

fn truncate_to_second(value: NaiveDateTime) -> NaiveDateTime {
    value.with_nanosecond(0).unwrap_or(value)
}

fn stat(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Some((metadata.len(), metadata.modified().ok())),
        Ok(_) => None,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Failed to stat segment");
            None
        }
    }
}

/// Segments in `dir` whose embedded timestamp is at or after `not_before`.
fn segments_since(dir: &Path, extension: &str, not_before: NaiveDateTime) -> Vec<SegmentFile> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "Failed to list recording directory");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| as_segment(entry.path(), extension))
        .filter(|segment| segment.started_at >= not_before)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::segment_file_name;
    use chrono::NaiveDate;
    use std::io::Write;

    const STALE: Duration = Duration::from_secs(30);

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("valid time")
    }

    fn write_segment(dir: &Path, started_at: NaiveDateTime, bytes: &[u8]) -> PathBuf {
        let path = dir.join(segment_file_name(started_at, "mkv"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open segment");
        file.write_all(bytes).expect("write segment");
        path
    }

    fn monitor(dir: &Path, started: Instant) -> LivenessMonitor {
        LivenessMonitor::starting_at(at(10, 0, 0), started, dir, "mkv", STALE)
    }

    #[test]
    fn missing_output_is_stale_after_timeout() {
        let temp = tempfile::tempdir().expect("temp dir");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);

        assert_eq!(monitor.tick(start + Duration::from_secs(10)), LivenessVerdict::Waiting);
        assert_eq!(
            monitor.tick(start + STALE),
            LivenessVerdict::Stale(StaleReason::NoOutput)
        );
    }

    #[test]
    fn segments_from_before_the_session_are_ignored() {
        let temp = tempfile::tempdir().expect("temp dir");
        write_segment(temp.path(), at(9, 59, 59), b"old data");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);

        write_segment(temp.path(), at(9, 59, 59), b"more");
        assert_eq!(monitor.tick(start + Duration::from_secs(1)), LivenessVerdict::Waiting);
    }

    #[test]
    fn first_segment_is_reported_then_growth_keeps_it_healthy() {
        let temp = tempfile::tempdir().expect("temp dir");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);
        let path = write_segment(temp.path(), at(10, 0, 1), b"abc");

        assert_eq!(
            monitor.tick(start + Duration::from_secs(1)),
            LivenessVerdict::Rolled(path.clone())
        );
        assert_eq!(monitor.last_observed_size(), 3);

        write_segment(temp.path(), at(10, 0, 1), b"defg");
        let later = start + Duration::from_secs(40);
        assert_eq!(monitor.tick(later), LivenessVerdict::Healthy);
        assert_eq!(monitor.last_observed_size(), 7);
        assert_eq!(monitor.last_observed_time(), later);
    }

    #[test]
    fn unchanged_segment_goes_stale_after_timeout() {
        let temp = tempfile::tempdir().expect("temp dir");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);
        write_segment(temp.path(), at(10, 0, 0), b"abc");

        let seen = start + Duration::from_secs(2);
        assert!(matches!(monitor.tick(seen), LivenessVerdict::Rolled(_)));
        assert_eq!(monitor.tick(seen + Duration::from_secs(10)), LivenessVerdict::Healthy);
        assert_eq!(
            monitor.tick(seen + STALE),
            LivenessVerdict::Stale(StaleReason::NoProgress)
        );
    }

    #[test]
    fn newer_segment_is_followed() {
        let temp = tempfile::tempdir().expect("temp dir");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);
        write_segment(temp.path(), at(10, 0, 0), b"first");
        assert!(matches!(
            monitor.tick(start + Duration::from_secs(1)),
            LivenessVerdict::Rolled(_)
        ));

        let second = write_segment(temp.path(), at(16, 0, 0), b"s");
        assert_eq!(
            monitor.tick(start + Duration::from_secs(25)),
            LivenessVerdict::Rolled(second.clone())
        );
        // Progress clock restarted on roll-over.
        assert_eq!(
            monitor.tick(start + Duration::from_secs(50)),
            LivenessVerdict::Healthy
        );
        assert_eq!(monitor.last_observed_size(), 1);
    }

    #[test]
    fn growing_segment_wins_over_later_named_finished_one() {
        // Clock stepped back an hour: a finished segment from before the step
        // carries a later name than the one being written now.
        let temp = tempfile::tempdir().expect("temp dir");
        let finished = write_segment(temp.path(), at(10, 50, 0), b"finished segment");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);

        let live = write_segment(temp.path(), at(10, 0, 1), b"frame");
        let first = start + Duration::from_secs(1);
        assert_eq!(monitor.tick(first), LivenessVerdict::Rolled(live.clone()));

        for step in 1..6u64 {
            write_segment(temp.path(), at(10, 0, 1), b"frame");
            let now = first + STALE * step as u32;
            assert_eq!(monitor.tick(now), LivenessVerdict::Healthy, "tick {step}");
            assert_eq!(monitor.last_observed_time(), now);
        }
        assert!(finished.exists());
    }

    #[test]
    fn finished_segment_alone_never_counts_as_output() {
        let temp = tempfile::tempdir().expect("temp dir");
        write_segment(temp.path(), at(10, 50, 0), b"finished segment");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);

        assert_eq!(monitor.tick(start + Duration::from_secs(1)), LivenessVerdict::Waiting);
        assert_eq!(
            monitor.tick(start + STALE),
            LivenessVerdict::Stale(StaleReason::NoOutput)
        );
    }

    #[test]
    fn vanished_segment_goes_stale_once_timeout_passes() {
        let temp = tempfile::tempdir().expect("temp dir");
        let start = Instant::now();
        let mut monitor = monitor(temp.path(), start);
        let path = write_segment(temp.path(), at(10, 0, 0), b"abc");
        assert!(matches!(monitor.tick(start), LivenessVerdict::Rolled(_)));

        std::fs::remove_file(&path).expect("remove");
        assert_eq!(
            monitor.tick(start + Duration::from_secs(5)),
            LivenessVerdict::Healthy
        );
        assert_eq!(
            monitor.tick(start + STALE),
            LivenessVerdict::Stale(StaleReason::NoProgress)
        );
    }
}
