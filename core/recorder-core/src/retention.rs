//! Retention: oldest-first eviction of completed segments.
//!
//! A sweep only considers files named `<timestamp>.<ext>` that are strictly
//! older than the active segment. Ordering comes from the filename, never from
//! filesystem metadata. The last remaining completed segment is never evicted.
//!
//! The worker thread sweeps once at start, then every cleanup interval, and
//! immediately whenever the supervisor reports a new segment.

use fs_err as fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::RecorderConfig;
use crate::error::RetentionError;
use crate::segment::{as_segment, oldest_first, parse_segment_timestamp, SegmentFile};
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_segment_count: usize,
    pub max_total_bytes: u64,
}

impl RetentionPolicy {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            max_segment_count: config.max_segment_count,
            max_total_bytes: config.max_total_bytes,
        }
    }

    fn exceeded(&self, count: usize, bytes: u64) -> bool {
        count > self.max_segment_count || bytes > self.max_total_bytes
    }
}

/// Read-only (for everyone but the supervisor) view of the segment being written.
#[derive(Debug, Clone, Default)]
pub struct ActiveSegment {
    inner: Arc<RwLock<Option<PathBuf>>>,
}

impl ActiveSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: Option<PathBuf>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    pub fn get(&self) -> Option<PathBuf> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub empty_removed: Vec<PathBuf>,
    pub remaining_count: usize,
    pub remaining_bytes: u64,
    pub errors: Vec<RetentionError>,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty() && self.empty_removed.is_empty() && self.errors.is_empty()
    }
}

struct Candidate {
    segment: SegmentFile,
    size: u64,
}

/// Runs one retention sweep over `dir`.
pub fn sweep(
    dir: &Path,
    extension: &str,
    active: Option<&Path>,
    policy: &RetentionPolicy,
) -> SweepReport {
    let mut report = SweepReport::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) => {
            report.errors.push(RetentionError::List {
                path: dir.to_path_buf(),
                source,
            });
            return report;
        }
    };

    let active_started_at = active.and_then(|path| parse_segment_timestamp(path, extension));

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) => {
                report.errors.push(RetentionError::List {
                    path: dir.to_path_buf(),
                    source,
                });
                continue;
            }
        };
        let Some(segment) = as_segment(entry.path(), extension) else {
            continue;
        };
        if active.is_some_and(|active| same_file(active, &segment.path)) {
            continue;
        }
        if let Some(active_started_at) = active_started_at {
            if segment.started_at >= active_started_at {
                continue;
            }
        }

        let metadata = match fs::metadata(&segment.path) {
            Ok(metadata) => metadata,
            Err(source) => {
                report.errors.push(RetentionError::Stat {
                    path: segment.path,
                    source,
                });
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        if metadata.len() == 0 {
            match fs::remove_file(&segment.path) {
                Ok(()) => {
                    info!(path = %segment.path.display(), "Removed empty segment");
                    report.empty_removed.push(segment.path);
                }
                Err(source) => report.errors.push(RetentionError::Delete {
                    path: segment.path,
                    source,
                }),
            }
            continue;
        }

        candidates.push(Candidate {
            size: metadata.len(),
            segment,
        });
    }

    candidates.sort_by(|left, right| oldest_first(&left.segment, &right.segment));

    let mut count = candidates.len();
    let mut bytes: u64 = candidates.iter().map(|c| c.size).sum();

    for candidate in &candidates {
        if count <= 1 || !policy.exceeded(count, bytes) {
            break;
        }
        let reason = if count > policy.max_segment_count {
            "count"
        } else {
            "size"
        };
        match fs::remove_file(&candidate.segment.path) {
            Ok(()) => {
                info!(
                    path = %candidate.segment.path.display(),
                    bytes = candidate.size,
                    reason,
                    "Evicted segment"
                );
                report.deleted.push(candidate.segment.path.clone());
                count -= 1;
                bytes = bytes.saturating_sub(candidate.size);
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %candidate.segment.path.display(), "Segment vanished before eviction");
                count -= 1;
                bytes = bytes.saturating_sub(candidate.size);
            }
            Err(source) => {
                warn!(path = %candidate.segment.path.display(), error = %source, "Failed to evict segment");
                report.errors.push(RetentionError::Delete {
                    path: candidate.segment.path.clone(),
                    source,
                });
            }
        }
    }

    report.remaining_count = count;
    report.remaining_bytes = bytes;
    report
}

fn same_file(left: &Path, right: &Path) -> bool {
    left == right || (left.file_name().is_some() && left.file_name() == right.file_name())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetentionSignal {
    Wake,
    Stop,
}

/// Handle to the background retention thread.
#[derive(Debug)]
pub struct RetentionWorker {
    tx: Sender<RetentionSignal>,
    join: Option<JoinHandle<()>>,
}

impl RetentionWorker {
    pub fn spawn(config: Arc<RecorderConfig>, active: ActiveSegment, shutdown: ShutdownFlag) -> Self {
        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("retention".to_string())
            .spawn(move || run_worker(&config, &active, &shutdown, &rx));

        let join = match join {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "Failed to start retention worker");
                None
            }
        };
        Self { tx, join }
    }

    /// Requests an immediate sweep. Never blocks.
    pub fn wake(&self) {
        let _ = self.tx.send(RetentionSignal::Wake);
    }

    /// Stops the worker and waits for an in-flight sweep to finish.
    pub fn stop(mut self) {
        self.shutdown_thread();
    }

    fn shutdown_thread(&mut self) {
        let _ = self.tx.send(RetentionSignal::Stop);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Retention worker panicked");
            }
        }
    }
}

impl Drop for RetentionWorker {
    fn drop(&mut self) {
        self.shutdown_thread();
    }
}

fn run_worker(
    config: &RecorderConfig,
    active: &ActiveSegment,
    shutdown: &ShutdownFlag,
    rx: &Receiver<RetentionSignal>,
) {
    let policy = RetentionPolicy::from_config(config);
    info!(
        max_segment_count = policy.max_segment_count,
        max_total_bytes = policy.max_total_bytes,
        interval_secs = config.cleanup_interval.as_secs(),
        "Retention worker started"
    );

    loop {
        run_sweep(config, active, &policy);

        if shutdown.is_requested() {
            break;
        }

        match rx.recv_timeout(config.cleanup_interval) {
            Ok(RetentionSignal::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(RetentionSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if drain_pending(rx) {
            break;
        }
    }

    debug!("Retention worker stopped");
}

/// Coalesces queued wakes. Returns `true` if a stop was queued.
fn drain_pending(rx: &Receiver<RetentionSignal>) -> bool {
    while let Ok(signal) = rx.try_recv() {
        if signal == RetentionSignal::Stop {
            return true;
        }
    }
    false
}

fn run_sweep(config: &RecorderConfig, active: &ActiveSegment, policy: &RetentionPolicy) {
    let active_path = active.get();
    let report = sweep(
        &config.record_dir,
        config.segment_extension(),
        active_path.as_deref(),
        policy,
    );

    for err in &report.errors {
        warn!(error = %err, "Retention sweep error");
    }
    if report.is_noop() {
        debug!(
            remaining = report.remaining_count,
            bytes = report.remaining_bytes,
            "Retention sweep found nothing to evict"
        );
    } else {
        info!(
            deleted = report.deleted.len(),
            empty_removed = report.empty_removed.len(),
            remaining = report.remaining_count,
            bytes = report.remaining_bytes,
            errors = report.errors.len(),
            "Retention sweep finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::segment_file_name;
    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
    use std::time::{Duration, Instant};

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid time")
    }

    fn write_segments(dir: &Path, count: usize, size: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let started_at = base() + ChronoDuration::hours(6 * i as i64);
                let path = dir.join(segment_file_name(started_at, "mkv"));
                std::fs::write(&path, vec![0u8; size]).expect("write segment");
                path
            })
            .collect()
    }

    fn policy(count: usize, bytes: u64) -> RetentionPolicy {
        RetentionPolicy {
            max_segment_count: count,
            max_total_bytes: bytes,
        }
    }

    fn remaining(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn count_threshold_evicts_exactly_the_oldest() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths = write_segments(temp.path(), 260, 4);

        let report = sweep(temp.path(), "mkv", None, &policy(256, u64::MAX));

        assert_eq!(report.deleted, paths[..4].to_vec());
        assert_eq!(report.remaining_count, 256);
        assert_eq!(remaining(temp.path()), paths[4..].to_vec());
    }

    #[test]
    fn second_sweep_is_a_fixed_point() {
        let temp = tempfile::tempdir().expect("temp dir");
        write_segments(temp.path(), 12, 100);
        let policy = policy(5, 450);

        let first = sweep(temp.path(), "mkv", None, &policy);
        assert!(!first.deleted.is_empty());
        let second = sweep(temp.path(), "mkv", None, &policy);
        assert!(second.is_noop());
        assert_eq!(second.remaining_count, first.remaining_count);
    }

    #[test]
    fn size_threshold_evicts_until_under_budget() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths = write_segments(temp.path(), 10, 100);

        let report = sweep(temp.path(), "mkv", None, &policy(256, 350));

        assert_eq!(report.deleted, paths[..7].to_vec());
        assert_eq!(report.remaining_count, 3);
        assert_eq!(report.remaining_bytes, 300);
    }

    #[test]
    fn active_segment_and_newer_files_are_never_touched() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths = write_segments(temp.path(), 6, 100);
        let active = paths[3].clone();

        let report = sweep(temp.path(), "mkv", Some(&active), &policy(1, 1));

        assert!(!report.deleted.contains(&active));
        assert!(active.exists());
        assert!(paths[4].exists());
        assert!(paths[5].exists());
        // Older completed segments shrink to the single-file floor.
        assert_eq!(report.deleted, paths[..2].to_vec());
        assert!(paths[2].exists());
    }

    #[test]
    fn last_completed_segment_survives_an_impossible_budget() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths = write_segments(temp.path(), 3, 1_000);

        let report = sweep(temp.path(), "mkv", None, &policy(256, 10));

        assert_eq!(report.remaining_count, 1);
        assert_eq!(remaining(temp.path()), vec![paths[2].clone()]);
    }

    #[test]
    fn empty_segments_are_removed_and_foreign_files_ignored() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths = write_segments(temp.path(), 3, 10);
        let empty = temp
            .path()
            .join(segment_file_name(base() - ChronoDuration::hours(1), "mkv"));
        std::fs::write(&empty, b"").expect("write empty");
        let notes = temp.path().join("notes.txt");
        std::fs::write(&notes, b"keep me").expect("write notes");
        let odd = temp.path().join("camera.mkv");
        std::fs::write(&odd, b"keep me too").expect("write odd");

        let report = sweep(temp.path(), "mkv", None, &policy(256, u64::MAX));

        assert_eq!(report.empty_removed, vec![empty.clone()]);
        assert!(report.deleted.is_empty());
        assert!(!empty.exists());
        assert!(notes.exists());
        assert!(odd.exists());
        assert!(paths.iter().all(|p| p.exists()));
    }

    #[test]
    fn ordering_follows_filename_not_mtime() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths = write_segments(temp.path(), 3, 10);
        // Touch the oldest segment last so its mtime is the newest.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&paths[0], vec![1u8; 10]).expect("rewrite");

        let report = sweep(temp.path(), "mkv", None, &policy(2, u64::MAX));
        assert_eq!(report.deleted, vec![paths[0].clone()]);
    }

    #[test]
    fn missing_directory_is_reported_not_fatal() {
        let temp = tempfile::tempdir().expect("temp dir");
        let report = sweep(
            &temp.path().join("missing"),
            "mkv",
            None,
            &policy(1, 1),
        );
        assert_eq!(report.errors.len(), 1);
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn worker_sweeps_on_start_and_on_wake() {
        let temp = tempfile::tempdir().expect("temp dir");
        write_segments(temp.path(), 5, 10);
        let mut config = RecorderConfig::new("rtsp://unused");
        config.record_dir = temp.path().to_path_buf();
        config.max_segment_count = 3;
        config.cleanup_interval = Duration::from_secs(3600);
        let config = Arc::new(config);

        let worker = RetentionWorker::spawn(
            Arc::clone(&config),
            ActiveSegment::new(),
            ShutdownFlag::new(),
        );
        wait_for_count(temp.path(), 3);

        let extra = base() + ChronoDuration::days(30);
        for i in 0..2 {
            let path = temp
                .path()
                .join(segment_file_name(extra + ChronoDuration::hours(i), "mkv"));
            std::fs::write(&path, b"data").expect("write");
        }
        worker.wake();
        wait_for_count(temp.path(), 3);
        worker.stop();
    }

    fn wait_for_count(dir: &Path, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if remaining(dir).len() == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "expected {} files in {}, found {}",
            expected,
            dir.display(),
            remaining(dir).len()
        );
    }
}
