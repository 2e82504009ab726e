//! Segment naming and directory layout.
//!
//! Segments are named after the local wall-clock time their recording started:
//! `yyyy-mm-dd_hh-mm-ss.<ext>`. The same format is handed to the encoder as a
//! strftime pattern, and parsed back by the liveness monitor and retention
//! worker to order segments without trusting filesystem metadata.

use chrono::{DateTime, Local, NaiveDateTime};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// chrono/strftime format shared by the daemon and the encoder.
pub const SEGMENT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// A recognised segment file in the recording directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub started_at: NaiveDateTime,
}

/// File name for a segment starting at `started_at`.
pub fn segment_file_name(started_at: NaiveDateTime, extension: &str) -> String {
    format!("{}.{}", started_at.format(SEGMENT_TIME_FORMAT), extension)
}

/// Output path for a segment starting at `started_at` (local time).
pub fn segment_path(dir: &Path, started_at: DateTime<Local>, extension: &str) -> PathBuf {
    dir.join(segment_file_name(started_at.naive_local(), extension))
}

/// Output pattern passed to the encoder so it names its own segments.
pub fn encoder_output_pattern(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", SEGMENT_TIME_FORMAT, extension))
}

/// Parses the start timestamp embedded in a segment file name.
///
/// Returns `None` for anything that is not exactly `<timestamp>.<extension>`.
/// The extension comparison ignores ASCII case.
pub fn parse_segment_timestamp(path: &Path, extension: &str) -> Option<NaiveDateTime> {
    let file_ext = path.extension()?.to_str()?;
    if !file_ext.eq_ignore_ascii_case(extension) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDateTime::parse_from_str(stem, SEGMENT_TIME_FORMAT).ok()
}

/// Wraps `path` as a [`SegmentFile`] if its name is a segment name.
pub fn as_segment(path: PathBuf, extension: &str) -> Option<SegmentFile> {
    let started_at = parse_segment_timestamp(&path, extension)?;
    Some(SegmentFile { path, started_at })
}

/// Oldest first by embedded timestamp, then by path.
pub fn oldest_first(left: &SegmentFile, right: &SegmentFile) -> Ordering {
    left.started_at
        .cmp(&right.started_at)
        .then_with(|| left.path.cmp(&right.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("valid time")
    }

    #[test]
    fn file_name_uses_fixed_layout() {
        assert_eq!(segment_file_name(at(7, 5, 3), "mkv"), "2024-03-09_07-05-03.mkv");
    }

    #[test]
    fn segment_path_joins_directory() {
        let local = Local
            .from_local_datetime(&at(23, 59, 59))
            .single()
            .expect("unambiguous local time");
        let path = segment_path(Path::new("/srv/record"), local, "mkv");
        assert_eq!(path, PathBuf::from("/srv/record/2024-03-09_23-59-59.mkv"));
    }

    #[test]
    fn parse_round_trips_generated_names() {
        let name = segment_file_name(at(12, 0, 1), "mkv");
        let parsed = parse_segment_timestamp(Path::new(&name), "mkv");
        assert_eq!(parsed, Some(at(12, 0, 1)));
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(parse_segment_timestamp(Path::new("notes.txt"), "mkv"), None);
        assert_eq!(
            parse_segment_timestamp(Path::new("2024-03-09_12-00-01.mp4"), "mkv"),
            None
        );
        assert_eq!(parse_segment_timestamp(Path::new("camera.mkv"), "mkv"), None);
        assert_eq!(
            parse_segment_timestamp(Path::new("2024-03-09 12:00:01.mkv"), "mkv"),
            None
        );
    }

    #[test]
    fn parse_accepts_uppercase_extension() {
        assert_eq!(
            parse_segment_timestamp(Path::new("2024-03-09_12-00-01.MKV"), "mkv"),
            Some(at(12, 0, 1))
        );
    }

    #[test]
    fn sort_orders_by_embedded_time() {
        let mut segments = vec![
            as_segment(PathBuf::from("2024-03-09_10-00-00.mkv"), "mkv").expect("segment"),
            as_segment(PathBuf::from("2024-03-09_08-00-00.mkv"), "mkv").expect("segment"),
            as_segment(PathBuf::from("2024-03-09_09-00-00.mkv"), "mkv").expect("segment"),
        ];
        segments.sort_by(oldest_first);
        let hours: Vec<_> = segments
            .iter()
            .map(|s| s.started_at.format("%H").to_string())
            .collect();
        assert_eq!(hours, vec!["08", "09", "10"]);
    }

    #[test]
    fn encoder_pattern_keeps_strftime_tokens() {
        let pattern = encoder_output_pattern(Path::new("record"), "mkv");
        assert_eq!(pattern, PathBuf::from("record/%Y-%m-%d_%H-%M-%S.mkv"));
    }
}
