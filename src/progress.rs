/// Progress sources: pluggable ways of learning completed/total/failed
/// counts while jobs run.
use crate::session::JobCounts;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// `12/40`, `12 / 40`, optionally followed by `3 failed`.
static FRACTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*/\s*(\d+)(?:\D*?(\d+)\s+failed)?").expect("valid progress regex")
});

/// Reports job counts once per poll.
pub trait ProgressSource: Send {
    /// Latest counts, or `None` when nothing usable is known.
    fn poll(&mut self) -> Option<JobCounts>;

    /// Called once before the first job starts.
    fn session_started(&mut self) {}

    /// Called by the reporter each time one job of the argument list exits.
    fn job_finished(&mut self, _success: bool) {}
}

/// Never reports counts.
pub struct NoProgress;

impl ProgressSource for NoProgress {
    fn poll(&mut self) -> Option<JobCounts> {
        None
    }
}

/// Counts the jobs of the argument list as they finish.
pub struct JobListProgress {
    total: u64,
    completed: u64,
    failed: u64,
}

impl JobListProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total: total as u64,
            completed: 0,
            failed: 0,
        }
    }
}

impl ProgressSource for JobListProgress {
    fn poll(&mut self) -> Option<JobCounts> {
        JobCounts::new(self.completed, self.total, self.failed)
    }

    fn job_finished(&mut self, success: bool) {
        if self.completed >= self.total {
            return;
        }
        self.completed += 1;
        if !success {
            self.failed += 1;
        }
    }
}

/// Reads counts from a side file the job writes to.
pub struct FileProgress {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct JsonCounts {
    completed: u64,
    total: u64,
    #[serde(default)]
    failed: u64,
}

impl FileProgress {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProgressSource for FileProgress {
    /// Drop whatever an earlier run left behind so stale counts are never shown.
    fn session_started(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed stale progress file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "failed to remove stale progress file"
            ),
        }
    }

    fn poll(&mut self) -> Option<JobCounts> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    path = %self.path.display(),
                    "progress file not readable"
                );
                return None;
            }
        };
        let counts = parse_progress(&contents);
        if counts.is_none() && !contents.trim().is_empty() {
            tracing::debug!(path = %self.path.display(), "progress file has no usable counts");
        }
        counts
    }
}

/// Parse the last non-empty line of a progress report.
pub fn parse_progress(contents: &str) -> Option<JobCounts> {
    let line = contents.lines().rev().find(|l| !l.trim().is_empty())?.trim();

    if line.starts_with('{') {
        let json: JsonCounts = serde_json::from_str(line).ok()?;
        return JobCounts::new(json.completed, json.total, json.failed);
    }

    let caps = FRACTION_LINE.captures(line)?;
    let completed = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    let failed = match caps.get(3) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    JobCounts::new(completed, total, failed)
}

/// Choose the progress source for a session.
pub fn select_source(progress_file: Option<&Path>, job_count: usize) -> Box<dyn ProgressSource> {
    match progress_file {
        Some(path) => Box::new(FileProgress::new(path)),
        None if job_count > 1 => Box::new(JobListProgress::new(job_count)),
        None => Box::new(NoProgress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_fraction() {
        let counts = parse_progress("12/40\n").unwrap();
        assert_eq!(
            (counts.completed(), counts.total(), counts.failed()),
            (12, 40, 0)
        );
    }

    #[test]
    fn parses_fraction_with_failures() {
        let counts = parse_progress("12 / 40 done, 3 failed").unwrap();
        assert_eq!(counts.failed(), 3);
        assert_eq!(counts.percent(), Some(30));
    }

    #[test]
    fn uses_last_non_empty_line() {
        let counts = parse_progress("1/10\n2/10\n5/10\n\n  \n").unwrap();
        assert_eq!(counts.completed(), 5);
    }

    #[test]
    fn parses_json_line() {
        let counts = parse_progress(r#"{"completed": 4, "total": 8, "failed": 1}"#).unwrap();
        assert_eq!(
            (counts.completed(), counts.total(), counts.failed()),
            (4, 8, 1)
        );
        let counts = parse_progress(r#"{"completed": 4, "total": 8}"#).unwrap();
        assert_eq!(counts.failed(), 0);
    }

    #[test]
    fn rejects_inconsistent_counts() {
        assert!(parse_progress("9/4").is_none());
        assert!(parse_progress("2/4 3 failed").is_none());
        assert!(parse_progress(r#"{"completed": 5, "total": 1}"#).is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_progress("").is_none());
        assert!(parse_progress("working hard").is_none());
        assert!(parse_progress("{not json").is_none());
    }

    #[test]
    fn no_progress_never_reports() {
        let mut source = NoProgress;
        source.job_finished(true);
        assert!(source.poll().is_none());
    }

    #[test]
    fn job_list_counts_finished_jobs() {
        let mut source = JobListProgress::new(3);
        assert_eq!(source.poll(), JobCounts::new(0, 3, 0));
        source.job_finished(true);
        source.job_finished(false);
        assert_eq!(source.poll(), JobCounts::new(2, 3, 1));
        source.job_finished(true);
        source.job_finished(true);
        assert_eq!(source.poll(), JobCounts::new(3, 3, 1));
    }

    #[test]
    fn file_progress_reads_latest_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let mut source = FileProgress::new(&path);
        assert!(source.poll().is_none());

        std::fs::write(&path, "1/4\n").unwrap();
        assert_eq!(source.poll(), JobCounts::new(1, 4, 0));

        std::fs::write(&path, "1/4\n3/4 1 failed\n").unwrap();
        assert_eq!(source.poll(), JobCounts::new(3, 4, 1));
    }

    #[test]
    fn huge_counters_do_not_overflow_percent() {
        let counts = parse_progress("1000000000000000000/1000000000000000000").unwrap();
        assert_eq!(counts.percent(), Some(100));
    }

    #[test]
    fn file_progress_discards_previous_run_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        std::fs::write(&path, "10/10 4 failed\n").unwrap();

        let mut source = FileProgress::new(&path);
        source.session_started();
        assert!(!path.exists());
        assert!(source.poll().is_none());

        std::fs::write(&path, "1/3\n").unwrap();
        assert_eq!(source.poll(), JobCounts::new(1, 3, 0));
    }

    #[test]
    fn file_progress_start_without_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileProgress::new(dir.path().join("missing"));
        source.session_started();
        assert!(source.poll().is_none());
    }

    #[test]
    fn selection_prefers_file_then_job_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        std::fs::write(&path, "2/9").unwrap();

        let mut source = select_source(Some(&path), 5);
        assert_eq!(source.poll(), JobCounts::new(2, 9, 0));

        let mut source = select_source(None, 5);
        assert_eq!(source.poll(), JobCounts::new(0, 5, 0));

        let mut source = select_source(None, 1);
        assert!(source.poll().is_none());
    }
}
