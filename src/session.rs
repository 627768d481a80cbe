/// Job session: the in-memory record of one monitored invocation, from
/// launch until the final notification.
use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// Session states rendered into the status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Started,
    Running,
    ExitedOk,
    ExitedError,
    /// The process could not be inspected or died from a signal.
    Unknown,
    Interrupted,
    Crashed,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Started => "⚪ STARTED",
            SessionStatus::Running => "🔵 RUNNING",
            SessionStatus::ExitedOk => "🟢 COMPLETED",
            SessionStatus::ExitedError => "🟠 COMPLETED WITH ERRORS",
            SessionStatus::Unknown => "⚫ LOST",
            SessionStatus::Interrupted => "🔴 INTERRUPTED",
            SessionStatus::Crashed => "🔴 CRASHED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Started | SessionStatus::Running)
    }
}

/// User and system CPU seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: f64,
    pub system: f64,
}

impl CpuTimes {
    pub fn new(user: f64, system: f64) -> Self {
        Self { user, system }
    }

    pub fn total(&self) -> f64 {
        self.user + self.system
    }

    /// Component-wise maximum.
    pub fn max(self, other: CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.max(other.user),
            system: self.system.max(other.system),
        }
    }

    /// Component-wise difference, clamped at zero.
    pub fn saturating_sub(self, other: CpuTimes) -> CpuTimes {
        CpuTimes {
            user: (self.user - other.user).max(0.0),
            system: (self.system - other.system).max(0.0),
        }
    }
}

impl std::ops::Add for CpuTimes {
    type Output = CpuTimes;

    fn add(self, rhs: CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user + rhs.user,
            system: self.system + rhs.system,
        }
    }
}

/// Completed/total/failed job counts. Always satisfies
/// `failed <= completed <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCounts {
    completed: u64,
    total: u64,
    failed: u64,
}

impl JobCounts {
    /// Returns `None` for triples that violate the ordering.
    pub fn new(completed: u64, total: u64, failed: u64) -> Option<Self> {
        if completed > total || failed > completed {
            return None;
        }
        Some(Self {
            completed,
            total,
            failed,
        })
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Whole percent complete; `None` when total is zero.
    pub fn percent(&self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        Some((u128::from(self.completed) * 100 / u128::from(self.total)) as u64)
    }
}

/// Mutable session record. The reporter loop is its only writer.
#[derive(Debug)]
pub struct JobSession {
    command_line: String,
    pid: Option<u32>,
    started: Instant,
    last_updated: Option<DateTime<Local>>,
    /// CPU used by jobs that already finished.
    finished_cpu: CpuTimes,
    /// CPU used by the running job and its descendants.
    current_cpu: CpuTimes,
    counts: Option<JobCounts>,
    status: SessionStatus,
    exit_code: Option<i32>,
    ended: Option<Instant>,
}

impl JobSession {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            pid: None,
            started: Instant::now(),
            last_updated: None,
            finished_cpu: CpuTimes::default(),
            current_cpu: CpuTimes::default(),
            counts: None,
            status: SessionStatus::Started,
            exit_code: None,
            ended: None,
        }
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn counts(&self) -> Option<JobCounts> {
        self.counts
    }

    pub fn last_updated(&self) -> Option<DateTime<Local>> {
        self.last_updated
    }

    /// Wall-clock time since launch, frozen once the session is terminal.
    pub fn elapsed(&self) -> Duration {
        match self.ended {
            Some(end) => end.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    /// Cumulative CPU across all jobs of the session.
    pub fn cpu(&self) -> CpuTimes {
        self.finished_cpu + self.current_cpu
    }

    /// `(user + system) / elapsed * 100`.
    pub fn cpu_percent(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.cpu().total() / secs * 100.0
    }

    /// Mark a new job as running under `pid`.
    pub fn begin_job(&mut self, pid: u32) {
        if self.is_finished() {
            return;
        }
        self.finished_cpu = self.finished_cpu + self.current_cpu;
        self.current_cpu = CpuTimes::default();
        self.pid = Some(pid);
        self.status = SessionStatus::Running;
    }

    /// Record a CPU sample for the running job. Samples never lower the
    /// stored value.
    pub fn record_cpu(&mut self, sample: CpuTimes) {
        if self.is_finished() {
            return;
        }
        self.current_cpu = self.current_cpu.max(sample);
    }

    pub fn set_counts(&mut self, counts: Option<JobCounts>) {
        if self.is_finished() {
            return;
        }
        if counts.is_some() {
            self.counts = counts;
        }
    }

    pub fn mark_updated(&mut self, at: DateTime<Local>) {
        self.last_updated = Some(at);
    }

    /// Fix the terminal status. Returns `false` if it was already fixed.
    pub fn finish(&mut self, status: SessionStatus, exit_code: Option<i32>) -> bool {
        if self.is_finished() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.ended = Some(Instant::now());
        true
    }
}
