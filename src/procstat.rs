/// Process tree CPU sampling.
///
/// On Linux every sample scans `/proc/<pid>/stat` once, finds the job's
/// descendants through their parent pids, and sums utime/stime. Descendants
/// that exit between samples keep their last seen figures, so the tree total
/// only grows. Other Unixes fall back to a liveness check with zero CPU.
use crate::session::CpuTimes;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// One process as seen in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcEntry {
    pub ppid: u32,
    pub cpu: CpuTimes,
}

/// All processes visible at one instant, keyed by pid.
pub type ProcSnapshot = HashMap<u32, ProcEntry>;

/// Errors raised while inspecting the job's process.
#[derive(Debug)]
pub enum ProbeError {
    /// The root process no longer exists.
    Vanished { pid: u32 },
    /// The process table could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The kernel refused to let us look at the process.
    Denied { pid: u32 },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Vanished { pid } => write!(f, "process {pid} no longer exists"),
            ProbeError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ProbeError::Denied { pid } => write!(f, "permission denied inspecting process {pid}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Io { source, .. } => Some(source),
            ProbeError::Vanished { .. } | ProbeError::Denied { .. } => None,
        }
    }
}

/// Source of process snapshots.
pub trait ProcessProbe: Send {
    /// Snapshot the processes relevant to `root`. Must include `root` itself
    /// or fail.
    fn snapshot(&self, root: u32) -> Result<ProcSnapshot, ProbeError>;
}

/// Reads `/proc` (or a directory laid out like it).
pub struct ProcFs {
    root: PathBuf,
    ticks_per_sec: f64,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc", clock_ticks())
    }

    pub fn with_root(root: impl Into<PathBuf>, ticks_per_sec: f64) -> Self {
        Self {
            root: root.into(),
            ticks_per_sec,
        }
    }

    fn read_entry(&self, pid: u32) -> std::io::Result<Option<ProcEntry>> {
        let path = self.root.join(pid.to_string()).join("stat");
        let contents = std::fs::read_to_string(path)?;
        Ok(parse_stat(&contents, self.ticks_per_sec))
    }
}

impl ProcessProbe for ProcFs {
    fn snapshot(&self, root: u32) -> Result<ProcSnapshot, ProbeError> {
        let root_entry = match self.read_entry(root) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(ProbeError::Vanished { pid: root }),
            Err(e) => {
                return Err(match e.kind() {
                    std::io::ErrorKind::NotFound => ProbeError::Vanished { pid: root },
                    std::io::ErrorKind::PermissionDenied => ProbeError::Denied { pid: root },
                    _ => ProbeError::Io {
                        path: self.root.join(root.to_string()).join("stat"),
                        source: e,
                    },
                })
            }
        };

        let dir = std::fs::read_dir(&self.root).map_err(|e| ProbeError::Io {
            path: self.root.clone(),
            source: e,
        })?;

        let mut snapshot = ProcSnapshot::new();
        snapshot.insert(root, root_entry);
        for entry in dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == root {
                continue;
            }
            // Processes come and go while we scan; skip the ones we lose.
            if let Ok(Some(proc_entry)) = self.read_entry(pid) {
                snapshot.insert(pid, proc_entry);
            }
        }
        Ok(snapshot)
    }
}

/// Liveness-only probe for hosts without `/proc`.
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn snapshot(&self, root: u32) -> Result<ProcSnapshot, ProbeError> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let raw = i32::try_from(root).map_err(|_| ProbeError::Vanished { pid: root })?;
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(ProbeError::Vanished { pid: root }),
            Err(Errno::EPERM) => return Err(ProbeError::Denied { pid: root }),
            Err(e) => {
                return Err(ProbeError::Io {
                    path: PathBuf::from(format!("pid:{root}")),
                    source: std::io::Error::from(e),
                })
            }
        }
        let mut snapshot = ProcSnapshot::new();
        snapshot.insert(
            root,
            ProcEntry {
                ppid: 0,
                cpu: CpuTimes::default(),
            },
        );
        Ok(snapshot)
    }
}

/// The probe suited to the current host.
pub fn default_probe() -> Box<dyn ProcessProbe> {
    if Path::new("/proc/self/stat").exists() {
        Box::new(ProcFs::new())
    } else {
        Box::new(SignalProbe)
    }
}

/// Parse one `/proc/<pid>/stat` line into parent pid and CPU times.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat(contents: &str, ticks_per_sec: f64) -> Option<ProcEntry> {
    let close = contents.rfind(')')?;
    let fields: Vec<&str> = contents[close + 1..].split_whitespace().collect();
    // fields[0] is field 3 (state); ppid is field 4, utime 14, stime 15.
    let ppid = fields.get(1)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(ProcEntry {
        ppid,
        cpu: CpuTimes::new(utime as f64 / ticks_per_sec, stime as f64 / ticks_per_sec),
    })
}

/// Kernel clock ticks per second, `100` if unknown.
pub fn clock_ticks() -> f64 {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        _ => 100.0,
    }
}

/// CPU used by all reaped descendants of this process.
pub fn reaped_children_usage() -> CpuTimes {
    use nix::sys::resource::{getrusage, UsageWho};
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let (user, system) = (usage.user_time(), usage.system_time());
            CpuTimes::new(
                user.tv_sec() as f64 + user.tv_usec() as f64 / 1_000_000.0,
                system.tv_sec() as f64 + system.tv_usec() as f64 / 1_000_000.0,
            )
        }
        Err(e) => {
            tracing::debug!(error = %e, "getrusage failed");
            CpuTimes::default()
        }
    }
}

/// Tracks one job's process tree across samples.
pub struct TreeSampler {
    root: u32,
    last_seen: HashMap<u32, CpuTimes>,
}

impl TreeSampler {
    pub fn new(root: u32) -> Self {
        Self {
            root,
            last_seen: HashMap::new(),
        }
    }

    /// Take one sample and return the tree's cumulative CPU.
    ///
    /// Fails only when the root process itself cannot be inspected.
    pub fn sample(&mut self, probe: &dyn ProcessProbe) -> Result<CpuTimes, ProbeError> {
        let snapshot = probe.snapshot(self.root)?;
        if !snapshot.contains_key(&self.root) {
            return Err(ProbeError::Vanished { pid: self.root });
        }

        for pid in descendants(&snapshot, self.root) {
            if let Some(entry) = snapshot.get(&pid) {
                let previous = self.last_seen.get(&pid).copied().unwrap_or_default();
                self.last_seen.insert(pid, previous.max(entry.cpu));
            }
        }
        Ok(self.total())
    }

    /// Sum of the last seen CPU of every process in the tree.
    pub fn total(&self) -> CpuTimes {
        self.last_seen
            .values()
            .fold(CpuTimes::default(), |acc, cpu| acc + *cpu)
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

/// `root` plus every process whose ancestry leads back to it.
fn descendants(snapshot: &ProcSnapshot, root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, entry) in snapshot {
        children.entry(entry.ppid).or_default().push(*pid);
    }

    let mut seen = HashSet::new();
    let mut stack = vec![root];
    let mut out = Vec::new();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        out.push(pid);
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids.iter().copied());
        }
    }
    out
}
