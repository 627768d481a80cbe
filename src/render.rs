/// Status message rendering.
use crate::session::{JobSession, SessionStatus};
use chrono::{Local, SecondsFormat};
use std::time::Duration;

/// Who launched the monitor, shown as `user@host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub host: String,
}

impl Identity {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// Look up the current user and hostname, falling back to `unknown`.
    pub fn current() -> Self {
        let user = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string());
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(user, host)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Compact duration: `5s`, `3m12s`, `2h05m`, `1d03h`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins, s) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn format_secs(secs: f64) -> String {
    format_duration(Duration::from_secs_f64(secs.max(0.0)))
}

/// Full text of the status message.
///
/// The STARTED message carries no statistics; every later message has
/// elapsed time and CPU, plus job counts when a progress source reported them.
pub fn render_summary(session: &JobSession, identity: &Identity) -> String {
    let mut lines = vec![
        session.status().label().to_string(),
        format!("{identity}:"),
        format!("`{}`", session.command_line()),
    ];

    if session.status() != SessionStatus::Started {
        lines.extend(stats_lines(session));
    }

    let updated = session.last_updated().unwrap_or_else(Local::now);
    lines.push(format!(
        "Last updated {}",
        updated.to_rfc3339_opts(SecondsFormat::Secs, false)
    ));
    lines.join("\n")
}

fn stats_lines(session: &JobSession) -> Vec<String> {
    let mut lines = vec![format!("{} elapsed", format_duration(session.elapsed()))];

    if let Some(counts) = session.counts() {
        let percent = counts
            .percent()
            .map(|p| format!(" ({p}%)"))
            .unwrap_or_default();
        lines.push(format!(
            "{}/{}{} jobs completed ({} failed)",
            counts.completed(),
            counts.total(),
            percent,
            counts.failed()
        ));
    }

    let cpu = session.cpu();
    lines.push(format!(
        "{:.0}% cpu ({} user, {} sys)",
        session.cpu_percent(),
        format_secs(cpu.user),
        format_secs(cpu.system)
    ));
    lines
}

/// One-line notice sent to the user when the session ends.
pub fn render_notice(session: &JobSession) -> String {
    let mut notice = format!(
        "{} `{}` after {}",
        session.status().label(),
        session.command_line(),
        format_duration(session.elapsed())
    );
    if let Some(code) = session.exit_code() {
        notice.push_str(&format!(" (exit code {code})"));
    }
    notice
}
