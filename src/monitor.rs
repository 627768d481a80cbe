/// The progress reporter loop.
///
/// Spawns each job, samples its process tree on the poll interval, keeps the
/// session's single status message current, and sends the final update and
/// user notification exactly once when the session ends.
use crate::config::MonitorSettings;
use crate::job::{exit_code_of, JobCommand};
use crate::procstat::{reaped_children_usage, ProcessProbe, TreeSampler};
use crate::progress::{select_source, ProgressSource};
use crate::ratelimit::UpdateThrottle;
use crate::render::{render_notice, render_summary, Identity};
use crate::session::{JobSession, SessionStatus};
use crate::slack::{ChatBackend, StatusMessage};
use chrono::Local;
use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;
use tokio::process::Child;

/// Exit code used when monitoring was interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Outcome of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub exit_code: i32,
}

/// How watching a single job ended.
#[derive(Debug)]
enum JobEnd {
    Exited(ExitStatus),
    /// The job could no longer be inspected.
    Lost(String),
    Interrupted,
}

pub struct Reporter<'a> {
    settings: &'a MonitorSettings,
    identity: Identity,
    probe: Box<dyn ProcessProbe>,
    progress: Box<dyn ProgressSource>,
    message: StatusMessage<'a>,
    throttle: UpdateThrottle,
    session: JobSession,
}

impl<'a> Reporter<'a> {
    pub fn new(
        settings: &'a MonitorSettings,
        backend: &'a dyn ChatBackend,
        probe: Box<dyn ProcessProbe>,
        identity: Identity,
        command_line: String,
        job_count: usize,
    ) -> Self {
        Self {
            settings,
            identity,
            probe,
            progress: select_source(settings.progress_file.as_deref(), job_count),
            message: StatusMessage::new(backend),
            throttle: UpdateThrottle::new(settings.update_interval),
            session: JobSession::new(command_line),
        }
    }

    /// Replace the progress source chosen from the settings.
    #[cfg(test)]
    pub fn with_progress(mut self, progress: Box<dyn ProgressSource>) -> Self {
        self.progress = progress;
        self
    }

    /// Run every job and report until the session ends or `shutdown`
    /// resolves. Never kills a job.
    pub async fn run<S>(mut self, command: &JobCommand, arguments: &[String], shutdown: S) -> SessionReport
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.progress.session_started();
        self.throttle.ready();
        self.publish().await;

        let jobs: Vec<Option<&str>> = if arguments.is_empty() {
            vec![None]
        } else {
            arguments.iter().map(|a| Some(a.as_str())).collect()
        };
        let job_total = jobs.len();
        let mut first_failure: Option<i32> = None;

        for (index, arg) in jobs.into_iter().enumerate() {
            let usage_before = reaped_children_usage();
            let mut child = match command.spawn(arg, self.settings.progress_file.as_deref()) {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(error = %e, "job could not be started");
                    self.session.finish(SessionStatus::Crashed, Some(e.exit_code()));
                    break;
                }
            };
            let pid = child.id().unwrap_or_default();
            self.session.begin_job(pid);

            match self.watch(&mut child, pid, shutdown.as_mut()).await {
                JobEnd::Exited(status) => {
                    self.session
                        .record_cpu(reaped_children_usage().saturating_sub(usage_before));
                    let code = exit_code_of(status);
                    if status.code().is_none() {
                        tracing::warn!(pid, exit_code = code, "job killed by signal");
                        self.session.finish(SessionStatus::Unknown, Some(code));
                        break;
                    }

                    let success = code == 0;
                    if !success {
                        first_failure.get_or_insert(code);
                    }
                    tracing::info!(
                        pid,
                        exit_code = code,
                        job = index + 1,
                        of = job_total,
                        "job finished"
                    );
                    self.progress.job_finished(success);
                    self.session.set_counts(self.progress.poll());

                    if index + 1 < job_total && self.throttle.ready() {
                        self.publish().await;
                    }
                }
                JobEnd::Lost(reason) => {
                    tracing::warn!(pid, %reason, "lost track of job, giving up");
                    let code = child.try_wait().ok().flatten().map(exit_code_of);
                    self.session.finish(SessionStatus::Unknown, code);
                    break;
                }
                JobEnd::Interrupted => {
                    self.session
                        .finish(SessionStatus::Interrupted, Some(INTERRUPTED_EXIT_CODE));
                    break;
                }
            }
        }

        if !self.session.is_finished() {
            let status = if first_failure.is_some() {
                SessionStatus::ExitedError
            } else {
                SessionStatus::ExitedOk
            };
            self.session.finish(status, Some(first_failure.unwrap_or(0)));
        }

        self.finish().await
    }

    /// Poll one job until it exits, disappears, or shutdown is requested.
    async fn watch<S>(&mut self, child: &mut Child, pid: u32, mut shutdown: Pin<&mut S>) -> JobEnd
    where
        S: Future<Output = ()>,
    {
        let mut sampler = TreeSampler::new(pid);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return JobEnd::Exited(status),
                Ok(None) => {}
                Err(e) => return JobEnd::Lost(e.to_string()),
            }

            match sampler.sample(self.probe.as_ref()) {
                Ok(cpu) => self.session.record_cpu(cpu),
                Err(e) => {
                    // It may have exited between try_wait and the sample.
                    if let Ok(Some(status)) = child.try_wait() {
                        return JobEnd::Exited(status);
                    }
                    return JobEnd::Lost(e.to_string());
                }
            }
            self.session.set_counts(self.progress.poll());
            tracing::debug!(
                pid,
                processes = sampler.tracked(),
                cpu_user = self.session.cpu().user,
                cpu_system = self.session.cpu().system,
                "sampled job"
            );

            if self.throttle.ready() {
                self.publish().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                status = child.wait() => {
                    return match status {
                        Ok(status) => JobEnd::Exited(status),
                        Err(e) => JobEnd::Lost(e.to_string()),
                    };
                }
                _ = shutdown.as_mut() => return JobEnd::Interrupted,
            }
        }
    }

    async fn publish(&mut self) -> bool {
        self.session.mark_updated(Local::now());
        let text = render_summary(&self.session, &self.identity);
        self.message.publish(&text).await
    }

    /// Final unthrottled update plus the user notification.
    async fn finish(mut self) -> SessionReport {
        let status = self.session.status();
        let exit_code = self.session.exit_code().unwrap_or(1);
        tracing::info!(
            status = status.label(),
            pid = ?self.session.pid(),
            message = ?self.message.id().map(|id| id.to_string()),
            exit_code,
            elapsed_secs = self.session.elapsed().as_secs(),
            "session finished"
        );

        if !self.publish().await {
            tracing::error!("final status update could not be delivered");
        }
        self.message.notify(&render_notice(&self.session)).await;

        SessionReport { status, exit_code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procstat::{default_probe, ProbeError, ProcSnapshot};
    use crate::progress::NoProgress;
    use crate::session::JobCounts;
    use crate::slack::testing::{Call, RecordingBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn settings(poll_ms: u64) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(poll_ms),
            update_interval: Duration::from_millis(1),
            progress_file: None,
        }
    }

    fn identity() -> Identity {
        Identity::new("tester", "ci-host")
    }

    async fn run_command(
        settings: &MonitorSettings,
        backend: &RecordingBackend,
        probe: Box<dyn ProcessProbe>,
        command: &str,
        arguments: &[&str],
    ) -> SessionReport {
        let command = JobCommand::parse(command).unwrap();
        let arguments: Vec<String> = arguments.iter().map(|s| s.to_string()).collect();
        let reporter = Reporter::new(
            settings,
            backend,
            probe,
            identity(),
            command.display(&arguments),
            arguments.len(),
        );
        reporter
            .run(&command, &arguments, std::future::pending())
            .await
    }

    /// Probe that fails every snapshot.
    struct VanishingProbe {
        calls: Arc<AtomicUsize>,
    }

    impl ProcessProbe for VanishingProbe {
        fn snapshot(&self, root: u32) -> Result<ProcSnapshot, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::Vanished { pid: root })
        }
    }

    fn assert_single_message(backend: &RecordingBackend) {
        let calls = backend.calls();
        assert!(matches!(calls.first(), Some(Call::Post(_))));
        assert_eq!(backend.posts(), 1);
        let edits = backend.edits();
        let ids: std::collections::HashSet<_> = edits.iter().map(|(id, _)| id.clone()).collect();
        assert!(ids.len() <= 1, "edits touched more than one message");
    }

    fn final_text(backend: &RecordingBackend) -> String {
        backend
            .edits()
            .last()
            .map(|(_, text)| text.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn successful_command_reports_completed() {
        let backend = RecordingBackend::default();
        let report = run_command(&settings(50), &backend, default_probe(), "sleep 0.3", &[]).await;

        assert_eq!(
            report,
            SessionReport {
                status: SessionStatus::ExitedOk,
                exit_code: 0
            }
        );
        assert_single_message(&backend);
        assert!(backend.edits().len() >= 2, "expected running updates plus final");

        let text = final_text(&backend);
        assert!(text.starts_with("🟢 COMPLETED\n"));
        assert!(text.contains("tester@ci-host:"));
        assert!(text.contains("`sleep 0.3`"));
        assert!(text.contains(" elapsed"));
        assert!(!text.contains("jobs completed"));

        let notes = backend.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, Some(backend.edits()[0].0.clone()));
        assert!(notes[0].1.starts_with("🟢 COMPLETED `sleep 0.3`"));
        assert!(matches!(backend.calls().last(), Some(Call::Notify(..))));
    }

    #[tokio::test]
    async fn failing_command_mirrors_exit_code() {
        let backend = RecordingBackend::default();
        let report = run_command(&settings(50), &backend, default_probe(), "sh -c 'exit 3'", &[]).await;

        assert_eq!(report.status, SessionStatus::ExitedError);
        assert_eq!(report.exit_code, 3);
        assert!(final_text(&backend).starts_with("🟠 COMPLETED WITH ERRORS"));
        assert!(backend.notifications()[0].1.ends_with("(exit code 3)"));
    }

    #[tokio::test]
    async fn argument_list_runs_each_job_and_counts() {
        let backend = RecordingBackend::default();
        let report = run_command(
            &settings(20),
            &backend,
            default_probe(),
            "sh -c 'exit $0'",
            &["0", "4", "0", "5"],
        )
        .await;

        assert_eq!(report.status, SessionStatus::ExitedError);
        assert_eq!(report.exit_code, 4);
        let text = final_text(&backend);
        assert!(text.contains("4/4 (100%) jobs completed (2 failed)"), "{text}");
        assert_single_message(&backend);
        assert_eq!(backend.notifications().len(), 1);
    }

    #[tokio::test]
    async fn job_counts_never_exceed_total() {
        let backend = RecordingBackend::default();
        run_command(
            &settings(10),
            &backend,
            default_probe(),
            "sh -c 'sleep 0.05; exit $0'",
            &["0", "1", "0"],
        )
        .await;

        let re = regex::Regex::new(r"(\d+)/(\d+) .*jobs completed").unwrap();
        for (_, text) in backend.edits() {
            if let Some(caps) = re.captures(&text) {
                let completed: u64 = caps[1].parse().unwrap();
                let total: u64 = caps[2].parse().unwrap();
                assert!(completed <= total);
            }
        }
    }

    #[tokio::test]
    async fn vanished_process_ends_as_unknown() {
        let backend = RecordingBackend::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Box::new(VanishingProbe {
            calls: calls.clone(),
        });
        let report = run_command(&settings(50), &backend, probe, "sleep 1", &[]).await;

        assert_eq!(report.status, SessionStatus::Unknown);
        assert_eq!(report.exit_code, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "loop kept polling after loss");
        assert!(final_text(&backend).starts_with("⚫ LOST"));
        assert_eq!(backend.notifications().len(), 1);
    }

    #[tokio::test]
    async fn killed_process_ends_as_unknown_with_signal_code() {
        let backend = RecordingBackend::default();
        let report = run_command(
            &settings(50),
            &backend,
            default_probe(),
            "sh -c 'sleep 0.1; kill -9 $$'",
            &[],
        )
        .await;

        assert_eq!(report.status, SessionStatus::Unknown);
        assert_eq!(report.exit_code, 137);
        assert_eq!(backend.notifications().len(), 1);
    }

    #[tokio::test]
    async fn killed_job_stops_remaining_jobs() {
        let backend = RecordingBackend::default();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!("sh -c 'touch {}.$0; [ $0 = b ] && kill -9 $$; true'", marker.display());
        let report = run_command(&settings(20), &backend, default_probe(), &script, &["a", "b", "c"]).await;

        assert_eq!(report.status, SessionStatus::Unknown);
        assert!(dir.path().join("ran.a").exists());
        assert!(dir.path().join("ran.b").exists());
        assert!(!dir.path().join("ran.c").exists());
    }

    #[tokio::test]
    async fn spawn_failure_reports_crashed() {
        let backend = RecordingBackend::default();
        let report = run_command(&settings(50), &backend, default_probe(), "nonexistent-binary-xyz", &[]).await;

        assert_eq!(report.status, SessionStatus::Crashed);
        assert_eq!(report.exit_code, 127);
        assert!(final_text(&backend).starts_with("🔴 CRASHED"));
        assert_eq!(backend.notifications().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_monitoring_without_killing_job() {
        let backend = RecordingBackend::default();
        let settings = settings(50);
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let command =
            JobCommand::parse(&format!("sh -c 'sleep 0.3; touch {}'", marker.display())).unwrap();
        let reporter = Reporter::new(
            &settings,
            &backend,
            default_probe(),
            identity(),
            command.display(&[]),
            0,
        );

        let report = reporter.run(&command, &[], async {}).await;
        assert_eq!(report.status, SessionStatus::Interrupted);
        assert_eq!(report.exit_code, INTERRUPTED_EXIT_CODE);
        assert!(final_text(&backend).starts_with("🔴 INTERRUPTED"));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(marker.exists(), "job was killed by the monitor");
    }

    #[tokio::test]
    async fn transient_backend_failures_do_not_stop_the_loop() {
        let backend = RecordingBackend::failing_first(3);
        let report = run_command(&settings(30), &backend, default_probe(), "sleep 0.4", &[]).await;

        assert_eq!(report.status, SessionStatus::ExitedOk);
        assert_single_message(&backend);
        assert!(final_text(&backend).starts_with("🟢 COMPLETED"));
        assert_eq!(backend.notifications().len(), 1);
    }

    #[tokio::test]
    async fn updates_are_throttled() {
        let backend = RecordingBackend::default();
        let settings = MonitorSettings {
            poll_interval: Duration::from_millis(10),
            update_interval: Duration::from_secs(60),
            progress_file: None,
        };
        run_command(&settings, &backend, default_probe(), "sleep 0.3", &[]).await;

        // Started post plus the unthrottled final edit.
        assert_eq!(backend.posts(), 1);
        assert_eq!(backend.edits().len(), 1);
    }

    #[tokio::test]
    async fn progress_file_counts_are_rendered() {
        let backend = RecordingBackend::default();
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("progress");
        let settings = MonitorSettings {
            progress_file: Some(progress.clone()),
            ..settings(20)
        };
        run_command(
            &settings,
            &backend,
            default_probe(),
            "sh -c 'echo 3/7 2 failed > \"$SLACK_JOB_MONITOR_PROGRESS_FILE\"; sleep 0.2'",
            &[],
        )
        .await;

        assert!(final_text(&backend).contains("3/7 (42%) jobs completed (2 failed)"));
    }

    #[tokio::test]
    async fn leftover_progress_file_is_not_reported() {
        let backend = RecordingBackend::default();
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("progress");
        std::fs::write(&progress, "10/10 4 failed\n").unwrap();
        let settings = MonitorSettings {
            progress_file: Some(progress.clone()),
            ..settings(20)
        };
        let report = run_command(&settings, &backend, default_probe(), "sleep 0.2", &[]).await;

        assert_eq!(report.status, SessionStatus::ExitedOk);
        assert!(!backend.edits().is_empty());
        for (_, text) in backend.edits() {
            assert!(!text.contains("jobs completed"), "stale counts shown: {text}");
        }
        assert!(!progress.exists());
    }

    #[tokio::test]
    async fn explicit_progress_source_overrides_selection() {
        struct Fixed;
        impl ProgressSource for Fixed {
            fn poll(&mut self) -> Option<JobCounts> {
                JobCounts::new(1, 2, 0)
            }
        }

        let backend = RecordingBackend::default();
        let settings = settings(20);
        let command = JobCommand::parse("sleep 0.1").unwrap();
        let report = Reporter::new(&settings, &backend, default_probe(), identity(), "sleep 0.1".into(), 0)
            .with_progress(Box::new(Fixed))
            .run(&command, &[], std::future::pending())
            .await;
        assert_eq!(report.status, SessionStatus::ExitedOk);
        assert!(final_text(&backend).contains("1/2 (50%) jobs completed (0 failed)"));

        let backend = RecordingBackend::default();
        Reporter::new(&settings, &backend, default_probe(), identity(), "sleep 0.1".into(), 0)
            .with_progress(Box::new(NoProgress))
            .run(&command, &[], std::future::pending())
            .await;
        assert!(!final_text(&backend).contains("jobs completed"));
    }

    #[tokio::test]
    async fn sleep_scenario_polls_about_once_per_interval() {
        let backend = RecordingBackend::default();
        let settings = MonitorSettings {
            poll_interval: Duration::from_millis(200),
            update_interval: Duration::from_millis(1),
            progress_file: None,
        };
        let start = Instant::now();
        let report = run_command(&settings, &backend, default_probe(), "sleep 1", &[]).await;
        let elapsed = start.elapsed();

        assert_eq!(report.status, SessionStatus::ExitedOk);
        assert!(elapsed >= Duration::from_millis(950));
        assert!(elapsed < Duration::from_secs(3));
        // One running edit per poll (about five) plus the final edit.
        let edits = backend.edits().len();
        assert!((4..=8).contains(&edits), "unexpected edit count {edits}");
        assert!(final_text(&backend).contains("1s elapsed"));
    }
}
