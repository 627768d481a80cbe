/// Shutdown signal detection.
///
/// SIGINT (Ctrl-C) and SIGTERM end monitoring. The job itself is left alone:
/// a terminal Ctrl-C already reaches it through the shared process group, and
/// a SIGTERM aimed at the monitor is not meant for the job.
use tokio::signal::unix::{signal, Signal, SignalKind};

/// SIGINT and SIGTERM handlers, installed as soon as this is built.
///
/// Signals that arrive before [`ShutdownSignals::recv`] is first polled are
/// kept and resolve it immediately.
pub struct ShutdownSignals {
    interrupt: Option<Signal>,
    terminate: Option<Signal>,
}

impl ShutdownSignals {
    /// Must be called from inside the runtime. If a handler cannot be
    /// installed that signal is simply not watched.
    pub fn install() -> Self {
        Self {
            interrupt: install_one(SignalKind::interrupt(), "SIGINT"),
            terminate: install_one(SignalKind::terminate(), "SIGTERM"),
        }
    }

    /// Resolves when SIGINT or SIGTERM arrives.
    pub async fn recv(mut self) {
        tokio::select! {
            _ = wait(self.interrupt.as_mut()) => tracing::warn!("received SIGINT, stopping monitor"),
            _ = wait(self.terminate.as_mut()) => tracing::warn!("received SIGTERM, stopping monitor"),
        }
    }
}

fn install_one(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(error = %e, signal = name, "failed to install signal handler");
            None
        }
    }
}

async fn wait(stream: Option<&mut Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
