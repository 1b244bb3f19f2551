//! Daemon signal handling.
//!
//! As PID 1, SIGTERM and SIGINT request shutdown and reboot; SIGHUP is
//! reserved for configuration reload. In user mode the same signals simply
//! stop the session manager.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Shutdown request (SIGTERM).
    Term,
    /// Interrupt (SIGINT); reboot when PID 1.
    Int,
    /// Hangup (SIGHUP).
    Hup,
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(SignalHandler {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal.
    pub async fn wait(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.sigterm.recv() => DaemonSignal::Term,
            _ = self.sigint.recv() => DaemonSignal::Int,
            _ = self.sighup.recv() => DaemonSignal::Hup,
        }
    }

    /// Spawn a task that forwards signals to a channel.
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<DaemonSignal> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                let sig = self.wait().await;
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
