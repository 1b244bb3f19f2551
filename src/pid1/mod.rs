//! PID 1 duties.
//!
//! When running as init, the daemon must reap reparented orphans (handled by
//! the supervisor's sweep), translate termination signals into an orderly
//! rollback, and perform the final halt/poweroff/reboot once all services
//! have stopped.

mod shutdown;
mod signals;

pub use shutdown::shutdown;
pub use signals::{DaemonSignal, SignalHandler};

/// Check if we are running as PID 1.
pub fn is_pid1() -> bool {
    std::process::id() == 1
}
