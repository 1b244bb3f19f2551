//! Service state machine types.
//!
//! ```text
//!     ┌─────────┐  start   ┌──────────┐  deps met, exec ok  ┌─────────┐
//!     │ Stopped ├─────────▶│ Starting ├────────────────────▶│ Started │
//!     └─────────┘          └────┬─────┘                     └────┬────┘
//!          ▲   failed to start, │                                │ do_stop
//!          │   interrupted start│                                ▼
//!          │                    │                          ┌──────────┐
//!          └────────────────────┴─────────────────────◀────┤ Stopping │
//!                             stopped (dependents down)    └──────────┘
//! ```
//!
//! `Starting` and `Stopping` are transient: a service in one of them is
//! either waiting on dependency edges (`waiting_for_deps`) or on an
//! asynchronous completion (exec status, child exit, stop script, timer).

/// Observable state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Stopping => "stopping",
        }
    }

    /// Wire code used in control protocol packets.
    pub fn code(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Starting => 1,
            ServiceState::Started => 2,
            ServiceState::Stopping => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ServiceState::Stopped),
            1 => Some(ServiceState::Starting),
            2 => Some(ServiceState::Started),
            3 => Some(ServiceState::Stopping),
            _ => None,
        }
    }
}

/// Lifecycle events reported to control connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Started,
    Stopped,
    FailedStart,
    StartCancelled,
    StopCancelled,
}

impl ServiceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceEvent::Started => "started",
            ServiceEvent::Stopped => "stopped",
            ServiceEvent::FailedStart => "failed to start",
            ServiceEvent::StartCancelled => "start cancelled",
            ServiceEvent::StopCancelled => "stop cancelled",
        }
    }

    /// Wire code used in SERVICEEVENT packets.
    pub fn code(self) -> u8 {
        match self {
            ServiceEvent::Started => 0,
            ServiceEvent::Stopped => 1,
            ServiceEvent::FailedStart => 2,
            ServiceEvent::StartCancelled => 3,
            ServiceEvent::StopCancelled => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ServiceEvent::Started),
            1 => Some(ServiceEvent::Stopped),
            2 => Some(ServiceEvent::FailedStart),
            3 => Some(ServiceEvent::StartCancelled),
            4 => Some(ServiceEvent::StopCancelled),
            _ => None,
        }
    }
}

/// Recorded exit of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process exited with the given code.
    Exited(i32),
    /// Process was killed by the given signal.
    Signaled(i32),
}

impl ExitStatus {
    /// A clean exit: `exit(0)`.
    pub fn success(self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Convert a `waitpid` status, if it describes a termination.
    pub fn from_wait_status(status: nix::sys::wait::WaitStatus) -> Option<Self> {
        use nix::sys::wait::WaitStatus;
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(ExitStatus::Signaled(sig as i32)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for s in [
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Started,
            ServiceState::Stopping,
        ] {
            assert_eq!(ServiceState::from_code(s.code()), Some(s));
        }
        assert_eq!(ServiceState::from_code(4), None);
    }

    #[test]
    fn event_codes_roundtrip() {
        for e in [
            ServiceEvent::Started,
            ServiceEvent::Stopped,
            ServiceEvent::FailedStart,
            ServiceEvent::StartCancelled,
            ServiceEvent::StopCancelled,
        ] {
            assert_eq!(ServiceEvent::from_code(e.code()), Some(e));
        }
        assert_eq!(ServiceEvent::from_code(5), None);
    }

    #[test]
    fn exit_status_success() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert!(!ExitStatus::Signaled(15).success());
    }
}
