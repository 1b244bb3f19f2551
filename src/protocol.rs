//! Control socket protocol definitions.
//!
//! The daemon listens on a unix stream socket (`/dev/dinitctl` for the system
//! instance, `$HOME/.dinitctl` for a user instance). Requests are single
//! binary packets, little-endian. Replies begin with a reply code byte.
//! Asynchronous information packets use codes >= 100 and carry their total
//! packet length in the second byte, so clients can skip packets they do not
//! understand.

use std::path::PathBuf;

/// Protocol version range supported by this build. A client and server are
/// compatible if their version ranges overlap.
pub const MIN_CP_VERSION: u16 = 1;
pub const MAX_CP_VERSION: u16 = 1;

// Request codes (client -> daemon)
pub const CP_QUERYVERSION: u8 = 0;
pub const CP_FINDSERVICE: u8 = 1;
pub const CP_LOADSERVICE: u8 = 2;
pub const CP_STARTSERVICE: u8 = 3;
pub const CP_WAKESERVICE: u8 = 4;
pub const CP_STOPSERVICE: u8 = 5;
pub const CP_RELEASESERVICE: u8 = 6;
pub const CP_UNPINSERVICE: u8 = 7;
pub const CP_UNLOADSERVICE: u8 = 8;
pub const CP_LISTSERVICES: u8 = 9;
pub const CP_SHUTDOWN: u8 = 10;

// Reply codes (daemon -> client)
pub const RP_ACK: u8 = 50;
pub const RP_NAK: u8 = 51;
pub const RP_BADREQ: u8 = 52;
pub const RP_CPVERSION: u8 = 53;
pub const RP_SERVICERECORD: u8 = 54;
pub const RP_NOSERVICE: u8 = 55;
pub const RP_ALREADYSS: u8 = 56;
pub const RP_SVCINFO: u8 = 57;
pub const RP_LISTDONE: u8 = 58;

// Information packet codes (daemon -> client, asynchronous). Codes >= 100;
// byte 1 of the packet is the total packet length.
pub const IP_SERVICEEVENT: u8 = 100;
pub const IP_ROLLBACK_COMPLETED: u8 = 101;

/// Length of a SERVICEEVENT packet: code, length, handle (u32), event.
pub const SERVICEEVENT_LEN: u8 = 7;
/// Length of a ROLLBACK_COMPLETED packet: code, length.
pub const ROLLBACK_COMPLETED_LEN: u8 = 2;

/// Service handle used on the wire. Stable for the lifetime of a loaded
/// service record.
pub type Handle = u32;

/// Requested shutdown variety, carried in the SHUTDOWN request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    /// Stop all services and halt the system (or just exit, when not PID 1).
    Halt,
    /// Stop all services and power off.
    Poweroff,
    /// Stop all services and reboot.
    Reboot,
}

impl ShutdownType {
    pub fn code(self) -> u8 {
        match self {
            ShutdownType::Halt => 1,
            ShutdownType::Poweroff => 2,
            ShutdownType::Reboot => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ShutdownType::Halt),
            2 => Some(ShutdownType::Poweroff),
            3 => Some(ShutdownType::Reboot),
            _ => None,
        }
    }
}

/// Default system control socket path.
pub const SYSTEM_SOCKET_PATH: &str = "/dev/dinitctl";

/// Resolve the control socket path. The system daemon uses a fixed path; a
/// user daemon uses `$HOME/.dinitctl`, falling back to the passwd database
/// when `HOME` is unset.
pub fn socket_path(system: bool) -> Option<PathBuf> {
    if system {
        return Some(PathBuf::from(SYSTEM_SOCKET_PATH));
    }
    let home = match std::env::var_os("HOME") {
        Some(h) if !h.is_empty() => Some(PathBuf::from(h)),
        _ => nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.dir),
    };
    home.map(|h| h.join(".dinitctl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_type_roundtrip() {
        for t in [ShutdownType::Halt, ShutdownType::Poweroff, ShutdownType::Reboot] {
            assert_eq!(ShutdownType::from_code(t.code()), Some(t));
        }
        assert_eq!(ShutdownType::from_code(0), None);
        assert_eq!(ShutdownType::from_code(4), None);
    }

    #[test]
    fn info_packet_codes_are_high() {
        // Clients rely on code >= 100 to recognize (and be able to skip)
        // information packets.
        assert!(IP_SERVICEEVENT >= 100);
        assert!(IP_ROLLBACK_COMPLETED >= 100);
        assert!(RP_LISTDONE < 100);
    }

    #[test]
    fn system_socket_path() {
        assert_eq!(socket_path(true), Some(PathBuf::from("/dev/dinitctl")));
    }

    #[test]
    fn user_socket_path_uses_home() {
        // HOME is set in any sane test environment; if not, the passwd
        // fallback still produces a path ending in .dinitctl.
        let path = socket_path(false).expect("no home directory");
        assert!(path.ends_with(".dinitctl"));
    }
}
