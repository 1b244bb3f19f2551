//! Per-service records: identity, state fields, dependency edges and
//! per-type extension data.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::task::JoinHandle;

use super::state::{ExitStatus, ServiceState};
use super::ServiceId;

/// Default restart throttle: at most 3 restarts within 10 seconds, with a
/// minimum of 200 ms between consecutive restarts.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RESTART_COUNT: u32 = 3;
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(200);

/// The closed set of service varieties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// No process of its own; started/stopped instantly. Used for grouping
    /// other services under a common dependency.
    Internal,
    /// A long-running foreground process, supervised directly.
    Process,
    /// A daemonizing process: the launcher exits and the real pid is read
    /// from a pid file.
    Bgprocess,
    /// A command run to completion for start, and optionally another for
    /// stop.
    Scripted,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Internal => "internal",
            ServiceType::Process => "process",
            ServiceType::Bgprocess => "bgprocess",
            ServiceType::Scripted => "scripted",
        }
    }
}

/// Start-time behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnstartFlags {
    /// Keep the console for the whole time the service runs.
    pub runs_on_console: bool,
    /// Hold the console only while starting.
    pub starts_on_console: bool,
    /// Do not send SIGTERM when stopping (an extra term signal may still be
    /// configured).
    pub no_sigterm: bool,
    /// Pass one end of a control socketpair to the child via `DINIT_CS_FD`.
    pub pass_cs_fd: bool,
}

/// Supervision state shared by all process-backed service types.
#[derive(Debug)]
pub struct ProcessFields {
    /// Command and arguments for the start process.
    pub args: Vec<String>,
    /// Output log file; `/dev/null` when unset.
    pub logfile: Option<PathBuf>,
    /// Pid of the supervised process, if any.
    pub pid: Option<Pid>,
    /// Status of the most recent child exit.
    pub exit_status: Option<ExitStatus>,
    /// The exec status pipe has not yet reported; child exit handling is
    /// deferred until it does.
    pub waiting_for_execstat: bool,
    /// Extra signal to send on stop, in addition to (or instead of) SIGTERM.
    pub term_signal: Option<Signal>,
    /// When the process was last launched.
    pub last_start_time: Option<Instant>,
    /// Start of the current restart accounting window.
    pub restart_interval_time: Option<Instant>,
    /// Restarts within the current window.
    pub restart_interval_count: u32,
    /// Window length and maximum restarts per window; a restart beyond the
    /// limit within the window is refused.
    pub restart_interval: Duration,
    pub max_restart_interval_count: u32,
    /// Minimum pause between restarts.
    pub restart_delay: Duration,
    /// The restart delay timer is armed.
    pub waiting_restart_timer: bool,
    /// Handle for the armed timer, used to cancel it.
    pub restart_timer: Option<JoinHandle<()>>,
}

impl ProcessFields {
    pub fn new(args: Vec<String>) -> Self {
        ProcessFields {
            args,
            logfile: None,
            pid: None,
            exit_status: None,
            waiting_for_execstat: false,
            term_signal: None,
            last_start_time: None,
            restart_interval_time: None,
            restart_interval_count: 0,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            max_restart_interval_count: DEFAULT_MAX_RESTART_COUNT,
            restart_delay: DEFAULT_RESTART_DELAY,
            waiting_restart_timer: false,
            restart_timer: None,
        }
    }
}

/// Per-type extension data; the capability surface (`start_ps_process`,
/// `handle_exit_status`, `all_deps_stopped`, interruption predicates) is
/// dispatched over this by match.
#[derive(Debug)]
pub enum ServiceKind {
    Internal,
    Process(ProcessFields),
    Bgprocess {
        proc: ProcessFields,
        pid_file: PathBuf,
        /// The daemon process is our direct child and will be reaped by us.
        tracking_child: bool,
        /// A smooth-recovery relaunch is in flight; the next launcher exit
        /// re-reads the pid file rather than being treated as service death.
        doing_recovery: bool,
    },
    Scripted {
        proc: ProcessFields,
        stop_args: Vec<String>,
    },
}

impl ServiceKind {
    pub fn service_type(&self) -> ServiceType {
        match self {
            ServiceKind::Internal => ServiceType::Internal,
            ServiceKind::Process(_) => ServiceType::Process,
            ServiceKind::Bgprocess { .. } => ServiceType::Bgprocess,
            ServiceKind::Scripted { .. } => ServiceType::Scripted,
        }
    }

    pub fn proc(&self) -> Option<&ProcessFields> {
        match self {
            ServiceKind::Internal => None,
            ServiceKind::Process(p) => Some(p),
            ServiceKind::Bgprocess { proc, .. } => Some(proc),
            ServiceKind::Scripted { proc, .. } => Some(proc),
        }
    }

    pub fn proc_mut(&mut self) -> Option<&mut ProcessFields> {
        match self {
            ServiceKind::Internal => None,
            ServiceKind::Process(p) => Some(p),
            ServiceKind::Bgprocess { proc, .. } => Some(proc),
            ServiceKind::Scripted { proc, .. } => Some(proc),
        }
    }
}

/// A soft ("waits-for") dependency edge, directed from dependent to
/// dependency. The dependent waits for the target while starting but does
/// not fail with it.
#[derive(Debug, Clone, Copy)]
pub struct SoftDep {
    pub to: ServiceId,
    /// The dependent's current start attempt is waiting on this edge.
    pub waiting_on: bool,
    /// This edge holds an acquisition (a `required_by` reference) on the
    /// target.
    pub holding_acq: bool,
}

/// One loaded service.
#[derive(Debug)]
pub struct ServiceRecord {
    pub name: String,
    pub state: ServiceState,
    /// Target state set by intent; only ever `Stopped` or `Started`.
    pub desired_state: ServiceState,
    /// Count of acquisitions (dependents holding us, plus the explicit
    /// activation if any).
    pub required_by: u32,
    /// An explicit activation holds one of the `required_by` references.
    pub start_explicit: bool,
    /// Skip graceful interruption semantics; propagated to dependents.
    pub force_stop: bool,
    /// A restart is in progress (stop completed with desired = started).
    pub restarting: bool,
    /// Restart on unexpected exit, if also enabled globally.
    pub auto_restart: bool,
    /// Re-fork in place without leaving the started state.
    pub smooth_recovery: bool,
    pub pinned_started: bool,
    pub pinned_stopped: bool,
    /// Transient: blocked in starting/stopping on dependency edges.
    pub waiting_for_deps: bool,

    // Deferred propagation intents, consumed by the propagation engine.
    pub prop_require: bool,
    pub prop_release: bool,
    pub prop_failure: bool,
    pub prop_start: bool,
    pub prop_stop: bool,

    /// Hard dependencies: we may only be started while all of these are.
    pub depends_on: Vec<ServiceId>,
    /// Reverse adjacency of `depends_on`.
    pub dependents: Vec<ServiceId>,
    /// Soft dependencies, with per-edge wait/acquisition state.
    pub soft_deps: Vec<SoftDep>,
    /// Services holding a soft edge to us.
    pub soft_dpts: Vec<ServiceId>,

    pub flags: OnstartFlags,

    /// Activation socket configuration; opened before the process is
    /// launched, passed as fd 3.
    pub socket_path: Option<PathBuf>,
    pub socket_perms: u32,
    pub socket_uid: Option<u32>,
    pub socket_gid: Option<u32>,
    pub socket_fd: Option<OwnedFd>,

    pub kind: ServiceKind,

    /// Counted in the active-services tally.
    pub(crate) marked_active: bool,
    pub(crate) queued_prop: bool,
    pub(crate) queued_start: bool,
    pub(crate) queued_stop: bool,
}

impl ServiceRecord {
    pub fn new(name: String, kind: ServiceKind) -> Self {
        ServiceRecord {
            name,
            state: ServiceState::Stopped,
            desired_state: ServiceState::Stopped,
            required_by: 0,
            start_explicit: false,
            force_stop: false,
            restarting: false,
            auto_restart: false,
            smooth_recovery: false,
            pinned_started: false,
            pinned_stopped: false,
            waiting_for_deps: false,
            prop_require: false,
            prop_release: false,
            prop_failure: false,
            prop_start: false,
            prop_stop: false,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            soft_deps: Vec::new(),
            soft_dpts: Vec::new(),
            flags: OnstartFlags::default(),
            socket_path: None,
            socket_perms: 0o666,
            socket_uid: None,
            socket_gid: None,
            socket_fd: None,
            kind,
            marked_active: false,
            queued_prop: false,
            queued_start: false,
            queued_stop: false,
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.kind.service_type()
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ServiceState::Stopped
    }

    pub fn pid(&self) -> Option<Pid> {
        self.kind.proc().and_then(|p| p.pid)
    }

    /// Whether an in-flight start can be abandoned right now. True while we
    /// are still waiting on dependencies (or the console), and for process
    /// types also while the restart delay timer is armed.
    pub fn can_interrupt_start(&self) -> bool {
        let timer = self
            .kind
            .proc()
            .map(|p| p.waiting_restart_timer)
            .unwrap_or(false);
        timer || self.waiting_for_deps
    }

    /// Whether an in-flight stop can be flipped back into a start. Possible
    /// only while still waiting for dependents and not force-stopped; a
    /// scripted service's stop is never interrupted.
    pub fn can_interrupt_stop(&self) -> bool {
        match self.kind {
            ServiceKind::Scripted { .. } => false,
            _ => self.waiting_for_deps && !self.force_stop,
        }
    }
}

/// Loader-facing description of a service, resolved into a record by
/// [`super::ServiceSet::add_service`]. Dependency names must already be
/// loaded.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub service_type: ServiceType,
    pub command: Vec<String>,
    pub stop_command: Vec<String>,
    pub logfile: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub auto_restart: bool,
    pub smooth_recovery: bool,
    pub flags: OnstartFlags,
    pub socket_path: Option<PathBuf>,
    pub socket_perms: u32,
    pub socket_uid: Option<u32>,
    pub socket_gid: Option<u32>,
    pub term_signal: Option<Signal>,
    pub restart_delay: Duration,
    pub restart_interval: Duration,
    pub max_restart_count: u32,
    pub depends_on: Vec<String>,
    pub waits_for: Vec<String>,
}

impl ServiceConfig {
    pub fn new(name: &str, service_type: ServiceType) -> Self {
        ServiceConfig {
            name: name.to_string(),
            service_type,
            command: Vec::new(),
            stop_command: Vec::new(),
            logfile: None,
            pid_file: None,
            auto_restart: false,
            smooth_recovery: false,
            flags: OnstartFlags::default(),
            socket_path: None,
            socket_perms: 0o666,
            socket_uid: None,
            socket_gid: None,
            term_signal: None,
            restart_delay: DEFAULT_RESTART_DELAY,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            max_restart_count: DEFAULT_MAX_RESTART_COUNT,
            depends_on: Vec::new(),
            waits_for: Vec::new(),
        }
    }

    pub(crate) fn into_record(self) -> ServiceRecord {
        let mut proc_fields = ProcessFields::new(self.command);
        proc_fields.logfile = self.logfile;
        proc_fields.term_signal = self.term_signal;
        proc_fields.restart_delay = self.restart_delay;
        proc_fields.restart_interval = self.restart_interval;
        proc_fields.max_restart_interval_count = self.max_restart_count;

        let kind = match self.service_type {
            ServiceType::Internal => ServiceKind::Internal,
            ServiceType::Process => ServiceKind::Process(proc_fields),
            ServiceType::Bgprocess => ServiceKind::Bgprocess {
                proc: proc_fields,
                pid_file: self.pid_file.unwrap_or_default(),
                tracking_child: false,
                doing_recovery: false,
            },
            ServiceType::Scripted => ServiceKind::Scripted {
                proc: proc_fields,
                stop_args: self.stop_command,
            },
        };

        let mut record = ServiceRecord::new(self.name, kind);
        record.auto_restart = self.auto_restart;
        record.smooth_recovery = self.smooth_recovery;
        record.flags = self.flags;
        record.socket_path = self.socket_path;
        record.socket_perms = self.socket_perms;
        record.socket_uid = self.socket_uid;
        record.socket_gid = self.socket_gid;
        record
    }
}
