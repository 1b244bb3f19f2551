//! Process supervision for process-backed services.
//!
//! Covers launch via the exec status pipe, child exit handling per service
//! type, pid file tracking for background processes, scripted stop commands,
//! smooth recovery and restart throttling. Asynchronous completions (pipe
//! readable, child reaped, timer fired) re-enter through
//! [`ServiceSet::dispatch_event`].

mod spawn;

pub use spawn::{SpawnError, SpawnParams};

use std::os::fd::AsRawFd;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::event::Event;
use crate::services::state::{ExitStatus, ServiceState};
use crate::services::{ServiceId, ServiceKind, ServiceSet};

/// Outcome of reading a background service's pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidResult {
    /// Pid read and the process is alive (tracked via reaping, or merely
    /// observed alive when it is not our child).
    Ok,
    /// The process already exited; its status was collected.
    Terminated(ExitStatus),
    /// The pid file was unreadable or named no live process.
    Failed,
}

impl ServiceSet {
    /// Feed one asynchronous event into the engine and pump the queues.
    pub fn dispatch_event(&mut self, event: Event) {
        match event {
            Event::ChildStatus => self.reap(),
            Event::ExecStatus { service, failure } => self.exec_status_event(service, failure),
            Event::RestartTimer { service } => self.restart_timer_expired(service),
            // Served by the daemon loop, not the engine.
            Event::ControlConn { .. } => {}
        }
        self.process_queues();
    }

    /// Collect exit statuses for supervised children without blocking.
    /// When `reap_unknown_children` is set (PID 1 duty), orphans reparented
    /// to us are swept up as well.
    pub fn reap(&mut self) {
        let watched: Vec<(ServiceId, Pid)> = self
            .services()
            .filter_map(|(id, rec)| {
                let tracked = match &rec.kind {
                    ServiceKind::Bgprocess { tracking_child, .. } => *tracking_child,
                    ServiceKind::Internal => false,
                    _ => true,
                };
                rec.pid().filter(|_| tracked).map(|pid| (id, pid))
            })
            .collect();

        for (id, pid) in watched {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some(exit) = ExitStatus::from_wait_status(status) {
                        self.child_exited(id, exit);
                    }
                }
                Err(Errno::ECHILD) => {
                    log::warn!("service pid {} is not reapable", pid);
                }
                Err(e) => {
                    log::error!("waitpid error for pid {}: {}", pid, e);
                }
            }
        }

        // Children that reported an exec failure still need their zombie
        // collected.
        let mut remaining = Vec::new();
        for pid in std::mem::take(&mut self.discard_pids) {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => remaining.push(pid),
                _ => {}
            }
        }
        self.discard_pids = remaining;

        if self.reap_unknown_children {
            self.reap_orphans();
        }
    }

    /// Reap any zombie, including processes reparented to us as PID 1.
    fn reap_orphans(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => {
                    if let (Some(pid), Some(exit)) =
                        (status.pid(), ExitStatus::from_wait_status(status))
                    {
                        // A known child that exited between our targeted wait
                        // and this sweep still gets routed to its service.
                        let owner = self
                            .services()
                            .find(|(_, rec)| rec.pid() == Some(pid))
                            .map(|(id, _)| id);
                        match owner {
                            Some(id) => self.child_exited(id, exit),
                            None => log::debug!("reaped orphan pid {} ({:?})", pid, exit),
                        }
                    }
                }
                Err(e) => {
                    log::error!("waitpid error: {}", e);
                    break;
                }
            }
        }
    }

    /// A supervised child terminated. If the exec status pipe has not been
    /// observed yet, handling is deferred to the pipe watch so the two
    /// never race.
    pub(crate) fn child_exited(&mut self, id: ServiceId, status: ExitStatus) {
        let Some(rec) = self.rec_mut(id) else { return };
        let Some(proc_fields) = rec.kind.proc_mut() else { return };
        proc_fields.pid = None;
        proc_fields.exit_status = Some(status);
        if proc_fields.waiting_for_execstat {
            return;
        }
        self.handle_exit_status(id, status);
    }

    /// The exec status pipe resolved: `failure` is the errno written by the
    /// child on exec failure, or `None` on EOF (exec succeeded).
    pub(crate) fn exec_status_event(&mut self, id: ServiceId, failure: Option<i32>) {
        let Some(rec) = self.rec_mut(id) else { return };
        let name = rec.name.clone();
        let Some(proc_fields) = rec.kind.proc_mut() else { return };
        proc_fields.waiting_for_execstat = false;

        if let Some(errno) = failure {
            // The child reported exec failure and has exited; its zombie is
            // collected on the next sweep.
            if let Some(pid) = proc_fields.pid.take() {
                self.discard_pids.push(pid);
            }
            log::error!(
                "service {}: execution failed: {}",
                name,
                std::io::Error::from_raw_os_error(errno)
            );
            match self.rec(id).map(|r| r.state) {
                Some(ServiceState::Starting) => self.failed_to_start(id, false),
                // A scripted stop command that failed to exec; assume the
                // service is down rather than leaving it in limbo.
                Some(ServiceState::Stopping) => self.stopped(id),
                _ => {}
            }
            self.loop_handle().notify_child_status();
        } else {
            // Exec succeeded. A plain process service is started as soon as
            // the exec is through; other types wait for the process to
            // finish (scripted, bgprocess launcher).
            let (is_process, state) = {
                let Some(rec) = self.rec(id) else { return };
                (
                    matches!(rec.kind, ServiceKind::Process(_)),
                    rec.state,
                )
            };
            if is_process && state == ServiceState::Starting {
                self.started(id);
            }

            // The child may have terminated before the exec status arrived;
            // its exit was deferred to us.
            let deferred = {
                let Some(rec) = self.rec(id) else { return };
                match rec.kind.proc() {
                    Some(p) if p.pid.is_none() => p.exit_status,
                    _ => None,
                }
            };
            if let Some(status) = deferred {
                self.handle_exit_status(id, status);
            }
        }
    }

    /// Launch the service's process (or complete an internal start).
    /// Returns false if the launch could not be attempted or the restart
    /// throttle refused it.
    pub(crate) fn start_ps_process(&mut self, id: ServiceId) -> bool {
        let Some(rec) = self.rec(id) else { return false };
        match rec.kind {
            ServiceKind::Internal => {
                self.started(id);
                true
            }
            _ => {
                if rec.restarting {
                    self.restart_ps_process(id)
                } else {
                    let now = self.loop_handle().now();
                    let on_console = rec.flags.starts_on_console;
                    if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                        p.restart_interval_time = Some(now);
                        p.restart_interval_count = 0;
                    }
                    self.exec_service_process(id, false, on_console)
                }
            }
        }
    }

    /// Fork/exec the start command (or the stop command, for scripted
    /// services going down).
    fn exec_service_process(&mut self, id: ServiceId, stop_command: bool, on_console: bool) -> bool {
        let Some(rec) = self.rec(id) else { return false };
        let name = rec.name.clone();
        let args = if stop_command {
            match &rec.kind {
                ServiceKind::Scripted { stop_args, .. } => stop_args.clone(),
                _ => return false,
            }
        } else {
            match rec.kind.proc() {
                Some(p) => p.args.clone(),
                None => return false,
            }
        };
        let params = SpawnParams {
            args,
            logfile: rec.kind.proc().and_then(|p| p.logfile.clone()),
            on_console,
            socket_fd: rec.socket_fd.as_ref().map(|fd| fd.as_raw_fd()),
            pass_cs_fd: rec.flags.pass_cs_fd,
        };

        let now = self.loop_handle().now();
        let loop_handle = self.loop_handle().clone();
        match spawn::spawn_process(id, &params, &loop_handle) {
            Ok(pid) => {
                let Some(rec) = self.rec_mut(id) else { return false };
                if let ServiceKind::Bgprocess { tracking_child, .. } = &mut rec.kind {
                    *tracking_child = true;
                }
                if let Some(p) = rec.kind.proc_mut() {
                    p.pid = Some(pid);
                    p.exit_status = None;
                    p.waiting_for_execstat = true;
                    p.last_start_time = Some(now);
                }
                true
            }
            Err(e) => {
                log::error!("service {}: {}", name, e);
                false
            }
        }
    }

    /// Restart path: check the throttle window, then either relaunch
    /// immediately or arm the minimum-delay timer. Returns false when the
    /// restart limit is exhausted.
    pub(crate) fn restart_ps_process(&mut self, id: ServiceId) -> bool {
        let now = self.loop_handle().now();
        let name = match self.rec(id) {
            Some(rec) => rec.name.clone(),
            None => return false,
        };

        if !self.check_restart_interval(id, now) {
            log::error!("service {} restarting too quickly; stopping", name);
            return false;
        }

        let (elapsed, delay) = {
            let Some(p) = self.rec(id).and_then(|r| r.kind.proc()) else {
                return false;
            };
            (
                p.last_start_time.map(|t| now.duration_since(t)),
                p.restart_delay,
            )
        };

        match elapsed {
            Some(e) if e < delay => {
                // Enforce the minimum pause between restarts.
                let timer = self.loop_handle().arm_restart_timer(id, delay - e);
                if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                    p.waiting_restart_timer = true;
                    p.restart_timer = Some(timer);
                }
            }
            _ => self.do_restart(id),
        }
        true
    }

    /// Restart throttle accounting: true if another restart is permitted
    /// now. Resets the window when the previous one has lapsed.
    fn check_restart_interval(&mut self, id: ServiceId, now: Instant) -> bool {
        let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) else {
            return false;
        };
        if p.max_restart_interval_count == 0 {
            return true;
        }
        match p.restart_interval_time {
            Some(window_start) if now.duration_since(window_start) < p.restart_interval => {
                p.restart_interval_count < p.max_restart_interval_count
            }
            _ => {
                p.restart_interval_time = Some(now);
                p.restart_interval_count = 0;
                true
            }
        }
    }

    /// Perform the (possibly deferred) restart launch.
    pub(crate) fn do_restart(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        rec.restarting = false;
        let state = rec.state;
        let on_console = if state == ServiceState::Starting {
            rec.flags.starts_on_console
        } else {
            rec.flags.runs_on_console
        };
        if let Some(p) = rec.kind.proc_mut() {
            p.waiting_restart_timer = false;
            p.restart_timer = None;
            p.restart_interval_count += 1;
        }

        if !self.exec_service_process(id, false, on_console) {
            if state == ServiceState::Starting {
                self.failed_to_start(id, false);
            } else {
                // Smooth recovery relaunch failed while nominally started.
                if let Some(rec) = self.rec_mut(id) {
                    rec.desired_state = ServiceState::Stopped;
                }
                self.force_stop(id);
            }
        }
    }

    /// The restart delay timer fired.
    pub(crate) fn restart_timer_expired(&mut self, id: ServiceId) {
        let armed = {
            let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) else {
                return;
            };
            let armed = p.waiting_restart_timer;
            p.restart_timer = None;
            armed
        };
        if armed {
            self.do_restart(id);
        }
    }

    /// Abandon an in-flight start: cancel the restart timer if armed and
    /// withdraw any console claim.
    pub(crate) fn interrupt_start(&mut self, id: ServiceId) {
        if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
            if let Some(timer) = p.restart_timer.take() {
                timer.abort();
            }
            p.waiting_restart_timer = false;
        }
        self.unqueue_console(id);
    }

    /// Type-specific reaction to a child exit.
    pub(crate) fn handle_exit_status(&mut self, id: ServiceId, status: ExitStatus) {
        let Some(rec) = self.rec(id) else { return };
        match rec.kind {
            ServiceKind::Internal => {}
            ServiceKind::Process(_) => self.handle_exit_process(id, status),
            ServiceKind::Bgprocess { .. } => self.handle_exit_bgprocess(id, status),
            ServiceKind::Scripted { .. } => self.handle_exit_scripted(id, status),
        }
    }

    fn log_abnormal_exit(&self, id: ServiceId, status: ExitStatus) {
        let Some(rec) = self.rec(id) else { return };
        if !status.success() && rec.state != ServiceState::Stopping {
            log::error!("service {} process terminated with {}", rec.name, status);
        }
    }

    fn handle_exit_process(&mut self, id: ServiceId, status: ExitStatus) {
        self.log_abnormal_exit(id, status);
        let Some(rec) = self.rec(id) else { return };
        match rec.state {
            ServiceState::Starting => {
                if status.success() {
                    self.started(id);
                } else {
                    self.failed_to_start(id, false);
                }
            }
            ServiceState::Stopping => {
                // The process died because we asked it to.
                self.stopped(id);
            }
            _ => {
                if rec.smooth_recovery
                    && rec.state == ServiceState::Started
                    && rec.desired_state == ServiceState::Started
                {
                    if !self.restart_ps_process(id) {
                        self.emergency_stop(id);
                    }
                } else {
                    self.emergency_stop(id);
                }
            }
        }
    }

    fn handle_exit_bgprocess(&mut self, id: ServiceId, status: ExitStatus) {
        let mut status = status;
        loop {
            self.log_abnormal_exit(id, status);

            let recovering = match self.rec_mut(id).map(|r| &mut r.kind) {
                Some(ServiceKind::Bgprocess { doing_recovery, .. }) => {
                    std::mem::take(doing_recovery)
                }
                _ => return,
            };

            if recovering {
                let mut need_stop = !status.success();
                if !need_stop {
                    // The launcher has been relaunched; pick up the new pid.
                    match self.read_pid_file(id) {
                        PidResult::Failed => need_stop = true,
                        PidResult::Terminated(st) => {
                            status = st;
                            continue;
                        }
                        PidResult::Ok => {}
                    }
                }
                if need_stop {
                    self.emergency_stop(id);
                }
                return;
            }

            let Some(rec) = self.rec(id) else { return };
            match rec.state {
                ServiceState::Starting => {
                    if status.success() {
                        match self.read_pid_file(id) {
                            PidResult::Failed => self.failed_to_start(id, false),
                            PidResult::Terminated(st) => {
                                // Started, but the daemon died immediately.
                                self.started(id);
                                status = st;
                                continue;
                            }
                            PidResult::Ok => self.started(id),
                        }
                    } else {
                        self.failed_to_start(id, false);
                    }
                }
                ServiceState::Stopping => self.stopped(id),
                _ => {
                    if rec.smooth_recovery
                        && rec.state == ServiceState::Started
                        && rec.desired_state == ServiceState::Started
                    {
                        if let Some(ServiceKind::Bgprocess { doing_recovery, .. }) =
                            self.rec_mut(id).map(|r| &mut r.kind)
                        {
                            *doing_recovery = true;
                        }
                        if !self.restart_ps_process(id) {
                            self.emergency_stop(id);
                        }
                    } else {
                        let clear_explicit = {
                            let Some(rec) = self.rec(id) else { return };
                            !self.do_auto_restart(id) && rec.start_explicit
                        };
                        if clear_explicit {
                            if let Some(rec) = self.rec_mut(id) {
                                rec.start_explicit = false;
                            }
                            self.release(id);
                        }
                        self.force_stop(id);
                        self.stop_dependents(id);
                        self.stopped(id);
                    }
                }
            }
            return;
        }
    }

    fn handle_exit_scripted(&mut self, id: ServiceId, status: ExitStatus) {
        let Some(rec) = self.rec(id) else { return };
        let name = rec.name.clone();
        if rec.state == ServiceState::Stopping {
            if !status.success() {
                // The stop command failed; assume the service stopped anyway
                // so that dependencies can progress.
                log::info!("service {} stop command failed with {}", name, status);
            }
            self.stopped(id);
        } else {
            if status.success() {
                self.started(id);
            } else {
                log::error!("service {} command failed with {}", name, status);
                self.failed_to_start(id, false);
            }
        }
    }

    /// Read and validate the pid file of a background service, recording
    /// the pid on success.
    pub(crate) fn read_pid_file(&mut self, id: ServiceId) -> PidResult {
        let (name, pid_file) = match self.rec(id) {
            Some(rec) => match &rec.kind {
                ServiceKind::Bgprocess { pid_file, .. } => {
                    (rec.name.clone(), pid_file.clone())
                }
                _ => return PidResult::Failed,
            },
            None => return PidResult::Failed,
        };

        let contents = match std::fs::read_to_string(&pid_file) {
            Ok(c) => c,
            Err(e) => {
                log::error!("service {}: could not read pid file: {}", name, e);
                return PidResult::Failed;
            }
        };
        let pid_raw: i32 = match contents.trim().parse() {
            Ok(p) if p > 0 => p,
            _ => {
                log::error!(
                    "service {}: pid file {} does not contain a valid pid",
                    name,
                    pid_file.display()
                );
                return PidResult::Failed;
            }
        };
        let pid = Pid::from_raw(pid_raw);
        if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
            p.pid = Some(pid);
        }

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Err(Errno::ECHILD) => {
                // Not our child; we can only observe that it is alive.
                if kill(pid, None).is_ok() {
                    if let Some(ServiceKind::Bgprocess { tracking_child, .. }) =
                        self.rec_mut(id).map(|r| &mut r.kind)
                    {
                        *tracking_child = false;
                    }
                    PidResult::Ok
                } else {
                    log::error!("service {}: pid {} from pid file is not valid", name, pid_raw);
                    if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                        p.pid = None;
                    }
                    PidResult::Failed
                }
            }
            Ok(WaitStatus::StillAlive) => {
                if let Some(ServiceKind::Bgprocess { tracking_child, .. }) =
                    self.rec_mut(id).map(|r| &mut r.kind)
                {
                    *tracking_child = true;
                }
                PidResult::Ok
            }
            Ok(status) => match ExitStatus::from_wait_status(status) {
                Some(exit) => {
                    if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                        p.pid = None;
                    }
                    PidResult::Terminated(exit)
                }
                None => PidResult::Ok,
            },
            Err(e) => {
                log::error!("service {}: waitpid on pid file pid failed: {}", name, e);
                if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                    p.pid = None;
                }
                PidResult::Failed
            }
        }
    }

    /// Dependents are down; terminate the service process (process and
    /// bgprocess types).
    pub(crate) fn bring_down_process(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        rec.waiting_for_deps = false;
        let no_sigterm = rec.flags.no_sigterm;
        let (pid, term_signal) = match rec.kind.proc() {
            Some(p) => (p.pid, p.term_signal),
            None => (None, None),
        };
        let is_bgprocess = matches!(rec.kind, ServiceKind::Bgprocess { .. });

        let Some(pid) = pid else {
            // The process is already dead.
            self.stopped(id);
            return;
        };

        // An uncollected exit must be observed before we signal, so that a
        // recycled pid is never targeted.
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => {}
            Ok(status) => {
                if let Some(exit) = ExitStatus::from_wait_status(status) {
                    self.child_exited(id, exit);
                    return;
                }
            }
        }

        // Signal the process group rather than just the process; there is
        // less risk then of leaving an orphaned process group behind.
        let pgroup = Pid::from_raw(-pid.as_raw());
        if !no_sigterm {
            let _ = kill(pgroup, Signal::SIGTERM);
        }
        if let Some(sig) = term_signal {
            let _ = kill(pgroup, sig);
        }

        // The reap path normally finishes the stop. A background process
        // that is not our child will never be reaped, so probe it now.
        if is_bgprocess {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Err(Errno::ECHILD) => {
                    // Untrackable (or already gone); we cannot wait for it.
                    if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                        p.pid = None;
                    }
                    self.stopped(id);
                }
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) => {
                    // Died at our request; no need to log the status.
                    if let Some(p) = self.rec_mut(id).and_then(|r| r.kind.proc_mut()) {
                        p.pid = None;
                    }
                    self.stopped(id);
                }
                Err(e) => {
                    log::error!("waitpid error for pid {}: {}", pid, e);
                }
            }
        }
    }

    /// Dependents are down; run the stop command of a scripted service, or
    /// finish immediately when none is configured.
    pub(crate) fn bring_down_scripted(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        rec.waiting_for_deps = false;
        let has_stop_command = match &rec.kind {
            ServiceKind::Scripted { stop_args, .. } => !stop_args.is_empty(),
            _ => false,
        };
        if !has_stop_command {
            self.stopped(id);
        } else if !self.exec_service_process(id, true, false) {
            // Couldn't execute the stop script, but there's not much to be
            // done about it.
            self.stopped(id);
        }
    }

    /// Open the activation socket, if configured and not already open.
    pub(crate) fn open_socket(&mut self, id: ServiceId) -> bool {
        use nix::sys::socket::{bind, listen, socket, Backlog, SockFlag, SockType, UnixAddr};

        let (name, path, perms, uid, gid) = {
            let Some(rec) = self.rec(id) else { return false };
            if rec.socket_fd.is_some() {
                return true;
            }
            let Some(path) = rec.socket_path.clone() else {
                return true;
            };
            (
                rec.name.clone(),
                path,
                rec.socket_perms,
                rec.socket_uid,
                rec.socket_gid,
            )
        };

        // Unlink any stale socket left behind by a previous run.
        let _ = std::fs::remove_file(&path);

        let addr = match UnixAddr::new(&path) {
            Ok(a) => a,
            Err(e) => {
                log::error!("service {}: bad activation socket path: {}", name, e);
                return false;
            }
        };
        let sock = match socket(
            nix::sys::socket::AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                log::error!("service {}: error creating activation socket: {}", name, e);
                return false;
            }
        };
        if let Err(e) = bind(sock.as_raw_fd(), &addr) {
            log::error!("service {}: error binding activation socket: {}", name, e);
            return false;
        }

        // fchown/fchmod do not reliably work on sockets; use the path.
        if uid.is_some() || gid.is_some() {
            if let Err(e) = nix::unistd::chown(
                &path,
                uid.map(nix::unistd::Uid::from_raw),
                gid.map(nix::unistd::Gid::from_raw),
            ) {
                log::error!(
                    "service {}: error setting activation socket owner: {}",
                    name,
                    e
                );
                return false;
            }
        }
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(perms))
            {
                log::error!(
                    "service {}: error setting activation socket permissions: {}",
                    name,
                    e
                );
                return false;
            }
        }

        let backlog = Backlog::new(128).unwrap_or(Backlog::MAXCONN);
        if let Err(e) = listen(&sock, backlog) {
            log::error!("service {}: error listening on activation socket: {}", name, e);
            return false;
        }

        if let Some(rec) = self.rec_mut(id) {
            rec.socket_fd = Some(sock);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LoopHandle;
    use crate::services::{ServiceConfig, ServiceType};
    use std::time::Duration;

    fn process_set() -> (ServiceSet, ServiceId) {
        let (handle, _rx) = LoopHandle::new();
        let mut set = ServiceSet::new(handle);
        let mut config = ServiceConfig::new("p", ServiceType::Process);
        config.command = vec!["/bin/true".to_string()];
        let id = set.add_service(config).unwrap();
        (set, id)
    }

    #[test]
    fn restart_refused_at_limit_within_window() {
        let (mut set, id) = process_set();
        let now = Instant::now();
        {
            let p = set.rec_mut(id).unwrap().kind.proc_mut().unwrap();
            p.restart_interval_time = Some(now);
            p.restart_interval_count = p.max_restart_interval_count;
        }
        assert!(!set.check_restart_interval(id, now));
    }

    #[test]
    fn restart_allowed_below_limit() {
        let (mut set, id) = process_set();
        let now = Instant::now();
        {
            let p = set.rec_mut(id).unwrap().kind.proc_mut().unwrap();
            p.restart_interval_time = Some(now);
            p.restart_interval_count = p.max_restart_interval_count - 1;
        }
        assert!(set.check_restart_interval(id, now));
        // Within the window, the counter is not reset.
        let p = set.rec_mut(id).unwrap().kind.proc_mut().unwrap();
        assert_eq!(p.restart_interval_count, p.max_restart_interval_count - 1);
    }

    #[test]
    fn window_lapse_resets_counter() {
        let (mut set, id) = process_set();
        let now = Instant::now();
        {
            let p = set.rec_mut(id).unwrap().kind.proc_mut().unwrap();
            // A zero-length window has always lapsed.
            p.restart_interval = Duration::ZERO;
            p.restart_interval_time = Some(now);
            p.restart_interval_count = p.max_restart_interval_count;
        }
        assert!(set.check_restart_interval(id, now));
        let p = set.rec_mut(id).unwrap().kind.proc_mut().unwrap();
        assert_eq!(p.restart_interval_count, 0);
    }

    #[test]
    fn unlimited_restarts_when_count_is_zero() {
        let (mut set, id) = process_set();
        let now = Instant::now();
        {
            let p = set.rec_mut(id).unwrap().kind.proc_mut().unwrap();
            p.max_restart_interval_count = 0;
            p.restart_interval_time = Some(now);
            p.restart_interval_count = 100;
        }
        assert!(set.check_restart_interval(id, now));
    }
}
