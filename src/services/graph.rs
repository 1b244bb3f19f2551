//! The service state machine and propagation engine.
//!
//! Intent entry points (`start`, `stop`, `require`, `release`, `unpin`)
//! mutate a record and enqueue deferred work; nothing here blocks. The
//! queues are drained by [`ServiceSet::process_queues`]; the only code that
//! crosses service boundaries is the propagation performed while draining.
//! Re-entrancy within a drain is safe: every transition either removes the
//! record from its queue or records a further intent for the next pass.

use super::state::{ServiceEvent, ServiceState};
use super::{ServiceId, ServiceKind, ServiceSet};

impl ServiceSet {
    /// Request the service be started. With `activate`, an explicit
    /// activation reference is taken which keeps the service up until
    /// released.
    pub fn start(&mut self, id: ServiceId, activate: bool) {
        let Some(rec) = self.rec(id) else { return };
        if activate && !rec.start_explicit {
            self.require(id);
            if let Some(rec) = self.rec_mut(id) {
                rec.start_explicit = true;
            }
        }

        let Some(rec) = self.rec_mut(id) else { return };
        if rec.desired_state == ServiceState::Started && rec.state != ServiceState::Stopped {
            return;
        }
        let was_active =
            rec.state != ServiceState::Stopped || rec.desired_state != ServiceState::Stopped;
        rec.desired_state = ServiceState::Started;

        if rec.pinned_stopped {
            // The pin holds us down; the recorded desired state lets unpin
            // resume the start later.
            return;
        }

        if rec.state != ServiceState::Stopped {
            // Already starting or started; or stopping, in which case we
            // must wait for the stop to complete unless it can be flipped.
            if rec.state != ServiceState::Stopping || !rec.can_interrupt_stop() {
                return;
            }
            // Dependents that are stopping are only waiting for us, so they
            // too can be returned to their started state.
            self.notify_listeners(id, ServiceEvent::StopCancelled);
        } else if !was_active {
            self.service_active(id);
        }

        if let Some(rec) = self.rec_mut(id) {
            rec.state = ServiceState::Starting;
            rec.waiting_for_deps = true;
        }
        if self.start_check_dependencies(id, true) {
            self.add_to_start_queue(id);
        }
    }

    /// Clear any explicit activation; with `bring_down`, also stop the
    /// service.
    pub fn stop(&mut self, id: ServiceId, bring_down: bool) {
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.start_explicit {
            rec.start_explicit = false;
            self.release(id);
        }
        if bring_down {
            self.do_stop(id);
        }
    }

    /// Take an acquisition on the service.
    pub fn require(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        rec.required_by += 1;
        if rec.required_by == 1 {
            // A pending release cancels out instead of propagating both.
            rec.prop_require = !rec.prop_release;
            rec.prop_release = false;
            self.add_to_prop_queue(id);
        }
    }

    /// Drop an acquisition. On the last one the service becomes unwanted:
    /// dependencies are released and the service is stopped.
    pub fn release(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.required_by == 0 {
            log::warn!("service {}: release with no outstanding requirement", rec.name);
            return;
        }
        rec.required_by -= 1;
        if rec.required_by == 0 {
            rec.desired_state = ServiceState::Stopped;
            rec.prop_release = !rec.prop_require;
            rec.prop_require = false;
            let already_stopped = rec.state == ServiceState::Stopped;
            self.add_to_prop_queue(id);
            if already_stopped {
                self.service_inactive(id);
            } else {
                self.do_stop(id);
            }
        }
    }

    /// Release all dependency acquisitions held by this service.
    fn release_dependencies(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        let hard = rec.depends_on.clone();
        for dep in hard {
            self.release(dep);
        }
        let count = self.rec(id).map(|r| r.soft_deps.len()).unwrap_or(0);
        for i in 0..count {
            let target = {
                let Some(rec) = self.rec_mut(id) else { return };
                let edge = &mut rec.soft_deps[i];
                if edge.holding_acq {
                    edge.holding_acq = false;
                    Some(edge.to)
                } else {
                    None
                }
            };
            if let Some(to) = target {
                self.release(to);
            }
        }
    }

    /// Consume the deferred propagation intents of one record, in fixed
    /// order: require, release, failure, start, stop.
    pub(crate) fn do_propagation(&mut self, id: ServiceId) {
        let take_require = self
            .rec_mut(id)
            .map(|r| std::mem::take(&mut r.prop_require))
            .unwrap_or(false);
        if take_require {
            let Some(rec) = self.rec_mut(id) else { return };
            let hard = rec.depends_on.clone();
            let soft: Vec<ServiceId> = rec
                .soft_deps
                .iter_mut()
                .map(|edge| {
                    edge.holding_acq = true;
                    edge.to
                })
                .collect();
            for dep in hard {
                self.require(dep);
            }
            for dep in soft {
                self.require(dep);
            }
        }

        let take_release = self
            .rec_mut(id)
            .map(|r| std::mem::take(&mut r.prop_release))
            .unwrap_or(false);
        if take_release {
            self.release_dependencies(id);
        }

        let take_failure = self
            .rec_mut(id)
            .map(|r| std::mem::take(&mut r.prop_failure))
            .unwrap_or(false);
        if take_failure {
            self.failed_to_start(id, true);
        }

        let take_start = self
            .rec_mut(id)
            .map(|r| std::mem::take(&mut r.prop_start))
            .unwrap_or(false);
        if take_start {
            self.start(id, false);
        }

        let take_stop = self
            .rec_mut(id)
            .map(|r| std::mem::take(&mut r.prop_stop))
            .unwrap_or(false);
        if take_stop {
            self.do_stop(id);
        }
    }

    /// Re-evaluate a transient state once queued work has settled.
    pub(crate) fn execute_transition(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        match rec.state {
            ServiceState::Starting => {
                if self.start_check_dependencies(id, false) {
                    self.all_deps_started(id, false);
                }
            }
            ServiceState::Stopping => {
                if self.stop_check_dependents(id) {
                    self.all_deps_stopped(id);
                }
            }
            _ => {}
        }
    }

    /// Resume a pinned-stopped service after unpin, or re-evaluate a start
    /// in progress.
    pub fn do_start(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        if rec.pinned_stopped {
            return;
        }
        match rec.state {
            ServiceState::Stopped => {
                self.service_active(id);
                if let Some(rec) = self.rec_mut(id) {
                    rec.state = ServiceState::Starting;
                    rec.waiting_for_deps = true;
                }
                if self.start_check_dependencies(id, true) {
                    self.add_to_start_queue(id);
                }
            }
            ServiceState::Starting => {
                if let Some(rec) = self.rec_mut(id) {
                    rec.waiting_for_deps = true;
                }
                if self.start_check_dependencies(id, false) {
                    self.all_deps_started(id, false);
                }
            }
            _ => {}
        }
    }

    /// Bring the service down, unless pinned started. Entered both from
    /// direct intent and from stop propagation.
    pub fn do_stop(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        if rec.pinned_started {
            return;
        }

        if rec.start_explicit && !self.do_auto_restart(id) {
            if let Some(rec) = self.rec_mut(id) {
                rec.start_explicit = false;
            }
            self.release(id);
            // The release may have re-entered do_stop already.
            if self.rec(id).map(|r| r.required_by).unwrap_or(0) == 0 {
                return;
            }
        }

        let Some(rec) = self.rec(id) else { return };
        if rec.state != ServiceState::Started {
            if rec.state == ServiceState::Starting {
                if !rec.can_interrupt_start() {
                    // The start must run to completion; make sure dependents
                    // stay down meanwhile. The started() path will observe
                    // the desired state and stop again.
                    self.stop_dependents(id);
                    return;
                }
                self.notify_listeners(id, ServiceEvent::StartCancelled);
                self.interrupt_start(id);
                // Now stopping instead.
            } else {
                // Already stopping or stopped.
                return;
            }
        }

        if let Some(rec) = self.rec_mut(id) {
            rec.state = ServiceState::Stopping;
            rec.waiting_for_deps = true;
        }
        if self.stop_dependents(id) {
            self.add_to_stop_queue(id);
        }
    }

    /// Check start preconditions. With `start_deps`, dependencies not yet
    /// started are scheduled to start; without, the state is only observed.
    /// Returns true iff every hard and soft predecessor is satisfied.
    pub(crate) fn start_check_dependencies(&mut self, id: ServiceId, start_deps: bool) -> bool {
        let Some(rec) = self.rec(id) else { return false };
        let hard = rec.depends_on.clone();
        let mut all_started = true;

        for dep in hard {
            if self.rec(dep).map(|r| r.state) != Some(ServiceState::Started) {
                if start_deps {
                    all_started = false;
                    if let Some(d) = self.rec_mut(dep) {
                        d.prop_start = true;
                    }
                    self.add_to_prop_queue(dep);
                } else {
                    return false;
                }
            }
        }

        let soft_count = self.rec(id).map(|r| r.soft_deps.len()).unwrap_or(0);
        for i in 0..soft_count {
            let (to, waiting_on) = {
                let Some(rec) = self.rec(id) else { return false };
                (rec.soft_deps[i].to, rec.soft_deps[i].waiting_on)
            };
            let to_state = self.rec(to).map(|r| r.state);
            if start_deps {
                if to_state != Some(ServiceState::Started) {
                    if let Some(d) = self.rec_mut(to) {
                        d.prop_start = true;
                    }
                    self.add_to_prop_queue(to);
                    if let Some(rec) = self.rec_mut(id) {
                        rec.soft_deps[i].waiting_on = true;
                    }
                    all_started = false;
                } else if let Some(rec) = self.rec_mut(id) {
                    rec.soft_deps[i].waiting_on = false;
                }
            } else if waiting_on {
                if to_state != Some(ServiceState::Starting) {
                    // The target either started or failed; a soft edge does
                    // not block on failure.
                    if let Some(rec) = self.rec_mut(id) {
                        rec.soft_deps[i].waiting_on = false;
                    }
                } else {
                    return false;
                }
            }
        }

        all_started
    }

    /// A dependency of this service reached started.
    pub(crate) fn dependency_started(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        if rec.state == ServiceState::Starting && rec.waiting_for_deps {
            self.add_to_start_queue(id);
        }
    }

    /// A dependent of this service reached stopped.
    pub(crate) fn dependent_stopped(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        if rec.state == ServiceState::Stopping && rec.waiting_for_deps {
            self.add_to_stop_queue(id);
        }
    }

    /// All predecessors are started; move the start forward.
    pub(crate) fn all_deps_started(&mut self, id: ServiceId, has_console: bool) {
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.flags.starts_on_console && !has_console {
            rec.waiting_for_deps = true;
            self.queue_for_console(id);
            return;
        }

        rec.waiting_for_deps = false;

        // can_interrupt_start doubles as "some other process must finish
        // before we can launch" (notably the restart delay timer).
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.can_interrupt_start() {
            rec.waiting_for_deps = true;
            return;
        }

        if !self.open_socket(id) {
            self.failed_to_start(id, false);
            return;
        }

        if !self.start_ps_process(id) {
            self.failed_to_start(id, false);
        }
    }

    /// Mark every dependent to stop (and to force-stop if we are
    /// force-stopped). Returns true iff all dependents are already stopped.
    pub(crate) fn stop_dependents(&mut self, id: ServiceId) -> bool {
        let Some(rec) = self.rec(id) else { return true };
        let force = rec.force_stop;
        let dependents = rec.dependents.clone();
        let mut all_stopped = true;
        for dep in dependents {
            if self.rec(dep).map(|r| r.is_stopped()) != Some(true) {
                // The dependent will notify us when it stops; the stop-check
                // runs again at that point.
                all_stopped = false;
            }
            if force {
                self.force_stop(dep);
            }
            if let Some(d) = self.rec_mut(dep) {
                d.prop_stop = true;
            }
            self.add_to_prop_queue(dep);
        }
        all_stopped
    }

    pub(crate) fn stop_check_dependents(&self, id: ServiceId) -> bool {
        let Some(rec) = self.rec(id) else { return true };
        rec.dependents
            .iter()
            .all(|&dep| self.rec(dep).map(|r| r.is_stopped()).unwrap_or(true))
    }

    /// Mark this service and (transitively, via stop propagation) its
    /// dependents as force-stopped.
    pub(crate) fn force_stop(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.state != ServiceState::Stopped {
            rec.force_stop = true;
            self.add_to_stop_queue(id);
        }
    }

    /// All dependents are stopped; perform type-specific termination.
    pub(crate) fn all_deps_stopped(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        match rec.kind {
            ServiceKind::Internal => {
                if let Some(rec) = self.rec_mut(id) {
                    rec.waiting_for_deps = false;
                }
                self.stopped(id);
            }
            ServiceKind::Process(_) | ServiceKind::Bgprocess { .. } => {
                self.bring_down_process(id);
            }
            ServiceKind::Scripted { .. } => {
                self.bring_down_scripted(id);
            }
        }
    }

    pub(crate) fn do_auto_restart(&self, id: ServiceId) -> bool {
        self.auto_restart_enabled()
            && self.rec(id).map(|r| r.auto_restart).unwrap_or(false)
    }

    /// The service process (if any) has gone and dependents have stopped;
    /// finalize the stop. Also entered directly on unexpected termination.
    pub(crate) fn stopped(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        if rec.flags.runs_on_console {
            self.release_console(id);
        }

        let Some(rec) = self.rec_mut(id) else { return };
        rec.force_stop = false;

        // Break any soft-dependent acquisitions held on us.
        let soft_dpts = rec.soft_dpts.clone();
        for dpt in soft_dpts {
            let held = {
                let Some(d) = self.rec_mut(dpt) else { continue };
                match d.soft_deps.iter_mut().find(|e| e.to == id) {
                    Some(edge) if edge.holding_acq => {
                        edge.holding_acq = false;
                        true
                    }
                    _ => false,
                }
            };
            if held {
                self.release(id);
            }
        }

        let Some(rec) = self.rec(id) else { return };
        let will_restart = rec.desired_state == ServiceState::Started
            && rec.auto_restart
            && self.auto_restart_enabled();
        let name = rec.name.clone();

        // Dependencies may be waiting for us before progressing their own
        // stops.
        let deps = rec.depends_on.clone();
        for dep in deps {
            self.dependent_stopped(dep);
        }

        if let Some(rec) = self.rec_mut(id) {
            rec.state = ServiceState::Stopped;
        }

        if will_restart {
            if let Some(rec) = self.rec_mut(id) {
                rec.restarting = true;
            }
            self.start(id, false);
        } else if let Some(rec) = self.rec_mut(id) {
            rec.socket_fd = None;
            if rec.start_explicit {
                rec.start_explicit = false;
                self.release(id);
            } else if rec.required_by == 0 {
                rec.desired_state = ServiceState::Stopped;
                self.service_inactive(id);
            }
        }

        log::info!("service {} stopped", name);
        self.notify_listeners(id, ServiceEvent::Stopped);
    }

    /// The start attempt failed; transition to stopped and fail dependents.
    /// `dep_failed` marks failures propagated from a hard dependency.
    pub fn failed_to_start(&mut self, id: ServiceId, dep_failed: bool) {
        let Some(rec) = self.rec(id) else { return };
        if !dep_failed && rec.flags.starts_on_console {
            self.release_console(id);
        }

        let Some(rec) = self.rec_mut(id) else { return };
        let name = rec.name.clone();
        rec.state = ServiceState::Stopped;
        rec.waiting_for_deps = false;
        if rec.start_explicit {
            rec.start_explicit = false;
            self.release(id);
        }
        log::error!("service {} failed to start", name);
        self.notify_listeners(id, ServiceEvent::FailedStart);

        // Cancel starts of hard dependents.
        let dependents = self.rec(id).map(|r| r.dependents.clone()).unwrap_or_default();
        for dep in dependents {
            if self.rec(dep).map(|r| r.state) == Some(ServiceState::Starting) {
                if let Some(d) = self.rec_mut(dep) {
                    d.prop_failure = true;
                }
                self.add_to_prop_queue(dep);
            }
        }

        // Soft dependents merely stop waiting for us.
        let soft_dpts = self.rec(id).map(|r| r.soft_dpts.clone()).unwrap_or_default();
        for dpt in soft_dpts {
            let was_waiting = {
                let Some(d) = self.rec_mut(dpt) else { continue };
                match d.soft_deps.iter_mut().find(|e| e.to == id) {
                    Some(edge) if edge.waiting_on => {
                        edge.waiting_on = false;
                        edge.holding_acq = false;
                        true
                    }
                    _ => false,
                }
            };
            if was_waiting {
                self.dependency_started(dpt);
                self.release(id);
            }
        }

        // With nothing referencing it, the failed service is fully inactive.
        if let Some(rec) = self.rec_mut(id) {
            if rec.required_by == 0 {
                rec.desired_state = ServiceState::Stopped;
                self.service_inactive(id);
            }
        }
    }

    /// The service reached started.
    pub(crate) fn started(&mut self, id: ServiceId) {
        let Some(rec) = self.rec(id) else { return };
        if rec.flags.starts_on_console && !rec.flags.runs_on_console {
            self.release_console(id);
        }

        let Some(rec) = self.rec_mut(id) else { return };
        let name = rec.name.clone();
        rec.state = ServiceState::Started;
        log::info!("service {} started", name);
        self.notify_listeners(id, ServiceEvent::Started);

        let Some(rec) = self.rec(id) else { return };
        if rec.force_stop || rec.desired_state == ServiceState::Stopped {
            self.do_stop(id);
            return;
        }

        // Wake dependents that were waiting on us.
        let dependents = rec.dependents.clone();
        let soft_dpts = rec.soft_dpts.clone();
        for dep in dependents {
            self.dependency_started(dep);
        }
        for dpt in soft_dpts {
            self.dependency_started(dpt);
        }
    }

    /// Forced transition to stopped after an unexpected failure while
    /// started; dependents are brought down too.
    pub(crate) fn emergency_stop(&mut self, id: ServiceId) {
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

    /// Pin the service in the started state.
    pub fn pin_started(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if !rec.pinned_stopped {
                rec.pinned_started = true;
            }
        }
    }

    /// Pin the service in the stopped state.
    pub fn pin_stopped(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if !rec.pinned_started {
                rec.pinned_stopped = true;
            }
        }
    }

    /// Remove any pin; if the desired state disagrees with the current
    /// state, resume the appropriate transition.
    pub fn unpin(&mut self, id: ServiceId) {
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.pinned_started {
            rec.pinned_started = false;
            if rec.desired_state == ServiceState::Stopped {
                self.do_stop(id);
                self.process_queues();
            }
        }
        let Some(rec) = self.rec_mut(id) else { return };
        if rec.pinned_stopped {
            rec.pinned_stopped = false;
            if rec.desired_state == ServiceState::Started {
                self.do_start(id);
                self.process_queues();
            }
        }
    }
}
