//! Service set: the dependency graph of loaded services and the engine that
//! drives it.
//!
//! All state lives in an arena of [`ServiceRecord`]s indexed by
//! [`ServiceId`]; every operation that crosses a service boundary goes
//! through the set. External entry points (control requests, event
//! dispatch) mutate intent and enqueue work, then call
//! [`ServiceSet::process_queues`] to drive the graph to quiescence.

mod console;
mod graph;
pub mod record;
pub mod state;

pub use record::{
    OnstartFlags, ProcessFields, ServiceConfig, ServiceKind, ServiceRecord, ServiceType, SoftDep,
};
pub use state::{ExitStatus, ServiceEvent, ServiceState};

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::event::LoopHandle;

/// Index of a service record within the set. Doubles as the control
/// protocol handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u32);

/// Notification delivered to control connections.
#[derive(Debug, Clone, Copy)]
pub enum ControlNotify {
    ServiceEvent {
        service: ServiceId,
        event: ServiceEvent,
    },
    RollbackCompleted,
}

/// Why a service could not be unloaded.
#[derive(Debug, thiserror::Error)]
pub enum UnloadError {
    #[error("service is not stopped")]
    NotStopped,
    #[error("service is a dependency of another service")]
    HasDependents,
    #[error("service is still required")]
    StillRequired,
    #[error("service has pending work")]
    Busy,
}

/// Why a service config could not be inserted.
#[derive(Debug, thiserror::Error)]
pub enum AddServiceError {
    #[error("duplicate service name: {0}")]
    DuplicateName(String),
    #[error("dependency not loaded: {0}")]
    UnknownDependency(String),
}

pub struct ServiceSet {
    records: Vec<Option<ServiceRecord>>,
    active_services: u32,
    /// Global auto-restart switch; cleared during shutdown rollback.
    restart_enabled: bool,
    prop_queue: VecDeque<ServiceId>,
    start_queue: VecDeque<ServiceId>,
    stop_queue: VecDeque<ServiceId>,
    pub(crate) console_queue: VecDeque<ServiceId>,
    pub(crate) console_holder: Option<ServiceId>,
    listeners: Vec<(u64, mpsc::UnboundedSender<ControlNotify>)>,
    next_listener: u64,
    loop_handle: LoopHandle,
    /// Exec-failure children whose exit has not been collected yet.
    pub(crate) discard_pids: Vec<nix::unistd::Pid>,
    /// Also sweep children we did not launch (PID 1 duty).
    pub reap_unknown_children: bool,
}

impl ServiceSet {
    pub fn new(loop_handle: LoopHandle) -> Self {
        ServiceSet {
            records: Vec::new(),
            active_services: 0,
            restart_enabled: true,
            prop_queue: VecDeque::new(),
            start_queue: VecDeque::new(),
            stop_queue: VecDeque::new(),
            console_queue: VecDeque::new(),
            console_holder: None,
            listeners: Vec::new(),
            next_listener: 0,
            loop_handle,
            discard_pids: Vec::new(),
            reap_unknown_children: false,
        }
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Number of loaded services.
    pub fn loaded_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    /// Services counted as active (required, in transition, or started).
    pub fn active_services(&self) -> u32 {
        self.active_services
    }

    pub fn auto_restart_enabled(&self) -> bool {
        self.restart_enabled
    }

    pub fn set_auto_restart_enabled(&mut self, enabled: bool) {
        self.restart_enabled = enabled;
    }

    /// Insert a service built from `config`. All hard and soft dependency
    /// names must resolve to already-loaded services.
    pub fn add_service(&mut self, config: ServiceConfig) -> Result<ServiceId, AddServiceError> {
        if self.find_service(&config.name).is_some() {
            return Err(AddServiceError::DuplicateName(config.name));
        }
        let mut hard = Vec::new();
        for dep in &config.depends_on {
            let id = self
                .find_service(dep)
                .ok_or_else(|| AddServiceError::UnknownDependency(dep.clone()))?;
            hard.push(id);
        }
        let mut soft = Vec::new();
        for dep in &config.waits_for {
            let id = self
                .find_service(dep)
                .ok_or_else(|| AddServiceError::UnknownDependency(dep.clone()))?;
            soft.push(id);
        }

        let id = ServiceId(self.records.len() as u32);
        let mut record = config.into_record();
        record.depends_on = hard.clone();
        record.soft_deps = soft
            .iter()
            .map(|&to| SoftDep {
                to,
                waiting_on: false,
                holding_acq: false,
            })
            .collect();
        self.records.push(Some(record));

        // Reverse adjacency is kept in lock-step with the forward edges.
        for dep in hard {
            if let Some(rec) = self.rec_mut(dep) {
                rec.dependents.push(id);
            }
        }
        for dep in soft {
            if let Some(rec) = self.rec_mut(dep) {
                rec.soft_dpts.push(id);
            }
        }
        Ok(id)
    }

    pub fn find_service(&self, name: &str) -> Option<ServiceId> {
        self.records.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|r| r.name == name)
                .map(|_| ServiceId(i as u32))
        })
    }

    pub fn service(&self, id: ServiceId) -> Option<&ServiceRecord> {
        self.records.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    /// Iterate loaded services in id order.
    pub fn services(&self) -> impl Iterator<Item = (ServiceId, &ServiceRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (ServiceId(i as u32), r)))
    }

    /// Remove a service record. Refused unless the service is stopped, not
    /// required by anything, referenced by no dependent, and has no pending
    /// queue entries.
    pub fn unload(&mut self, id: ServiceId) -> Result<(), UnloadError> {
        {
            let Some(rec) = self.service(id) else {
                return Ok(());
            };
            if rec.state != ServiceState::Stopped || rec.desired_state != ServiceState::Stopped {
                return Err(UnloadError::NotStopped);
            }
            if rec.required_by != 0 {
                return Err(UnloadError::StillRequired);
            }
            if !rec.dependents.is_empty() || !rec.soft_dpts.is_empty() {
                return Err(UnloadError::HasDependents);
            }
            if rec.queued_prop || rec.queued_start || rec.queued_stop {
                return Err(UnloadError::Busy);
            }
        }
        let Some(rec) = self.records[id.0 as usize].take() else {
            return Ok(());
        };
        for dep in rec.depends_on {
            if let Some(d) = self.rec_mut(dep) {
                d.dependents.retain(|&x| x != id);
            }
        }
        for soft in rec.soft_deps {
            if let Some(d) = self.rec_mut(soft.to) {
                d.soft_dpts.retain(|&x| x != id);
            }
        }
        Ok(())
    }

    /// Subscribe to lifecycle notifications. Returns a token for
    /// [`ServiceSet::remove_listener`].
    pub fn add_listener(&mut self, tx: mpsc::UnboundedSender<ControlNotify>) -> u64 {
        let token = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((token, tx));
        token
    }

    pub fn remove_listener(&mut self, token: u64) {
        self.listeners.retain(|(t, _)| *t != token);
    }

    pub(crate) fn notify_listeners(&mut self, id: ServiceId, event: ServiceEvent) {
        self.listeners.retain(|(_, tx)| {
            tx.send(ControlNotify::ServiceEvent { service: id, event })
                .is_ok()
        });
    }

    /// Announce rollback completion to every control connection.
    pub fn notify_rollback_complete(&mut self) {
        self.listeners
            .retain(|(_, tx)| tx.send(ControlNotify::RollbackCompleted).is_ok());
    }

    /// Begin shutdown rollback: no further automatic restarts, and every
    /// service is asked to stop. Dependency ordering is enforced by the
    /// stop propagation itself.
    pub fn stop_all_services(&mut self) {
        self.restart_enabled = false;
        let ids: Vec<ServiceId> = self.services().map(|(id, _)| id).collect();
        for id in ids {
            self.stop(id, true);
        }
        self.process_queues();
    }

    /// True once every loaded service is stopped.
    pub fn all_stopped(&self) -> bool {
        self.services()
            .all(|(_, r)| r.state == ServiceState::Stopped)
    }

    pub(crate) fn rec(&self, id: ServiceId) -> Option<&ServiceRecord> {
        self.records.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn rec_mut(&mut self, id: ServiceId) -> Option<&mut ServiceRecord> {
        self.records.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub(crate) fn add_to_prop_queue(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if !rec.queued_prop {
                rec.queued_prop = true;
                self.prop_queue.push_back(id);
            }
        }
    }

    pub(crate) fn add_to_start_queue(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if !rec.queued_start {
                rec.queued_start = true;
                self.start_queue.push_back(id);
            }
        }
    }

    pub(crate) fn add_to_stop_queue(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if !rec.queued_stop {
                rec.queued_stop = true;
                self.stop_queue.push_back(id);
            }
        }
    }

    /// Drain the work queues to quiescence, in the fixed order
    /// propagation, start, stop.
    pub fn process_queues(&mut self) {
        loop {
            if let Some(id) = self.prop_queue.pop_front() {
                if let Some(rec) = self.rec_mut(id) {
                    rec.queued_prop = false;
                }
                self.do_propagation(id);
                continue;
            }
            if let Some(id) = self.start_queue.pop_front() {
                if let Some(rec) = self.rec_mut(id) {
                    rec.queued_start = false;
                }
                self.execute_transition(id);
                continue;
            }
            if let Some(id) = self.stop_queue.pop_front() {
                if let Some(rec) = self.rec_mut(id) {
                    rec.queued_stop = false;
                }
                self.execute_transition(id);
                continue;
            }
            break;
        }
    }

    /// Count this service into the active tally (idempotent).
    pub(crate) fn service_active(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if !rec.marked_active {
                rec.marked_active = true;
                self.active_services += 1;
            }
        }
    }

    /// Remove this service from the active tally (idempotent).
    pub(crate) fn service_inactive(&mut self, id: ServiceId) {
        if let Some(rec) = self.rec_mut(id) {
            if rec.marked_active {
                rec.marked_active = false;
                self.active_services -= 1;
            }
        }
    }
}
