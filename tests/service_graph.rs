//! Integration tests for the service graph engine, using internal services
//! (no child processes involved).

use dinit::event::LoopHandle;
use dinit::loader::{self, ServiceDirs};
use dinit::services::{
    ControlNotify, ServiceConfig, ServiceEvent, ServiceId, ServiceSet, ServiceState, ServiceType,
};
use tokio::sync::mpsc;

fn internal(name: &str, depends_on: &[&str], waits_for: &[&str]) -> ServiceConfig {
    let mut config = ServiceConfig::new(name, ServiceType::Internal);
    config.depends_on = depends_on.iter().map(|s| s.to_string()).collect();
    config.waits_for = waits_for.iter().map(|s| s.to_string()).collect();
    config
}

struct TestSet {
    set: ServiceSet,
    events: mpsc::UnboundedReceiver<ControlNotify>,
}

impl TestSet {
    fn new() -> Self {
        let (handle, _loop_rx) = LoopHandle::new();
        let mut set = ServiceSet::new(handle);
        let (tx, events) = mpsc::unbounded_channel();
        set.add_listener(tx);
        TestSet { set, events }
    }

    fn drain_events(&mut self) -> Vec<(ServiceId, ServiceEvent)> {
        let mut out = Vec::new();
        while let Ok(notify) = self.events.try_recv() {
            if let ControlNotify::ServiceEvent { service, event } = notify {
                out.push((service, event));
            }
        }
        out
    }

    fn state(&self, id: ServiceId) -> ServiceState {
        self.set.service(id).unwrap().state
    }

    fn required_by(&self, id: ServiceId) -> u32 {
        self.set.service(id).unwrap().required_by
    }
}

/// Check the structural invariants that must hold whenever the queues are
/// quiescent.
fn assert_invariants(set: &ServiceSet) {
    for (_, rec) in set.services() {
        if rec.state == ServiceState::Started {
            for &dep in &rec.depends_on {
                assert_eq!(
                    set.service(dep).unwrap().state,
                    ServiceState::Started,
                    "hard dependency of started service {} not started",
                    rec.name
                );
            }
        }
        if rec.state == ServiceState::Stopped {
            assert!(rec.pid().is_none(), "stopped service {} has a pid", rec.name);
        }
        if rec.start_explicit {
            assert!(rec.required_by >= 1);
        }
        assert!(!(rec.pinned_started && rec.pinned_stopped));
    }

    // required_by equals the count of distinct references: the explicit
    // activation, hard dependents that are themselves required, and soft
    // dependents holding an acquisition.
    for (id, rec) in set.services() {
        let mut expected = u32::from(rec.start_explicit);
        for (_, other) in set.services() {
            if other.depends_on.contains(&id) && other.required_by > 0 {
                expected += 1;
            }
            if other
                .soft_deps
                .iter()
                .any(|edge| edge.to == id && edge.holding_acq)
            {
                expected += 1;
            }
        }
        assert_eq!(
            rec.required_by, expected,
            "reference count mismatch for {}",
            rec.name
        );
    }
}

#[test]
fn simple_start_and_stop() {
    let mut t = TestSet::new();
    let a = t.set.add_service(internal("a", &[], &[])).unwrap();

    assert_eq!(t.set.active_services(), 0);
    t.set.start(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);

    assert_eq!(t.state(a), ServiceState::Started);
    assert_eq!(t.required_by(a), 1);
    assert_eq!(t.set.active_services(), 1);
    assert_eq!(t.drain_events(), vec![(a, ServiceEvent::Started)]);

    t.set.stop(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);

    assert_eq!(t.state(a), ServiceState::Stopped);
    assert_eq!(t.required_by(a), 0);
    assert_eq!(t.set.active_services(), 0);
    assert!(!t.set.service(a).unwrap().start_explicit);
    assert_eq!(t.drain_events(), vec![(a, ServiceEvent::Stopped)]);
}

#[test]
fn chain_start_orders_dependency_first() {
    let mut t = TestSet::new();
    let b = t.set.add_service(internal("b", &[], &[])).unwrap();
    let a = t.set.add_service(internal("a", &["b"], &[])).unwrap();

    t.set.start(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);

    assert_eq!(t.state(a), ServiceState::Started);
    assert_eq!(t.state(b), ServiceState::Started);
    assert_eq!(t.required_by(a), 1, "explicit activation only");
    assert_eq!(t.required_by(b), 1, "held by a");

    let events = t.drain_events();
    let b_pos = events
        .iter()
        .position(|&e| e == (b, ServiceEvent::Started))
        .unwrap();
    let a_pos = events
        .iter()
        .position(|&e| e == (a, ServiceEvent::Started))
        .unwrap();
    assert!(b_pos < a_pos, "dependency must start before dependent");

    // Stopping the dependent releases the dependency, which stops too.
    t.set.stop(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(a), ServiceState::Stopped);
    assert_eq!(t.state(b), ServiceState::Stopped);
    assert_eq!(t.set.active_services(), 0);

    let events = t.drain_events();
    let a_stop = events
        .iter()
        .position(|&e| e == (a, ServiceEvent::Stopped))
        .unwrap();
    let b_stop = events
        .iter()
        .position(|&e| e == (b, ServiceEvent::Stopped))
        .unwrap();
    assert!(a_stop < b_stop, "dependent must stop before dependency");
}

#[test]
fn soft_dependency_holds_acquisition() {
    let mut t = TestSet::new();
    let b = t.set.add_service(internal("b", &[], &[])).unwrap();
    let a = t.set.add_service(internal("a", &[], &["b"])).unwrap();

    t.set.start(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);

    assert_eq!(t.state(a), ServiceState::Started);
    assert_eq!(t.state(b), ServiceState::Started);
    assert!(t.set.service(a).unwrap().soft_deps[0].holding_acq);
    assert_eq!(t.required_by(b), 1);

    t.set.stop(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(b), ServiceState::Stopped);
    assert_eq!(t.required_by(b), 0);
}

#[test]
fn require_release_is_identity() {
    let mut t = TestSet::new();
    let a = t.set.add_service(internal("a", &[], &[])).unwrap();

    let before_active = t.set.active_services();
    t.set.require(a);
    t.set.process_queues();
    assert_eq!(t.required_by(a), 1);

    t.set.release(a);
    t.set.process_queues();
    assert_invariants(&t.set);

    let rec = t.set.service(a).unwrap();
    assert_eq!(rec.required_by, 0);
    assert_eq!(rec.state, ServiceState::Stopped);
    assert_eq!(rec.desired_state, ServiceState::Stopped);
    assert!(!rec.prop_require && !rec.prop_release);
    assert_eq!(t.set.active_services(), before_active);
}

#[test]
fn load_unload_restores_cardinality() {
    let mut t = TestSet::new();
    let before = t.set.loaded_count();
    let a = t.set.add_service(internal("leaf", &[], &[])).unwrap();
    assert_eq!(t.set.loaded_count(), before + 1);

    t.set.unload(a).unwrap();
    assert_eq!(t.set.loaded_count(), before);
    assert!(t.set.find_service("leaf").is_none());
}

#[test]
fn unload_refused_for_running_or_depended_on_services() {
    let mut t = TestSet::new();
    let b = t.set.add_service(internal("b", &[], &[])).unwrap();
    let _a = t.set.add_service(internal("a", &["b"], &[])).unwrap();

    // b has a dependent.
    assert!(t.set.unload(b).is_err());

    // A started service cannot be unloaded either.
    let c = t.set.add_service(internal("c", &[], &[])).unwrap();
    t.set.start(c, true);
    t.set.process_queues();
    assert!(t.set.unload(c).is_err());

    t.set.stop(c, true);
    t.set.process_queues();
    assert!(t.set.unload(c).is_ok());
}

#[test]
fn pinned_stopped_never_starts() {
    let mut t = TestSet::new();
    let a = t.set.add_service(internal("a", &[], &[])).unwrap();

    t.set.pin_stopped(a);
    t.set.start(a, true);
    t.set.process_queues();
    assert_invariants(&t.set);

    let rec = t.set.service(a).unwrap();
    assert_eq!(rec.state, ServiceState::Stopped);
    assert_eq!(rec.desired_state, ServiceState::Started);
    assert!(rec.start_explicit);

    // Unpinning applies the recorded desired state.
    t.set.unpin(a);
    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(a), ServiceState::Started);
}

#[test]
fn pinned_started_never_stops() {
    let mut t = TestSet::new();
    let a = t.set.add_service(internal("a", &[], &[])).unwrap();

    t.set.start(a, true);
    t.set.process_queues();
    t.set.pin_started(a);

    t.set.stop(a, true);
    t.set.process_queues();
    assert_eq!(t.state(a), ServiceState::Started);

    t.set.unpin(a);
    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(a), ServiceState::Stopped);
}

#[test]
fn interrupted_stop_emits_stop_cancelled() {
    let mut t = TestSet::new();
    let b = t.set.add_service(internal("b", &[], &[])).unwrap();

    t.set.start(b, true);
    t.set.process_queues();
    t.drain_events();

    // Begin a stop but flip it back to a start before the queues run; the
    // stop is still waiting on dependents, so it can be interrupted.
    t.set.stop(b, true);
    assert_eq!(t.state(b), ServiceState::Stopping);
    t.set.start(b, true);
    assert_eq!(t.state(b), ServiceState::Starting);

    let events = t.drain_events();
    assert!(events.contains(&(b, ServiceEvent::StopCancelled)));

    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(b), ServiceState::Started);
}

#[test]
fn console_contention_and_cancellation() {
    let mut t = TestSet::new();
    let mut config_a = internal("a", &[], &[]);
    config_a.flags.starts_on_console = true;
    config_a.flags.runs_on_console = true;
    let a = t.set.add_service(config_a).unwrap();

    let mut config_b = internal("b", &[], &[]);
    config_b.flags.starts_on_console = true;
    let b = t.set.add_service(config_b).unwrap();

    // a acquires the console and keeps it while running.
    t.set.start(a, true);
    t.set.process_queues();
    assert_eq!(t.state(a), ServiceState::Started);
    assert_eq!(t.set.console_holder(), Some(a));

    // b queues behind a.
    t.set.start(b, true);
    t.set.process_queues();
    assert_eq!(t.state(b), ServiceState::Starting);
    assert_eq!(t.set.console_queue_len(), 1);
    t.drain_events();

    // Stopping b removes it from the queue without acquiring.
    t.set.stop(b, true);
    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(b), ServiceState::Stopped);
    assert_eq!(t.set.console_queue_len(), 0);
    assert_eq!(t.set.console_holder(), Some(a));
    let events = t.drain_events();
    assert!(events.contains(&(b, ServiceEvent::StartCancelled)));

    // When a stops, the console is freed.
    t.set.stop(a, true);
    t.set.process_queues();
    assert_eq!(t.set.console_holder(), None);
}

#[test]
fn shutdown_rollback_stops_everything_in_reverse_order() {
    let mut t = TestSet::new();
    let c = t.set.add_service(internal("c", &[], &[])).unwrap();
    let b = t.set.add_service(internal("b", &["c"], &[])).unwrap();
    let a = t.set.add_service(internal("a", &["b"], &[])).unwrap();

    t.set.start(a, true);
    t.set.start(c, true);
    t.set.process_queues();
    t.drain_events();

    t.set.stop_all_services();
    assert!(t.set.all_stopped());
    assert_eq!(t.set.active_services(), 0);
    assert_invariants(&t.set);

    let events = t.drain_events();
    let pos = |id| {
        events
            .iter()
            .position(|&e| e == (id, ServiceEvent::Stopped))
            .unwrap()
    };
    assert!(pos(a) < pos(b), "a must stop before its dependency b");
    assert!(pos(b) < pos(c), "b must stop before its dependency c");
}

#[test]
fn wake_does_not_set_explicit_activation() {
    let mut t = TestSet::new();
    let a = t.set.add_service(internal("a", &[], &[])).unwrap();

    t.set.start(a, false);
    t.set.process_queues();
    let rec = t.set.service(a).unwrap();
    assert_eq!(rec.state, ServiceState::Started);
    assert!(!rec.start_explicit);
    assert_eq!(rec.required_by, 0);
}

#[test]
fn load_from_description_files_and_start() {
    let dir = std::env::temp_dir().join(format!("dinit-graph-loader-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("boot"), "type = internal\ndepends-on = base\n").unwrap();
    std::fs::write(dir.join("base"), "type = internal\n").unwrap();

    let mut t = TestSet::new();
    let dirs = ServiceDirs::from_dir(&dir);
    let boot = loader::load_service(&mut t.set, &dirs, "boot").unwrap();

    t.set.start(boot, true);
    t.set.process_queues();
    assert_invariants(&t.set);
    assert_eq!(t.state(boot), ServiceState::Started);
    let base = t.set.find_service("base").unwrap();
    assert_eq!(t.state(base), ServiceState::Started);
}
