//! Integration tests for the process supervisor, driving real child
//! processes through the event loop facade.

use std::time::Duration;

use dinit::event::{Event, LoopHandle};
use dinit::services::{
    ControlNotify, ServiceConfig, ServiceEvent, ServiceId, ServiceSet, ServiceState, ServiceType,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct TestHarness {
    set: ServiceSet,
    loop_rx: mpsc::UnboundedReceiver<Event>,
    events: mpsc::UnboundedReceiver<ControlNotify>,
}

impl TestHarness {
    fn new() -> Self {
        let (handle, loop_rx) = LoopHandle::new();
        let mut set = ServiceSet::new(handle);
        let (tx, events) = mpsc::unbounded_channel();
        set.add_listener(tx);
        TestHarness {
            set,
            loop_rx,
            events,
        }
    }

    /// Feed loop events (and periodic child status sweeps) into the engine
    /// until `pred` holds.
    async fn drive_until(&mut self, pred: impl Fn(&ServiceSet) -> bool) {
        for _ in 0..200 {
            if pred(&self.set) {
                return;
            }
            match timeout(Duration::from_millis(25), self.loop_rx.recv()).await {
                Ok(Some(event)) => self.set.dispatch_event(event),
                Ok(None) => panic!("event loop channel closed"),
                Err(_) => {
                    // No pending events; sweep for child exits.
                    self.set.reap();
                    self.set.process_queues();
                }
            }
        }
        panic!("condition not reached");
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
}

fn process_service(name: &str, command: &[&str]) -> ServiceConfig {
    let mut config = ServiceConfig::new(name, ServiceType::Process);
    config.command = command.iter().map(|s| s.to_string()).collect();
    config
}

#[tokio::test]
async fn process_start_and_stop() {
    let mut h = TestHarness::new();
    let a = h
        .set
        .add_service(process_service("sleeper", &["/bin/sleep", "30"]))
        .unwrap();

    h.set.start(a, true);
    h.set.process_queues();
    assert_eq!(h.state(a), ServiceState::Starting);

    // The exec status pipe EOF marks the service started.
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Started)
        .await;
    let pid = h.set.service(a).unwrap().pid().expect("no pid recorded");
    assert!(nix::sys::signal::kill(pid, None).is_ok(), "child not alive");
    assert!(h.drain_events().contains(&(a, ServiceEvent::Started)));

    // Stop: SIGTERM to the process group, then the reap path finishes.
    h.set.stop(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Stopped)
        .await;
    assert!(h.set.service(a).unwrap().pid().is_none());
    assert_eq!(h.set.active_services(), 0);
    assert!(h.drain_events().contains(&(a, ServiceEvent::Stopped)));
}

#[tokio::test]
async fn exec_failure_fails_the_start() {
    let mut h = TestHarness::new();
    let a = h
        .set
        .add_service(process_service("broken", &["/nonexistent/no-such-binary"]))
        .unwrap();

    h.set.start(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Stopped)
        .await;

    let rec = h.set.service(a).unwrap();
    assert!(!rec.start_explicit);
    assert_eq!(rec.required_by, 0);
    assert_eq!(h.set.active_services(), 0);
    assert!(h.drain_events().contains(&(a, ServiceEvent::FailedStart)));
}

#[tokio::test]
async fn failed_hard_dependency_cancels_dependent() {
    let mut h = TestHarness::new();
    let b = h
        .set
        .add_service(process_service("b", &["/nonexistent/no-such-binary"]))
        .unwrap();
    let a = {
        let mut config = ServiceConfig::new("a", ServiceType::Internal);
        config.depends_on = vec!["b".to_string()];
        h.set.add_service(config).unwrap()
    };

    h.set.start(a, true);
    h.set.process_queues();
    assert_eq!(h.state(a), ServiceState::Starting);
    assert_eq!(h.state(b), ServiceState::Starting);
    assert_eq!(h.set.service(b).unwrap().required_by, 1, "held by a");

    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Stopped)
        .await;

    let events = h.drain_events();
    assert!(events.contains(&(b, ServiceEvent::FailedStart)));
    assert!(events.contains(&(a, ServiceEvent::FailedStart)));

    let a_rec = h.set.service(a).unwrap();
    assert_eq!(a_rec.state, ServiceState::Stopped);
    assert!(!a_rec.start_explicit, "explicit activation cleared on failure");
    assert_eq!(
        h.set.service(b).unwrap().required_by,
        0,
        "a's acquisition of b released"
    );
    assert_eq!(h.set.active_services(), 0);
}

#[tokio::test]
async fn scripted_start_and_stop_commands() {
    let mut h = TestHarness::new();
    let a = {
        let mut config = ServiceConfig::new("script", ServiceType::Scripted);
        config.command = vec!["/bin/true".to_string()];
        config.stop_command = vec!["/bin/true".to_string()];
        h.set.add_service(config).unwrap()
    };

    // A scripted service is started once its command exits successfully.
    h.set.start(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Started)
        .await;
    assert!(h.set.service(a).unwrap().pid().is_none());

    // Stop runs the stop command to completion.
    h.set.stop(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Stopped)
        .await;
    assert_eq!(h.set.active_services(), 0);
}

#[tokio::test]
async fn scripted_start_failure() {
    let mut h = TestHarness::new();
    let a = {
        let mut config = ServiceConfig::new("script", ServiceType::Scripted);
        config.command = vec!["/bin/false".to_string()];
        h.set.add_service(config).unwrap()
    };

    h.set.start(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Stopped)
        .await;
    assert!(h.drain_events().contains(&(a, ServiceEvent::FailedStart)));
}

#[tokio::test]
async fn bgprocess_tracks_pid_file() {
    let pid_file = std::env::temp_dir().join(format!("dinit-bgtest-{}.pid", std::process::id()));
    let _ = std::fs::remove_file(&pid_file);

    let mut h = TestHarness::new();
    let a = {
        let mut config = ServiceConfig::new("daemonish", ServiceType::Bgprocess);
        config.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("sleep 5 & echo $! > {}", pid_file.display()),
        ];
        config.pid_file = Some(pid_file.clone());
        h.set.add_service(config).unwrap()
    };

    h.set.start(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Started)
        .await;

    // The pid from the pid file is not our child; it is merely observed.
    let rec = h.set.service(a).unwrap();
    assert!(rec.pid().is_some());

    h.set.stop(a, true);
    h.set.process_queues();
    h.drive_until(move |set| set.service(a).unwrap().state == ServiceState::Stopped)
        .await;
    let _ = std::fs::remove_file(&pid_file);
}

#[tokio::test]
async fn auto_restart_delay_can_be_interrupted() {
    let mut h = TestHarness::new();
    let a = {
        let mut config = process_service("flapper", &["/bin/true"]);
        config.auto_restart = true;
        h.set.add_service(config).unwrap()
    };

    h.set.start(a, true);
    h.set.process_queues();

    // /bin/true execs (-> started), exits immediately (-> unexpected exit),
    // and the restart delay timer is armed for the automatic restart.
    h.drive_until(move |set| {
        set.service(a)
            .unwrap()
            .kind
            .proc()
            .map(|p| p.waiting_restart_timer)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(h.state(a), ServiceState::Starting);
    h.drain_events();

    // A stop during the armed delay cancels the start; no process is ever
    // forked again.
    h.set.stop(a, true);
    h.set.process_queues();
    assert_eq!(h.state(a), ServiceState::Stopped);
    assert!(h.set.service(a).unwrap().pid().is_none());
    let proc_fields = h.set.service(a).unwrap().kind.proc().unwrap();
    assert!(!proc_fields.waiting_restart_timer);
    assert!(h.drain_events().contains(&(a, ServiceEvent::StartCancelled)));
    assert_eq!(h.set.active_services(), 0);
}
