//! dinit - service supervisor and init daemon
//!
//! Loads and activates the requested services (default: `boot` in system
//! mode), then serves control requests on the control socket. When running
//! as PID 1 it also reaps orphans and turns termination signals into an
//! orderly rollback followed by halt/poweroff/reboot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};

use dinit::control::{self, SharedSet};
use dinit::event::{Event, LoopHandle};
use dinit::loader::{self, ServiceDirs};
use dinit::pid1::{self, DaemonSignal, SignalHandler};
use dinit::protocol::{self, ShutdownType};
use dinit::services::ServiceSet;

#[derive(Parser)]
#[command(name = "dinit")]
#[command(about = "Service supervisor and init daemon")]
#[command(
    long_about = "dinit supervises a set of interdependent services. It runs as \
    PID 1 (system mode) or as a user session manager, and is controlled over \
    a unix socket by dinitctl."
)]
struct Args {
    /// Run as the system daemon (implied when running as PID 1)
    #[arg(long, short = 's')]
    system: bool,

    /// Directory to load service descriptions from
    #[arg(long)]
    services_dir: Option<PathBuf>,

    /// Control socket path override
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Services to activate at startup (default: "boot" in system mode)
    services: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_pid1 = pid1::is_pid1();
    let system = args.system || is_pid1;

    let dirs = Arc::new(match &args.services_dir {
        Some(dir) => ServiceDirs::from_dir(dir),
        None if system => ServiceDirs::system(),
        None => ServiceDirs::user(),
    });
    let sock_path = match args.socket_path {
        Some(p) => p,
        None => protocol::socket_path(system)
            .ok_or("cannot determine control socket path (is HOME set?)")?,
    };

    let (loop_handle, mut events) = LoopHandle::new();
    let mut services = ServiceSet::new(loop_handle.clone());
    services.reap_unknown_children = is_pid1;

    // Load and activate the startup services.
    let startup: Vec<String> = if !args.services.is_empty() {
        args.services.clone()
    } else if system {
        vec!["boot".to_string()]
    } else {
        Vec::new()
    };
    for name in &startup {
        match loader::load_service(&mut services, &dirs, name) {
            Ok(id) => services.start(id, true),
            Err(e) => log::error!("cannot load service {}: {}", name, e),
        }
    }
    services.process_queues();

    let set: SharedSet = Arc::new(RwLock::new(services));

    // Control socket.
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)?;
    info!(
        "dinit{} listening on {}",
        if system { "" } else { " (user)" },
        sock_path.display()
    );

    // SIGCHLD drives child status collection.
    let mut sigchld = signal(SignalKind::child())?;
    {
        let handle = loop_handle.clone();
        tokio::spawn(async move {
            loop {
                if sigchld.recv().await.is_none() {
                    break;
                }
                handle.notify_child_status();
            }
        });
    }

    let mut signals = SignalHandler::new()?.spawn_forwarder();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<ShutdownType>(4);

    let mut rollback: Option<ShutdownType> = None;

    loop {
        tokio::select! {
            // Child status first: process death must be recorded before
            // anything that might signal a recycled pid.
            biased;

            event = events.recv() => {
                match event {
                    Some(Event::ControlConn { fd }) => {
                        let stream = std::os::unix::net::UnixStream::from(fd);
                        match tokio::net::UnixStream::from_std(stream) {
                            Ok(stream) => {
                                tokio::spawn(control::handle_connection(
                                    stream,
                                    Arc::clone(&set),
                                    Arc::clone(&dirs),
                                    shutdown_tx.clone(),
                                ));
                            }
                            Err(e) => log::error!("cannot register control connection: {}", e),
                        }
                    }
                    Some(event) => set.write().await.dispatch_event(event),
                    None => break,
                }
            }

            Some(kind) = shutdown_rx.recv() => {
                if rollback.is_none() {
                    info!("shutdown requested ({:?}); stopping all services", kind);
                    rollback = Some(kind);
                    set.write().await.stop_all_services();
                }
            }

            Some(sig) = signals.recv() => {
                match sig {
                    DaemonSignal::Term => {
                        if rollback.is_none() {
                            info!("received SIGTERM; stopping all services");
                            rollback = Some(ShutdownType::Halt);
                            set.write().await.stop_all_services();
                        }
                    }
                    DaemonSignal::Int => {
                        if is_pid1 {
                            if rollback.is_none() {
                                info!("received SIGINT; stopping all services for reboot");
                                rollback = Some(ShutdownType::Reboot);
                                set.write().await.stop_all_services();
                            }
                        } else {
                            // Not init; just leave the session manager.
                            info!("received SIGINT; exiting");
                            break;
                        }
                    }
                    DaemonSignal::Hup => {
                        // Reserved for configuration reload.
                        log::debug!("SIGHUP ignored");
                    }
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(control::handle_connection(
                            stream,
                            Arc::clone(&set),
                            Arc::clone(&dirs),
                            shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => log::error!("accept error: {}", e),
                }
            }
        }

        if rollback.is_some() && set.read().await.all_stopped() {
            info!("rollback complete");
            set.write().await.notify_rollback_complete();
            break;
        }
    }

    // Give control connections a chance to flush the rollback notification.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = std::fs::remove_file(&sock_path);

    if let Some(kind) = rollback {
        if is_pid1 {
            pid1::shutdown(kind);
        }
    }
    Ok(())
}
