//! Control socket connection handling.
//!
//! Each connection is served by its own task: requests are decoded and
//! applied to the shared service set, and lifecycle notifications the
//! connection has subscribed to are interleaved as information packets.
//! Protocol errors close the connection; the engine is unaffected.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, RwLock};

use crate::loader::{self, ServiceDirs};
use crate::protocol::*;
use crate::services::{ControlNotify, ServiceId, ServiceSet, ServiceState};

/// Service set shared between the main loop and control connections.
pub type SharedSet = Arc<RwLock<ServiceSet>>;

/// Serve one control connection until EOF or protocol error.
pub async fn handle_connection(
    stream: UnixStream,
    set: SharedSet,
    dirs: Arc<ServiceDirs>,
    shutdown: mpsc::Sender<ShutdownType>,
) {
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let listener_token = set.write().await.add_listener(notify_tx);

    let (mut rd, mut wr) = stream.into_split();
    loop {
        tokio::select! {
            cmd = rd.read_u8() => {
                let cmd = match cmd {
                    Ok(c) => c,
                    Err(_) => break,
                };
                match process_command(cmd, &mut rd, &mut wr, &set, &dirs, &shutdown).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::debug!("control connection error: {}", e);
                        break;
                    }
                }
            }
            notify = notify_rx.recv() => {
                let Some(notify) = notify else { break };
                if write_notify(&mut wr, notify).await.is_err() {
                    break;
                }
            }
        }
    }

    set.write().await.remove_listener(listener_token);
}

async fn write_notify(
    wr: &mut (impl AsyncWriteExt + Unpin),
    notify: ControlNotify,
) -> std::io::Result<()> {
    match notify {
        ControlNotify::ServiceEvent { service, event } => {
            let mut packet = [0u8; SERVICEEVENT_LEN as usize];
            packet[0] = IP_SERVICEEVENT;
            packet[1] = SERVICEEVENT_LEN;
            packet[2..6].copy_from_slice(&service.0.to_le_bytes());
            packet[6] = event.code();
            wr.write_all(&packet).await
        }
        ControlNotify::RollbackCompleted => {
            wr.write_all(&[IP_ROLLBACK_COMPLETED, ROLLBACK_COMPLETED_LEN])
                .await
        }
    }
}

/// Decode and execute one request. Returns Ok(false) to close the
/// connection.
async fn process_command(
    cmd: u8,
    rd: &mut (impl AsyncReadExt + Unpin),
    wr: &mut (impl AsyncWriteExt + Unpin),
    set: &SharedSet,
    dirs: &ServiceDirs,
    shutdown: &mpsc::Sender<ShutdownType>,
) -> std::io::Result<bool> {
    match cmd {
        CP_QUERYVERSION => {
            let mut reply = [0u8; 5];
            reply[0] = RP_CPVERSION;
            reply[1..3].copy_from_slice(&MIN_CP_VERSION.to_le_bytes());
            reply[3..5].copy_from_slice(&MAX_CP_VERSION.to_le_bytes());
            wr.write_all(&reply).await?;
            Ok(true)
        }

        CP_FINDSERVICE | CP_LOADSERVICE => {
            let name_len = rd.read_u16_le().await? as usize;
            let mut name_buf = vec![0u8; name_len];
            rd.read_exact(&mut name_buf).await?;
            let Ok(name) = String::from_utf8(name_buf) else {
                wr.write_all(&[RP_NOSERVICE]).await?;
                return Ok(true);
            };

            let reply: Option<[u8; 7]> = {
                let mut set = set.write().await;
                let found = match set.find_service(&name) {
                    Some(id) => Some(id),
                    None if cmd == CP_LOADSERVICE => {
                        match loader::load_service(&mut set, dirs, &name) {
                            Ok(id) => Some(id),
                            Err(e) => {
                                log::error!("cannot load service {}: {}", name, e);
                                None
                            }
                        }
                    }
                    None => None,
                };
                found.and_then(|id| {
                    set.service(id).map(|rec| {
                        let mut reply = [0u8; 7];
                        reply[0] = RP_SERVICERECORD;
                        reply[1] = rec.state.code();
                        reply[2..6].copy_from_slice(&id.0.to_le_bytes());
                        reply[6] = rec.desired_state.code();
                        reply
                    })
                })
            };

            match reply {
                Some(reply) => wr.write_all(&reply).await?,
                None => wr.write_all(&[RP_NOSERVICE]).await?,
            }
            Ok(true)
        }

        CP_STARTSERVICE | CP_WAKESERVICE | CP_STOPSERVICE | CP_RELEASESERVICE => {
            let pin = rd.read_u8().await? != 0;
            let handle = rd.read_u32_le().await?;
            let id = ServiceId(handle);

            let wanted = if cmd == CP_STARTSERVICE || cmd == CP_WAKESERVICE {
                ServiceState::Started
            } else {
                ServiceState::Stopped
            };

            let already: Option<bool> = {
                let mut set = set.write().await;
                let current = set
                    .service(id)
                    .map(|rec| (rec.state, rec.desired_state));
                match current {
                    None => None,
                    Some((state, desired)) => {
                        if pin {
                            if wanted == ServiceState::Started {
                                set.pin_started(id);
                            } else {
                                set.pin_stopped(id);
                            }
                        }
                        // Issued even when already in the wanted state:
                        // start/stop also set or clear the explicit
                        // activation.
                        match cmd {
                            CP_STARTSERVICE => set.start(id, true),
                            CP_WAKESERVICE => set.start(id, false),
                            CP_STOPSERVICE => set.stop(id, true),
                            CP_RELEASESERVICE => set.stop(id, false),
                            _ => unreachable!(),
                        }
                        set.process_queues();
                        Some(state == wanted && desired == wanted)
                    }
                }
            };

            let code = match already {
                None => RP_NAK,
                Some(true) => RP_ALREADYSS,
                Some(false) => RP_ACK,
            };
            wr.write_all(&[code]).await?;
            Ok(true)
        }

        CP_UNPINSERVICE => {
            let handle = rd.read_u32_le().await?;
            let mut set = set.write().await;
            set.unpin(ServiceId(handle));
            set.process_queues();
            drop(set);
            wr.write_all(&[RP_ACK]).await?;
            Ok(true)
        }

        CP_UNLOADSERVICE => {
            let handle = rd.read_u32_le().await?;
            let mut set = set.write().await;
            let result = set.unload(ServiceId(handle));
            drop(set);
            match result {
                Ok(()) => wr.write_all(&[RP_ACK]).await?,
                Err(e) => {
                    log::debug!("cannot unload service: {}", e);
                    wr.write_all(&[RP_NAK]).await?;
                }
            }
            Ok(true)
        }

        CP_LISTSERVICES => {
            let entries: Vec<(String, u8, u8)> = {
                let set = set.read().await;
                set.services()
                    .map(|(_, rec)| {
                        (
                            rec.name.clone(),
                            rec.state.code(),
                            rec.desired_state.code(),
                        )
                    })
                    .collect()
            };
            for (name, current, target) in entries {
                let name_bytes = name.as_bytes();
                let name_len = name_bytes.len().min(u8::MAX as usize);
                let mut packet = Vec::with_capacity(8 + name_len);
                packet.extend_from_slice(&[
                    RP_SVCINFO,
                    name_len as u8,
                    current,
                    target,
                    0,
                    0,
                    0,
                    0,
                ]);
                packet.extend_from_slice(&name_bytes[..name_len]);
                wr.write_all(&packet).await?;
            }
            wr.write_all(&[RP_LISTDONE]).await?;
            Ok(true)
        }

        CP_SHUTDOWN => {
            let kind = rd.read_u8().await?;
            let Some(kind) = ShutdownType::from_code(kind) else {
                wr.write_all(&[RP_BADREQ]).await?;
                return Ok(false);
            };
            wr.write_all(&[RP_ACK]).await?;
            let _ = shutdown.send(kind).await;
            Ok(true)
        }

        _ => {
            wr.write_all(&[RP_BADREQ]).await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LoopHandle;
    use crate::services::{ServiceConfig, ServiceType};

    async fn start_test_server() -> (UnixStream, SharedSet) {
        let (handle, _rx) = LoopHandle::new();
        let mut svc_set = ServiceSet::new(handle);
        svc_set
            .add_service(ServiceConfig::new("alpha", ServiceType::Internal))
            .unwrap();
        let set: SharedSet = Arc::new(RwLock::new(svc_set));

        let (client, server) = UnixStream::pair().unwrap();
        let dirs = Arc::new(ServiceDirs::from_dir("/nonexistent"));
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let set_clone = Arc::clone(&set);
        tokio::spawn(async move {
            handle_connection(server, set_clone, dirs, shutdown_tx).await;
        });
        (client, set)
    }

    #[tokio::test]
    async fn version_handshake() {
        let (mut client, _set) = start_test_server().await;
        client.write_all(&[CP_QUERYVERSION]).await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], RP_CPVERSION);
        assert_eq!(u16::from_le_bytes([reply[1], reply[2]]), MIN_CP_VERSION);
        assert_eq!(u16::from_le_bytes([reply[3], reply[4]]), MAX_CP_VERSION);
    }

    #[tokio::test]
    async fn find_and_start_service() {
        let (mut client, set) = start_test_server().await;

        // FINDSERVICE alpha
        let name = b"alpha";
        let mut request = vec![CP_FINDSERVICE];
        request.extend_from_slice(&(name.len() as u16).to_le_bytes());
        request.extend_from_slice(name);
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], RP_SERVICERECORD);
        assert_eq!(reply[1], ServiceState::Stopped.code());
        let handle = u32::from_le_bytes([reply[2], reply[3], reply[4], reply[5]]);

        // STARTSERVICE on the returned handle
        let mut request = vec![CP_STARTSERVICE, 0];
        request.extend_from_slice(&handle.to_le_bytes());
        client.write_all(&request).await.unwrap();

        let mut code = [0u8; 1];
        client.read_exact(&mut code).await.unwrap();
        assert_eq!(code[0], RP_ACK);

        // An internal service starts synchronously; a STARTED event follows.
        let mut event = [0u8; SERVICEEVENT_LEN as usize];
        client.read_exact(&mut event).await.unwrap();
        assert_eq!(event[0], IP_SERVICEEVENT);
        assert_eq!(event[1], SERVICEEVENT_LEN);
        assert_eq!(
            u32::from_le_bytes([event[2], event[3], event[4], event[5]]),
            handle
        );
        assert_eq!(
            crate::services::ServiceEvent::from_code(event[6]),
            Some(crate::services::ServiceEvent::Started)
        );

        let set = set.read().await;
        let rec = set.service(ServiceId(handle)).unwrap();
        assert_eq!(rec.state, ServiceState::Started);
        assert_eq!(rec.required_by, 1);
    }

    #[tokio::test]
    async fn unknown_service_yields_noservice() {
        let (mut client, _set) = start_test_server().await;
        let name = b"ghost";
        let mut request = vec![CP_FINDSERVICE];
        request.extend_from_slice(&(name.len() as u16).to_le_bytes());
        request.extend_from_slice(name);
        client.write_all(&request).await.unwrap();

        let mut code = [0u8; 1];
        client.read_exact(&mut code).await.unwrap();
        assert_eq!(code[0], RP_NOSERVICE);
    }

    #[tokio::test]
    async fn list_services() {
        let (mut client, _set) = start_test_server().await;
        client.write_all(&[CP_LISTSERVICES]).await.unwrap();

        let mut header = [0u8; 8];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], RP_SVCINFO);
        let name_len = header[1] as usize;
        let mut name = vec![0u8; name_len];
        client.read_exact(&mut name).await.unwrap();
        assert_eq!(name, b"alpha");

        let mut done = [0u8; 1];
        client.read_exact(&mut done).await.unwrap();
        assert_eq!(done[0], RP_LISTDONE);
    }

    #[tokio::test]
    async fn bad_request_closes_connection() {
        let (mut client, _set) = start_test_server().await;
        client.write_all(&[250]).await.unwrap();
        let mut code = [0u8; 1];
        client.read_exact(&mut code).await.unwrap();
        assert_eq!(code[0], RP_BADREQ);
        // Connection then closes.
        let n = client.read(&mut code).await.unwrap();
        assert_eq!(n, 0);
    }
}
