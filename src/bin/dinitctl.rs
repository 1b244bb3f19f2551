//! dinitctl - control utility for dinit
//!
//! Communicates with the daemon over its control socket (`/dev/dinitctl`,
//! or `$HOME/.dinitctl` for a user daemon): starting, stopping, pinning,
//! loading and unloading services, and requesting shutdown.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use clap::{Parser, Subcommand};

use dinit::protocol::*;
use dinit::services::{ServiceEvent, ServiceState};

#[derive(Parser)]
#[command(name = "dinitctl")]
#[command(about = "Control the dinit service supervisor")]
struct Args {
    /// Control the system daemon instead of the user daemon
    #[arg(long, short = 's', global = true)]
    system: bool,

    /// Suppress output (except errors)
    #[arg(long, global = true)]
    quiet: bool,

    /// Don't wait for service startup/shutdown to complete
    #[arg(long, global = true)]
    no_wait: bool,

    /// Pin the service in the requested state
    #[arg(long, global = true)]
    pin: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start and activate a service
    Start { name: String },
    /// Start a service without marking it explicitly activated
    Wake { name: String },
    /// Stop a service and cancel its explicit activation
    Stop { name: String },
    /// Release an explicit activation; the service stops when unrequired
    Release { name: String },
    /// Remove a started/stopped pin
    Unpin { name: String },
    /// Unload a stopped service
    Unload { name: String },
    /// List loaded services
    List,
    /// Stop all services and shut the daemon down
    Shutdown {
        /// halt, poweroff or reboot
        #[arg(default_value = "halt")]
        kind: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum ClientError {
    #[error("cannot connect to control socket: {0}")]
    Connect(std::io::Error),
    #[error("control socket read/write failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error")]
    Protocol,
    #[error("too old (server reports newer protocol version)")]
    ClientTooOld,
    #[error("server too old or protocol error")]
    ServerTooOld,
    #[error("failed to find/load service")]
    NoService,
    #[error("{0}")]
    Failed(String),
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("dinitctl: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), ClientError> {
    let path = socket_path(args.system).ok_or_else(|| {
        ClientError::Failed("cannot locate control socket (set HOME or check passwd)".into())
    })?;
    let mut conn = UnixStream::connect(&path).map_err(ClientError::Connect)?;

    check_protocol_version(&mut conn)?;

    match args.command {
        Command::Start { name } => start_stop(
            &mut conn,
            &name,
            CP_STARTSERVICE,
            false,
            args.pin,
            args.no_wait,
            args.quiet,
        ),
        Command::Wake { name } => start_stop(
            &mut conn,
            &name,
            CP_WAKESERVICE,
            false,
            args.pin,
            args.no_wait,
            args.quiet,
        ),
        Command::Stop { name } => start_stop(
            &mut conn,
            &name,
            CP_STOPSERVICE,
            true,
            args.pin,
            args.no_wait,
            args.quiet,
        ),
        Command::Release { name } => start_stop(
            &mut conn,
            &name,
            CP_RELEASESERVICE,
            true,
            args.pin,
            args.no_wait,
            args.quiet,
        ),
        Command::Unpin { name } => unpin(&mut conn, &name, args.quiet),
        Command::Unload { name } => unload(&mut conn, &name, args.quiet),
        Command::List => list(&mut conn),
        Command::Shutdown { kind } => shutdown(&mut conn, &kind),
    }
}

fn read_u8(conn: &mut UnixStream) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    conn.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Read the next reply code, skipping over any interleaved information
/// packets (which carry their length in the second byte).
fn wait_for_reply(conn: &mut UnixStream) -> Result<u8, ClientError> {
    loop {
        let code = read_u8(conn)?;
        if code < 100 {
            return Ok(code);
        }
        let len = read_u8(conn)? as usize;
        let mut rest = vec![0u8; len.saturating_sub(2)];
        conn.read_exact(&mut rest)?;
    }
}

/// Read the next information packet (code, body).
fn read_info_packet(conn: &mut UnixStream) -> Result<(u8, Vec<u8>), ClientError> {
    let code = read_u8(conn)?;
    if code < 100 {
        return Err(ClientError::Protocol);
    }
    let len = read_u8(conn)? as usize;
    let mut body = vec![0u8; len.saturating_sub(2)];
    conn.read_exact(&mut body)?;
    Ok((code, body))
}

fn check_protocol_version(conn: &mut UnixStream) -> Result<(), ClientError> {
    conn.write_all(&[CP_QUERYVERSION])?;
    if wait_for_reply(conn)? != RP_CPVERSION {
        return Err(ClientError::ServerTooOld);
    }
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf)?;
    let server_min = u16::from_le_bytes([buf[0], buf[1]]);
    let server_max = u16::from_le_bytes([buf[2], buf[3]]);
    if MAX_CP_VERSION < server_min {
        return Err(ClientError::ClientTooOld);
    }
    if server_max < MIN_CP_VERSION {
        return Err(ClientError::ServerTooOld);
    }
    Ok(())
}

/// Issue LOADSERVICE (or FINDSERVICE) and parse the reply.
fn load_service(
    conn: &mut UnixStream,
    name: &str,
    find_only: bool,
) -> Result<(Handle, ServiceState), ClientError> {
    let name_bytes = name.as_bytes();
    let mut packet = vec![if find_only { CP_FINDSERVICE } else { CP_LOADSERVICE }];
    packet.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    packet.extend_from_slice(name_bytes);
    conn.write_all(&packet)?;

    match wait_for_reply(conn)? {
        RP_SERVICERECORD => {
            let mut buf = [0u8; 6];
            conn.read_exact(&mut buf)?;
            let state = ServiceState::from_code(buf[0]).ok_or(ClientError::Protocol)?;
            let handle = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
            // buf[5] is the target state; unused here.
            Ok((handle, state))
        }
        RP_NOSERVICE => Err(ClientError::NoService),
        _ => Err(ClientError::Protocol),
    }
}

fn describe_state(stopped: bool) -> &'static str {
    if stopped {
        "stopped"
    } else {
        "started"
    }
}

fn start_stop(
    conn: &mut UnixStream,
    name: &str,
    command: u8,
    do_stop: bool,
    pin: bool,
    no_wait: bool,
    quiet: bool,
) -> Result<(), ClientError> {
    let (handle, state) = load_service(conn, name, false)?;

    // Issued regardless of current state: start/stop also set or clear the
    // explicit activation flag.
    let mut packet = vec![command, u8::from(pin)];
    packet.extend_from_slice(&handle.to_le_bytes());
    conn.write_all(&packet)?;

    match wait_for_reply(conn)? {
        RP_ALREADYSS => {
            let wanted = if do_stop {
                ServiceState::Stopped
            } else {
                ServiceState::Started
            };
            if !quiet {
                println!(
                    "Service {}{}.",
                    if state == wanted { "(already) " } else { "" },
                    describe_state(do_stop)
                );
            }
            return Ok(());
        }
        RP_ACK => {}
        _ => return Err(ClientError::Protocol),
    }

    if no_wait {
        if !quiet {
            println!(
                "Issued {} command successfully.",
                if do_stop { "stop" } else { "start" }
            );
        }
        return Ok(());
    }

    let completion = if do_stop {
        ServiceEvent::Stopped
    } else {
        ServiceEvent::Started
    };
    let cancelled = if do_stop {
        ServiceEvent::StopCancelled
    } else {
        ServiceEvent::StartCancelled
    };

    loop {
        let (code, body) = read_info_packet(conn)?;
        if code != IP_SERVICEEVENT || body.len() < 5 {
            continue;
        }
        let ev_handle = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        if ev_handle != handle {
            continue;
        }
        match ServiceEvent::from_code(body[4]) {
            Some(event) if event == completion => {
                if !quiet {
                    println!("Service {}.", describe_state(do_stop));
                }
                return Ok(());
            }
            Some(event) if event == cancelled => {
                return Err(ClientError::Failed(format!(
                    "service {} cancelled",
                    if do_stop { "stop" } else { "start" }
                )));
            }
            Some(ServiceEvent::FailedStart) if !do_stop => {
                return Err(ClientError::Failed("service failed to start".into()));
            }
            _ => {}
        }
    }
}

fn unpin(conn: &mut UnixStream, name: &str, quiet: bool) -> Result<(), ClientError> {
    let (handle, _state) = load_service(conn, name, false)?;
    let mut packet = vec![CP_UNPINSERVICE];
    packet.extend_from_slice(&handle.to_le_bytes());
    conn.write_all(&packet)?;
    if wait_for_reply(conn)? != RP_ACK {
        return Err(ClientError::Protocol);
    }
    if !quiet {
        println!("Service unpinned.");
    }
    Ok(())
}

fn unload(conn: &mut UnixStream, name: &str, quiet: bool) -> Result<(), ClientError> {
    let (handle, _state) = load_service(conn, name, true)?;
    let mut packet = vec![CP_UNLOADSERVICE];
    packet.extend_from_slice(&handle.to_le_bytes());
    conn.write_all(&packet)?;
    match wait_for_reply(conn)? {
        RP_ACK => {
            if !quiet {
                println!("Service unloaded.");
            }
            Ok(())
        }
        RP_NAK => Err(ClientError::Failed(
            "could not unload service; service not stopped, or is a dependency of another service"
                .into(),
        )),
        _ => Err(ClientError::Protocol),
    }
}

fn list(conn: &mut UnixStream) -> Result<(), ClientError> {
    conn.write_all(&[CP_LISTSERVICES])?;
    loop {
        match wait_for_reply(conn)? {
            RP_SVCINFO => {
                let mut header = [0u8; 7];
                conn.read_exact(&mut header)?;
                let name_len = header[0] as usize;
                let current = ServiceState::from_code(header[1]).ok_or(ClientError::Protocol)?;
                let target = ServiceState::from_code(header[2]).ok_or(ClientError::Protocol)?;
                let mut name = vec![0u8; name_len];
                conn.read_exact(&mut name)?;
                let name = String::from_utf8_lossy(&name).into_owned();

                let mut marks = String::new();
                marks.push(if target == ServiceState::Started { '{' } else { ' ' });
                marks.push(if current == ServiceState::Started { '+' } else { ' ' });
                marks.push(if target == ServiceState::Started { '}' } else { ' ' });
                marks.push_str(match current {
                    ServiceState::Starting => "<<",
                    ServiceState::Stopping => ">>",
                    _ => "  ",
                });
                marks.push(if target == ServiceState::Stopped { '{' } else { ' ' });
                marks.push(if current == ServiceState::Stopped { '-' } else { ' ' });
                marks.push(if target == ServiceState::Stopped { '}' } else { ' ' });
                println!("[{}] {}", marks, name);
            }
            RP_LISTDONE => return Ok(()),
            _ => return Err(ClientError::Protocol),
        }
    }
}

fn shutdown(conn: &mut UnixStream, kind: &str) -> Result<(), ClientError> {
    let kind = match kind {
        "halt" => ShutdownType::Halt,
        "poweroff" => ShutdownType::Poweroff,
        "reboot" => ShutdownType::Reboot,
        _ => {
            return Err(ClientError::Failed(
                "shutdown kind must be halt, poweroff or reboot".into(),
            ))
        }
    };
    conn.write_all(&[CP_SHUTDOWN, kind.code()])?;
    if wait_for_reply(conn)? != RP_ACK {
        return Err(ClientError::Protocol);
    }

    // Wait for rollback to complete. The daemon may exit before we get a
    // full read; assume an orderly shutdown in that case.
    loop {
        match read_info_packet(conn) {
            Ok((IP_ROLLBACK_COMPLETED, _)) => return Ok(()),
            Ok(_) => {}
            Err(_) => return Ok(()),
        }
    }
}
