//! Event loop facade.
//!
//! The service engine itself is synchronous; everything asynchronous (child
//! exits, exec status pipes, restart timers) is funnelled through a single
//! typed event channel and handled on one thread. Components register
//! interest through a [`LoopHandle`]; the daemon's main loop drains the
//! receiver and feeds each event to the service set, which pumps its work
//! queues afterwards.
//!
//! Child exits are signalled (via `notify_child_status`) before other work is
//! processed, so the supervisor always learns of a process death before
//! anything that might signal a recycled pid.

use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::services::ServiceId;

/// An asynchronous occurrence delivered to the main loop.
#[derive(Debug)]
pub enum Event {
    /// One or more child processes may have changed state (SIGCHLD was
    /// delivered, or a poll was requested). The supervisor reaps with
    /// `waitpid(..., WNOHANG)`.
    ChildStatus,
    /// The exec status pipe for a service resolved. `failure` carries the
    /// `errno` reported by the child if exec failed; `None` means the pipe
    /// saw EOF, i.e. the exec succeeded.
    ExecStatus {
        service: ServiceId,
        failure: Option<i32>,
    },
    /// The restart delay timer for a service expired.
    RestartTimer { service: ServiceId },
    /// The daemon side of a `pass-cs-fd` socketpair; to be served as an
    /// ordinary control connection.
    ControlConn { fd: OwnedFd },
}

/// Handle through which the service engine reaches the event loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl LoopHandle {
    /// Create a handle and the receiver the main loop drains.
    pub fn new() -> (LoopHandle, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopHandle { tx }, rx)
    }

    /// Monotonic time, used for restart interval accounting.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Request a child status sweep.
    pub fn notify_child_status(&self) {
        let _ = self.tx.send(Event::ChildStatus);
    }

    /// Watch the read end of an exec status pipe. Delivers a single
    /// [`Event::ExecStatus`] when the child execs (EOF) or reports failure
    /// (an errno value written to the pipe).
    pub fn watch_exec_pipe(&self, service: ServiceId, fd: OwnedFd) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let failure = read_exec_status(fd).await;
            let _ = tx.send(Event::ExecStatus { service, failure });
        });
    }

    /// Arm a one-shot restart timer. The returned handle can be aborted to
    /// cancel the timer (when a pending start is interrupted).
    pub fn arm_restart_timer(&self, service: ServiceId, delay: Duration) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::RestartTimer { service });
        })
    }

    /// Hand the daemon side of a service control socketpair to the main loop.
    pub fn pass_control_conn(&self, fd: OwnedFd) {
        let _ = self.tx.send(Event::ControlConn { fd });
    }
}

/// Read the exec status from the pipe. Returns `Some(errno)` if the child
/// reported an exec failure, `None` on EOF (exec succeeded).
async fn read_exec_status(fd: OwnedFd) -> Option<i32> {
    if let Err(e) = set_nonblocking(&fd) {
        log::error!("exec status pipe: cannot set non-blocking: {}", e);
        return None;
    }
    let afd = match AsyncFd::new(fd) {
        Ok(afd) => afd,
        Err(e) => {
            log::error!("exec status pipe: cannot register with event loop: {}", e);
            return None;
        }
    };

    let mut buf = [0u8; 4];
    let mut got = 0usize;
    loop {
        let mut guard = match afd.readable().await {
            Ok(g) => g,
            Err(e) => {
                log::error!("exec status pipe: wait failed: {}", e);
                return None;
            }
        };
        let res = guard.try_io(|inner| {
            let n = unsafe {
                libc::read(
                    inner.as_raw_fd(),
                    buf[got..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - got,
                )
            };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        });
        match res {
            Ok(Ok(0)) => {
                // EOF: the close-on-exec pipe was closed by a successful exec
                // (or the child died before writing a full status).
                return if got == buf.len() {
                    Some(i32::from_le_bytes(buf))
                } else {
                    None
                };
            }
            Ok(Ok(n)) => {
                got += n;
                if got == buf.len() {
                    return Some(i32::from_le_bytes(buf));
                }
            }
            Ok(Err(e)) => {
                log::error!("exec status pipe: read failed: {}", e);
                return None;
            }
            Err(_would_block) => continue,
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::write;

    #[tokio::test]
    async fn exec_status_reports_errno() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let (handle, mut rx) = LoopHandle::new();
        handle.watch_exec_pipe(ServiceId(7), r);
        write(&w, &libc::ENOENT.to_le_bytes()).unwrap();
        drop(w);
        match rx.recv().await.unwrap() {
            Event::ExecStatus { service, failure } => {
                assert_eq!(service, ServiceId(7));
                assert_eq!(failure, Some(libc::ENOENT));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn exec_status_eof_means_success() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let (handle, mut rx) = LoopHandle::new();
        handle.watch_exec_pipe(ServiceId(3), r);
        drop(w);
        match rx.recv().await.unwrap() {
            Event::ExecStatus { service, failure } => {
                assert_eq!(service, ServiceId(3));
                assert_eq!(failure, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn restart_timer_fires() {
        let (handle, mut rx) = LoopHandle::new();
        handle.arm_restart_timer(ServiceId(1), Duration::from_millis(5));
        match rx.recv().await.unwrap() {
            Event::RestartTimer { service } => assert_eq!(service, ServiceId(1)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
