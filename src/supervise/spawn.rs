//! Child process launch: fork/exec with a status-report pipe.
//!
//! In general fork/exec success cannot be observed directly, so a
//! close-on-exec pipe is used: a successful exec closes the pipe and the
//! parent sees EOF; on failure the child writes the errno to the pipe before
//! exiting. The parent never blocks on the pipe; it is watched through the
//! event loop.
//!
//! Everything on the child side of the fork is restricted to
//! async-signal-safe operations: raw fd juggling, prebuilt environment
//! buffers and `execvp`. All allocation happens before the fork.

use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, pipe2, ForkResult, Pid};

use crate::event::LoopHandle;
use crate::services::ServiceId;

/// Everything needed to launch one service process.
pub struct SpawnParams {
    pub args: Vec<String>,
    pub logfile: Option<PathBuf>,
    pub on_console: bool,
    /// Activation socket to install as fd 3 in the child.
    pub socket_fd: Option<RawFd>,
    /// Create a control socketpair and pass one end via `DINIT_CS_FD`.
    pub pass_cs_fd: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no command configured")]
    NoCommand,
    #[error("bad command argument: {0}")]
    BadArgument(String),
    #[error("can't create status check pipe: {0}")]
    Pipe(nix::errno::Errno),
    #[error("can't create control socket: {0}")]
    SocketPair(nix::errno::Errno),
    #[error("could not fork: {0}")]
    Fork(nix::errno::Errno),
}

/// Fork and exec a service process. On success the child's pid is returned,
/// the exec status pipe is registered with the event loop (reporting to
/// `service`), and, when requested, the daemon side of the control
/// socketpair has been handed to the loop. On failure every acquired
/// descriptor has been closed and no watch is left registered.
pub fn spawn_process(
    service: ServiceId,
    params: &SpawnParams,
    loop_handle: &LoopHandle,
) -> Result<Pid, SpawnError> {
    if params.args.is_empty() {
        return Err(SpawnError::NoCommand);
    }
    let argv: Vec<CString> = params
        .args
        .iter()
        .map(|a| CString::new(a.as_bytes()).map_err(|_| SpawnError::BadArgument(a.clone())))
        .collect::<Result<_, _>>()?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let logfile = cstring_path(params.logfile.as_deref().unwrap_or(Path::new("/dev/null")))?;

    let (pipe_r, pipe_w) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;

    // Control socketpair: the daemon side is close-on-exec and non-blocking,
    // the child side is inherited across the exec.
    let cs_pair: Option<(OwnedFd, OwnedFd)> = if params.pass_cs_fd {
        let (ours, theirs) =
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(SpawnError::SocketPair)?;
        unsafe {
            libc::fcntl(ours.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(ours.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK);
        }
        Some((ours, theirs))
    } else {
        None
    };

    // Environment buffers are filled in (pid, fd number) by the child, which
    // must not allocate.
    let mut listen_fds_buf = *b"LISTEN_FDS=1\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
    let mut listen_pid_buf = *b"LISTEN_PID=\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
    let mut cs_fd_buf = *b"DINIT_CS_FD=\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

    match unsafe { fork() } {
        Err(e) => Err(SpawnError::Fork(e)),
        Ok(ForkResult::Child) => {
            let cs_fd = cs_pair.as_ref().map(|(_, theirs)| theirs.as_raw_fd());
            run_child_proc(ChildParams {
                argv: &argv_ptrs,
                logfile: &logfile,
                on_console: params.on_console,
                wpipe: pipe_w.into_raw_fd(),
                socket_fd: params.socket_fd,
                cs_fd,
                listen_fds_buf: &mut listen_fds_buf,
                listen_pid_buf: &mut listen_pid_buf,
                cs_fd_buf: &mut cs_fd_buf,
            })
        }
        Ok(ForkResult::Parent { child }) => {
            // Close the child's ends; register the status watch.
            drop(pipe_w);
            if let Some((ours, theirs)) = cs_pair {
                drop(theirs);
                loop_handle.pass_control_conn(ours);
            }
            loop_handle.watch_exec_pipe(service, pipe_r);
            Ok(child)
        }
    }
}

fn cstring_path(path: &Path) -> Result<CString, SpawnError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SpawnError::BadArgument(OsString::from(path).to_string_lossy().into_owned()))
}

struct ChildParams<'a> {
    argv: &'a [*const libc::c_char],
    logfile: &'a CString,
    on_console: bool,
    wpipe: RawFd,
    socket_fd: Option<RawFd>,
    cs_fd: Option<RawFd>,
    listen_fds_buf: &'a mut [u8; 32],
    listen_pid_buf: &'a mut [u8; 32],
    cs_fd_buf: &'a mut [u8; 32],
}

/// Post-fork setup and exec. Never returns; on any failure the errno is
/// written to the status pipe and the child exits.
fn run_child_proc(params: ChildParams<'_>) -> ! {
    unsafe {
        // Block signals while rearranging descriptors; dup can be
        // interrupted otherwise.
        let mut all_signals: libc::sigset_t = std::mem::zeroed();
        let mut saved_mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all_signals);
        libc::sigprocmask(libc::SIG_SETMASK, &all_signals, &mut saved_mask);

        let min_fd: RawFd = if params.socket_fd.is_some() { 4 } else { 3 };

        // Relocate the status pipe and control fd out of the low range that
        // the activation socket and stdio will occupy.
        let mut wpipe = params.wpipe;
        if wpipe < min_fd {
            wpipe = libc::fcntl(wpipe, libc::F_DUPFD_CLOEXEC, min_fd);
            if wpipe < 0 {
                child_fail(params.wpipe);
            }
        }

        let mut cs_fd = params.cs_fd.unwrap_or(-1);
        if cs_fd != -1 && cs_fd < min_fd {
            cs_fd = libc::fcntl(cs_fd, libc::F_DUPFD, min_fd);
            if cs_fd < 0 {
                child_fail(wpipe);
            }
        }

        if let Some(socket_fd) = params.socket_fd {
            if libc::dup2(socket_fd, 3) == -1 {
                child_fail(wpipe);
            }
            if socket_fd != 3 {
                libc::close(socket_fd);
            }
            if libc::putenv(params.listen_fds_buf.as_mut_ptr() as *mut libc::c_char) != 0 {
                child_fail(wpipe);
            }
            let pid = libc::getpid();
            write_decimal(&mut params.listen_pid_buf[11..], pid as u64);
            if libc::putenv(params.listen_pid_buf.as_mut_ptr() as *mut libc::c_char) != 0 {
                child_fail(wpipe);
            }
        }

        if cs_fd != -1 {
            write_decimal(&mut params.cs_fd_buf[12..], cs_fd as u64);
            if libc::putenv(params.cs_fd_buf.as_mut_ptr() as *mut libc::c_char) != 0 {
                child_fail(wpipe);
            }
        }

        if !params.on_console {
            libc::close(0);
            libc::close(1);
            libc::close(2);
            if libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) != 0 {
                child_fail(wpipe);
            }
            if libc::open(
                params.logfile.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            ) != 1
            {
                child_fail(wpipe);
            }
            if libc::dup2(1, 2) != 2 {
                child_fail(wpipe);
            }
            // A fresh session (with its own process group) lets us signal
            // the whole group and lets the child claim a terminal later if
            // it wants one.
            libc::setsid();
        } else {
            // Run as a foreground job on the terminal. If the terminal
            // already has a session leader, it is us; in that case stay in
            // the parent session, since a new session could not claim the
            // terminal anyway.
            let claim_terminal = libc::tcgetsid(0) == -1;
            if claim_terminal {
                libc::signal(libc::SIGTSTP, libc::SIG_IGN);
                libc::setsid();
                libc::ioctl(0, libc::TIOCSCTTY, 0);
            }
            libc::setpgid(0, 0);
            libc::tcsetpgrp(0, libc::getpgrp());
        }

        // The daemon ignores SIGPIPE; children should get the default.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        libc::sigprocmask(libc::SIG_SETMASK, &saved_mask, std::ptr::null_mut());

        libc::execvp(params.argv[0], params.argv.as_ptr());
        child_fail(wpipe);
    }
}

/// Report the current errno through the status pipe and exit.
unsafe fn child_fail(wpipe: RawFd) -> ! {
    let err = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    let bytes = err.to_le_bytes();
    libc::write(wpipe, bytes.as_ptr() as *const libc::c_void, bytes.len());
    libc::_exit(0);
}

/// Format `value` in decimal into `buf` (which must already end with enough
/// NUL bytes). No allocation; usable after fork.
fn write_decimal(buf: &mut [u8], value: u64) -> usize {
    let mut digits = [0u8; 20];
    let mut n = 0;
    let mut v = value;
    loop {
        digits[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
        if v == 0 {
            break;
        }
    }
    for i in 0..n {
        buf[i] = digits[n - 1 - i];
    }
    buf[n] = 0;
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_formatting() {
        let mut buf = [0u8; 24];
        assert_eq!(write_decimal(&mut buf, 0), 1);
        assert_eq!(&buf[..2], b"0\0");
        assert_eq!(write_decimal(&mut buf, 1), 1);
        assert_eq!(&buf[..2], b"1\0");
        assert_eq!(write_decimal(&mut buf, 65534), 5);
        assert_eq!(&buf[..6], b"65534\0");
    }

    #[test]
    fn env_buffer_fill() {
        let mut buf = *b"LISTEN_PID=\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
        write_decimal(&mut buf[11..], 12345);
        let s = std::ffi::CStr::from_bytes_until_nul(&buf).unwrap();
        assert_eq!(s.to_str().unwrap(), "LISTEN_PID=12345");
    }
}
