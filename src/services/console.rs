//! Console arbitration.
//!
//! The controlling terminal is an exclusive resource: at most one service
//! holds it at a time. Services that want the console while starting (or for
//! their whole lifetime) wait in a FIFO queue; when the holder releases, the
//! next queued service is offered the console and re-checks whether it still
//! wants to proceed.

use super::state::ServiceState;
use super::{ServiceId, ServiceSet};

impl ServiceSet {
    /// The current console holder, if any.
    pub fn console_holder(&self) -> Option<ServiceId> {
        self.console_holder
    }

    /// Services waiting for the console, in grant order.
    pub fn console_queue_len(&self) -> usize {
        self.console_queue.len()
    }

    /// Request the console. Granted immediately when free, otherwise the
    /// service waits in the queue.
    pub(crate) fn queue_for_console(&mut self, id: ServiceId) {
        if self.console_holder.is_none() && self.console_queue.is_empty() {
            self.console_holder = Some(id);
            self.acquired_console(id);
        } else if !self.console_queue.contains(&id) {
            self.console_queue.push_back(id);
        }
    }

    /// Remove a service that no longer wants the terminal from the queue.
    pub(crate) fn unqueue_console(&mut self, id: ServiceId) {
        self.console_queue.retain(|&queued| queued != id);
    }

    /// Give up the console (or a pending claim on it). When the holder
    /// releases, the terminal is reclaimed for the daemon and the next
    /// queued service is offered the console.
    pub(crate) fn release_console(&mut self, id: ServiceId) {
        if self.console_holder == Some(id) {
            reclaim_terminal();
            self.console_holder = None;
            self.pull_console_queue();
        } else {
            self.unqueue_console(id);
        }
    }

    fn pull_console_queue(&mut self) {
        if let Some(next) = self.console_queue.pop_front() {
            self.console_holder = Some(next);
            self.acquired_console(next);
        }
    }

    /// The console was granted. Proceed with the start if it is still
    /// wanted and dependencies remain satisfied; otherwise pass the console
    /// straight on.
    pub(crate) fn acquired_console(&mut self, id: ServiceId) {
        let state = match self.rec(id) {
            Some(rec) => rec.state,
            None => {
                self.console_holder = None;
                self.pull_console_queue();
                return;
            }
        };
        if state != ServiceState::Starting {
            // We got the console but no longer want it.
            self.release_console(id);
        } else if self.start_check_dependencies(id, false) {
            self.all_deps_started(id, true);
        } else {
            self.release_console(id);
        }
    }
}

/// Return the terminal's foreground process group to the daemon. Only
/// meaningful when stdin is actually a terminal.
fn reclaim_terminal() {
    unsafe {
        if libc::isatty(0) == 1 {
            let _ = libc::tcsetpgrp(0, libc::getpgrp());
        }
    }
}
