//! dinit - service supervisor and init daemon
//!
//! Loads service descriptions, starts and stops child processes, and
//! propagates start/stop intents through a graph of hard and soft
//! dependencies. Runs either as PID 1 or as an ordinary user session
//! manager, controlled over a unix socket by `dinitctl`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                        dinit                         │
//! ├────────────┬─────────────────────────┬───────────────┤
//! │   Loader   │  Service graph engine   │ Control socket│
//! ├────────────┴─────────────────────────┴───────────────┤
//! │        Process supervisor (fork/exec, reaping)       │
//! ├──────────────────────────────────────────────────────┤
//! │        Event loop (timers, pipes, child status)      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The engine itself is single-threaded and synchronous; asynchronous
//! completions re-enter it as typed events through the event loop facade.

pub mod control;
pub mod event;
pub mod loader;
pub mod pid1;
pub mod protocol;
pub mod services;
pub mod supervise;

pub use services::{ServiceId, ServiceSet};
