//! servd - Runlevel-based init and service supervisor
//!
//! A process #1 that:
//! - Brings the machine up through a sequence of runlevels
//! - Launches and monitors long-running daemons and one-shot tasks
//! - Gates services on tri-state conditions kept under a tmpfs directory
//! - Reaps orphaned children and respawns crashed daemons with backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                     servd                        │
//! ├──────────────────────────────────────────────────┤
//! │  Stanza Parser │  Supervisor  │  Control Socket  │
//! ├──────────────────────────────────────────────────┤
//! │  Condition Store │ Timers │ Launcher │ Reaper    │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! The supervisor is single-threaded: one owned [`supervisor::Supervisor`]
//! value is driven by an event loop that converts signals, timer fires and
//! control requests into synchronous step requests.

pub mod cond;
pub mod conf;
pub mod console;
pub mod hooks;
pub mod pid1;
pub mod protocol;
pub mod runlevel;
pub mod supervisor;
pub mod svc;
pub mod tty;

pub use svc::{BlockReason, Svc, SvcId, SvcKind, SvcState};
