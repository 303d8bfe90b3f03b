//! Worker subprocesses and the parent-side handles that drive them.
//!
//! Each registered name is backed by its own OS process running
//! `isofork worker <NAME> <PATH>`. The parent talks to it over a pair of
//! pipes carrying newline-delimited JSON.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │      Parent Process      │
//!                  │  Registry ─► WorkerHandle│
//!                  └─────┬──────────────▲─────┘
//!              stdin     │              │  stdout
//!          {id,params}   │              │  {id,result|error}
//!                  ┌─────▼──────────────┴─────┐
//!                  │      Worker Process      │
//!                  │  LoadedModule ─► Handler │
//!                  └──────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: a crashing handler takes down only its worker
//! - **Correlated concurrency**: requests carry ids and complete in any order
//! - **Per-request timeouts**: late replies are dropped without side effects
//! - **Crash propagation**: worker death rejects every pending request

mod handle;
mod ipc;
mod pending;
mod protocol;
mod signals;
mod spawn;
pub mod worker_main;

pub use handle::{StopHook, WorkerHandle, WorkerState};
pub use pending::MAX_REQUEST_ID;
pub use protocol::{READY_METHOD, Request, Response};
pub use signals::TerminationReason;
pub use spawn::DEBUG_PORT_ENV;
pub use worker_main::{run_worker, run_worker_main, serve};
