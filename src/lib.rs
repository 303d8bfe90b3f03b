//! isofork - process-isolated function workers.
//!
//! A [`Registry`] maps names to worker processes. Registering a name spawns a
//! worker that loads a module document and exposes one handler; the returned
//! [`Callable`] sends requests across the process boundary and awaits their
//! correlated responses, each with its own timeout.
//!
//! ```no_run
//! use isofork::{Registry, RegistryConfig};
//! use serde_json::json;
//! use std::path::Path;
//!
//! # async fn demo() -> isofork::Result<()> {
//! let registry = Registry::new(RegistryConfig::default());
//! let echo = registry
//!     .register("echo", Path::new("/srv/modules/echo.json"), None)
//!     .await?;
//! let reply = echo.call(vec![json!(123)]).await?;
//! assert_eq!(reply["response"], "ok");
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod config;
pub mod error;
pub mod logging;
pub mod module;
pub mod port;
pub mod registry;
pub mod worker;

pub use config::{DebugMode, RegistryConfig, WorkerConfig};
pub use error::{ErrorKind, ForkError, Result};
pub use module::{Handler, HandlerTable};
pub use port::get_port;
pub use registry::{Callable, Registry};
pub use worker::{TerminationReason, WorkerHandle, WorkerState};
