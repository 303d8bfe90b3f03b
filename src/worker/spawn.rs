//! Worker subprocess spawning.
//!
//! Workers are launched as `<program> [args..] <NAME> <PATH> [--debug-port N]`
//! with piped stdin/stdout carrying the protocol and stderr inherited so worker
//! logs land next to the parent's.

use crate::config::RegistryConfig;
use crate::error::{ForkError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Environment variable carrying the debug port into the worker.
pub const DEBUG_PORT_ENV: &str = "ISOFORK_DEBUG_PORT";

/// A freshly spawned worker with its protocol pipes split off.
pub struct Spawned {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Build the launch command for a worker.
pub fn worker_command(
    registry: &RegistryConfig,
    name: &str,
    target_path: &Path,
    debug_port: Option<u16>,
) -> Command {
    let mut cmd = Command::new(&registry.worker_program);
    cmd.args(&registry.worker_args);
    cmd.arg(name);
    cmd.arg(target_path);

    if let Some(port) = debug_port {
        cmd.arg("--debug-port");
        cmd.arg(port.to_string());
        cmd.env(DEBUG_PORT_ENV, port.to_string());
    }

    // Set up IPC pipes
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    // Last line of defence if the owning handle is dropped without stopping.
    cmd.kill_on_drop(true);
    cmd
}

/// Spawn a worker subprocess.
pub fn spawn_worker(
    registry: &RegistryConfig,
    name: &str,
    target_path: &Path,
    debug_port: Option<u16>,
) -> Result<Spawned> {
    let mut child = worker_command(registry, name, target_path, debug_port)
        .spawn()
        .map_err(|e| {
            ForkError::Spawn(format!(
                "{}: {}",
                registry.worker_program.display(),
                e
            ))
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ForkError::Spawn("Child stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ForkError::Spawn("Child stdout not captured".into()))?;

    Ok(Spawned {
        child,
        stdin,
        stdout,
    })
}
