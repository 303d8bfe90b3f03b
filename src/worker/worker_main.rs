//! Worker subprocess main entry point.
//!
//! This module runs when `isofork worker <NAME> <PATH>` is invoked. It loads
//! the module at `PATH`, reports the outcome as its bootstrap message, then
//! serves requests from stdin until the parent closes the channel.

use super::ipc::{LineReader, LineWriter};
use super::protocol::{Request, Response};
use crate::module::{HandlerTable, LoadedModule, load_module};
use serde_json::{Value, json};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{Instrument, debug, error, info_span, warn};

/// Describe a handler task that did not return normally.
fn failure_payload(err: JoinError) -> Value {
    if err.is_panic() {
        let panic = err.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        json!({ "message": format!("handler panicked: {}", message) })
    } else {
        json!({ "message": "handler was cancelled" })
    }
}

/// Run one request to completion and build its reply.
///
/// The handler is entered inside its own task, so a panic while producing the
/// future and a panic while polling it are reported the same way as an error
/// the handler returned.
async fn execute(module: &LoadedModule, request: Request) -> Response {
    let Request { id, params, method } = request;
    let module = module.clone();
    let call = tokio::spawn(async move { module.call(params).await });

    match call.await {
        Ok(Ok(result)) => Response::success(id, method, result),
        Ok(Err(error)) => Response::failure(id, method, error),
        Err(err) => Response::failure(id, method, failure_payload(err)),
    }
}

/// Serve the worker protocol over `input`/`output`.
///
/// Returns once `input` reaches EOF and every in-flight request has been
/// answered. Requests run concurrently; replies are written in completion
/// order.
pub async fn serve<R, W>(
    name: &str,
    path: &Path,
    table: &HandlerTable,
    input: R,
    output: W,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = LineReader::new(input);
    let mut writer = LineWriter::new(output);

    let module = match load_module(path, table) {
        Ok(module) => module,
        Err(err) => {
            warn!(error = %err, "Module is not loadable, reporting bootstrap failure");
            writer
                .write_line(&Response::bootstrap_failure(&err).to_line()?)
                .await?;
            // No request handling from here on; wait for the parent to stop us.
            while reader.read_line().await?.is_some() {}
            return Ok(());
        }
    };

    debug!(handler = %module.handler_name, "Module loaded");
    writer
        .write_line(&Response::ready(name, std::process::id()).to_line()?)
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
    let responder = tokio::spawn(
        async move {
            while let Some(response) = rx.recv().await {
                let line = match response.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, id = ?response.id, "Dropping unserializable response");
                        continue;
                    }
                };
                if let Err(e) = writer.write_line(&line).await {
                    warn!(error = %e, "Failed to write response to parent");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    while let Some(line) = reader.read_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match Request::from_line(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };

        let module = module.clone();
        let tx = tx.clone();
        tokio::spawn(
            async move {
                let response = execute(&module, request).await;
                // Receiver is gone only once the parent stopped listening.
                let _ = tx.send(response);
            }
            .in_current_span(),
        );
    }

    debug!("Parent closed the channel, finishing in-flight requests");
    // The responder exits once every request task has dropped its sender.
    drop(tx);
    let _ = responder.await;
    Ok(())
}

/// Serve the worker protocol over this process's stdin/stdout.
pub async fn run_worker(name: &str, path: &Path, table: &HandlerTable) -> io::Result<()> {
    serve(name, path, table, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 when the parent closes the channel, 1 on I/O failure.
pub fn run_worker_main(
    name: &str,
    path: &Path,
    table: &HandlerTable,
    debug_port: Option<u16>,
) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error instead.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let span = info_span!("worker", name = %name, pid = std::process::id(), debug_port = ?debug_port);
    let _guard = span.enter();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create worker runtime");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run_worker(name, path, table).in_current_span()) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "Worker I/O failed");
            std::process::exit(1);
        }
    }
}
