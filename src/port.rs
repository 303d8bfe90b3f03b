//! Free local port allocation for worker debug ports.

use crate::error::Result;
use tokio::net::TcpListener;
use tracing::debug;

/// Obtain a currently unused local TCP port.
///
/// Binds an ephemeral listener, reads the port the OS assigned, and closes the
/// listener before returning. Another process may grab the port in between;
/// there is no retry.
pub async fn get_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!(port, "Allocated debug port");
    Ok(port)
}
