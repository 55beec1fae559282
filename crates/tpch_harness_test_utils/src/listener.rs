//! Fake server endpoint for readiness tests.

use anyhow::{Context, Result};
use std::net::TcpListener as StdListener;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

/// A localhost port that refuses connections until `delay` has passed,
/// then accepts (and immediately drops) every connection.
pub struct DelayedListener {
    port: u16,
    task: JoinHandle<()>,
}

impl DelayedListener {
    /// Reserve a free port and start accepting on it after `delay`.
    pub async fn start(delay: Duration) -> Result<Self> {
        // Bind to learn a free port, then release it until the delay expires.
        let port = {
            let probe = StdListener::bind("127.0.0.1:0").context("Failed to reserve a port")?;
            probe.local_addr()?.port()
        };

        let task = tokio::spawn(async move {
            sleep(delay).await;
            let listener = match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    debug!("DelayedListener could not bind {}: {}", port, e);
                    return;
                }
            };
            debug!("DelayedListener accepting on {}", port);
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        Ok(Self { port, task })
    }

    /// The port the listener will accept on.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for DelayedListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A port nothing is listening on.
pub fn closed_port() -> Result<u16> {
    let probe = StdListener::bind("127.0.0.1:0").context("Failed to reserve a port")?;
    Ok(probe.local_addr()?.port())
}
