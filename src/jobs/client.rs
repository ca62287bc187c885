//! Blocking client side of the daemon protocol.

use crate::error::{PipemeshError, Result};
use crate::jobs::protocol::{read_frame, write_frame, JobReply, JobRequest};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

/// Sends one request to the daemon at `host:port` and waits for its reply.
#[cfg_attr(test, mockall::automock)]
pub trait JobTransport {
    fn exchange(&self, host: &str, port: u16, request: &JobRequest) -> Result<JobReply>;
}

/// TCP transport with a per-request deadline.
///
/// Owns a small current-thread runtime, so it must not be used from inside
/// another tokio runtime.
pub struct TcpTransport {
    runtime: Runtime,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        Ok(Self { runtime, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

async fn round_trip(host: &str, port: u16, request: &JobRequest) -> Result<JobReply> {
    let mut stream = TcpStream::connect((host, port)).await?;
    write_frame(&mut stream, request).await?;
    read_frame(&mut stream).await
}

impl JobTransport for TcpTransport {
    fn exchange(&self, host: &str, port: u16, request: &JobRequest) -> Result<JobReply> {
        let result = self.runtime.block_on(async {
            tokio::time::timeout(self.timeout, round_trip(host, port, request)).await
        });
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(PipemeshError::Remote(format!("{}:{}: {}", host, port, e))),
            Err(_) => Err(PipemeshError::Remote(format!(
                "{}:{}: no reply within {} ms",
                host,
                port,
                self.timeout.as_millis()
            ))),
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}
