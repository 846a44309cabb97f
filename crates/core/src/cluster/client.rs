use crate::error::{DistError, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

/// Connection to a running scheduler
#[derive(Debug)]
pub struct SchedulerClient {
    address: String,
    stream: TcpStream,
}

impl SchedulerClient {
    /// Connect to `address`, retrying until `timeout` elapses.
    ///
    /// The scheduler may still be starting, so refused connections are retried
    /// every `retry_interval`. Running out of time is a connection error.
    pub async fn connect(address: &str, timeout: Duration, retry_interval: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let last_error = match tokio::time::timeout(remaining, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    tracing::info!("Connected to scheduler {} after {} attempt(s)", address, attempts);
                    return Ok(Self {
                        address: address.to_string(),
                        stream,
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "connect timed out".to_string(),
            };

            if Instant::now() + retry_interval >= deadline {
                return Err(DistError::connection(
                    address,
                    format!(
                        "scheduler unreachable after {} attempt(s) in {:.1}s: {}",
                        attempts,
                        timeout.as_secs_f64(),
                        last_error
                    ),
                ));
            }
            sleep(retry_interval).await;
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Close the connection
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Closing scheduler connection {}: {}", self.address, e);
        }
    }
}
