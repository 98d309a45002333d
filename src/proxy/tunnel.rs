//! Bidirectional byte relay between a client and an upstream proxy
//!
//! Both directions stream concurrently. The relay ends once both directions are
//! done, or once neither has moved a byte for the idle timeout.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Last time either direction moved data
struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Handles tunnel data transfer
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data bidirectionally between two streams
    ///
    /// Each direction shuts down its write side when its read side ends.
    /// Returns `(bytes client->upstream, bytes upstream->client)`.
    #[instrument(skip(client, upstream))]
    pub async fn copy_bidirectional<C, U>(client: C, upstream: U, idle_timeout: Duration) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let activity = Activity::new();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let client_to_upstream = async {
            let result =
                copy_until_idle(&mut client_read, &mut upstream_write, &activity, idle_timeout)
                    .await;
            let _ = upstream_write.shutdown().await;
            result
        };

        let upstream_to_client = async {
            let result =
                copy_until_idle(&mut upstream_read, &mut client_write, &activity, idle_timeout)
                    .await;
            let _ = client_write.shutdown().await;
            result
        };

        let (client_to_upstream_result, upstream_to_client_result) =
            tokio::join!(client_to_upstream, upstream_to_client);

        let bytes_sent = client_to_upstream_result.unwrap_or_else(|e| {
            debug!("Client to upstream copy ended: {}", e);
            0
        });

        let bytes_received = upstream_to_client_result.unwrap_or_else(|e| {
            debug!("Upstream to client copy ended: {}", e);
            0
        });

        debug!(
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            "Tunnel closed"
        );

        (bytes_sent, bytes_received)
    }

    /// Copy `reader` into `writer` until EOF.
    ///
    /// Fails with `TimedOut` once no byte has moved for `idle_timeout`.
    pub async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W, idle_timeout: Duration) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let activity = Activity::new();
        let total = copy_until_idle(reader, writer, &activity, idle_timeout).await?;
        writer.flush().await?;
        Ok(total)
    }
}

async fn copy_until_idle<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    idle_timeout: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let remaining = idle_timeout.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return Err(idle_error());
        }

        let n = match timeout(remaining, reader.read(&mut buf)).await {
            Ok(result) => result?,
            // The other direction may still be busy; re-check the shared clock.
            Err(_) => continue,
        };
        if n == 0 {
            return Ok(total);
        }
        activity.touch();

        timeout(idle_timeout, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| idle_error())??;
        activity.touch();
        total += n as u64;
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout")
}
