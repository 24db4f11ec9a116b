//! Duplex relay between a client and an upstream
//!
//! Two copy loops run concurrently. The first loop to stop (EOF or error) trips
//! a shared [`CloseGuard`]; the other loop observes it and stops too. Each loop
//! then shuts down the write half it owns, so every endpoint is closed exactly
//! once regardless of which side finished first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use super::stream::Stream;

/// Default buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Idempotent close signal shared by both relay directions.
#[derive(Default)]
pub struct CloseGuard {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Trip the guard. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the guard is tripped
    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// client → upstream
    pub uploaded: u64,
    /// upstream → client
    pub downloaded: u64,
}

/// Relay bytes between `client` and `upstream` until either side stops.
pub async fn relay(client: Stream, upstream: Stream) -> RelayStats {
    let guard = CloseGuard::new();

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let upload = pump(client_read, upstream_write, Arc::clone(&guard));
    let download = pump(upstream_read, client_write, guard);

    let (uploaded, downloaded) = tokio::join!(upload, download);
    RelayStats {
        uploaded,
        downloaded,
    }
}

/// One relay direction. Owns its write half and shuts it down once.
async fn pump<R, W>(mut reader: R, mut writer: W, guard: Arc<CloseGuard>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    tokio::select! {
        _ = copy(&mut reader, &mut writer, &mut total) => {}
        _ = guard.closed() => {}
    }

    guard.close();
    let _ = writer.shutdown().await;
    total
}

async fn copy<R, W>(reader: &mut R, writer: &mut W, total: &mut u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::zeroed(RELAY_BUFFER_SIZE);

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        *total += n as u64;
    }
}
