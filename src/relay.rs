//! Unidirectional byte relay.
//!
//! A relay copies one stream into another through a pooled buffer until the
//! source reaches EOF, an I/O error occurs, or the pair it belongs to is
//! cancelled. Whatever the reason, the destination's write side is shut down
//! afterwards so the peer reading from it observes EOF.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::is_closed_error;

/// Result of one relay run.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    /// Bytes successfully written to the destination.
    pub bytes: u64,
    /// Reportable I/O error, if the relay did not end cleanly.
    ///
    /// EOF, cancellation and "already closed" errors are not reported here.
    pub error: Option<io::Error>,
}

/// Copies `src` into `dst` until EOF, error or cancellation.
pub async fn relay<R, W>(
    mut src: R,
    mut dst: W,
    pool: &Arc<BufferPool>,
    cancel: &CancellationToken,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut bytes = 0u64;

    let result: io::Result<()> = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            read = src.read(&mut buf[..]) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            written = dst.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            break Err(e);
        }
        bytes += n as u64;
    };

    // Hand the buffer back before the (possibly slow) shutdown.
    drop(buf);

    if let Err(e) = dst.shutdown().await {
        if !is_closed_error(&e) {
            tracing::debug!(error = %e, "failed to shut down relay destination");
        }
    }

    let error = match result {
        Err(e) if is_closed_error(&e) => {
            tracing::debug!(error = %e, "relay ended on closed socket");
            None
        }
        Err(e) => Some(e),
        Ok(()) => None,
    };

    RelayOutcome { bytes, error }
}
