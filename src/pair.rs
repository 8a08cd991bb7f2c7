//! Connection pairing: one accepted local connection, one dialed remote, two relays.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::relay::{relay, RelayOutcome};

/// Settings shared by every pair a forwarder spawns.
#[derive(Debug, Clone)]
pub struct PairContext {
    /// Pool the relays borrow their buffers from.
    pub pool: Arc<BufferPool>,
    /// Upper bound on the remote dial; `None` uses the platform default.
    pub connect_timeout: Option<Duration>,
}

/// Byte counts of a finished pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairStats {
    /// Bytes copied local -> remote.
    pub sent: u64,
    /// Bytes copied remote -> local.
    pub received: u64,
}

/// Dials `remote_addr` and relays between it and `local` until both directions finish.
///
/// Every failure stays here: a failed dial closes `local` and returns, a relay
/// error only ends this pair. `cancel` force-closes the pair.
pub async fn pair(local: TcpStream, remote_addr: &str, ctx: &PairContext, cancel: CancellationToken) {
    let peer = local.peer_addr().ok();

    let dial = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(?peer, remote = %remote_addr, "pair cancelled while dialing");
            return;
        }
        dial = connect_remote(remote_addr, ctx.connect_timeout) => dial,
    };

    let remote = match dial {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!(?peer, remote = %remote_addr, error = %e, "failed to connect to remote");
            // dropping `local` closes it
            return;
        }
    };

    tracing::debug!(?peer, remote = %remote_addr, "connection pair established");
    let stats = splice(local, remote, &ctx.pool, &cancel).await;
    tracing::debug!(
        ?peer,
        remote = %remote_addr,
        sent = stats.sent,
        received = stats.received,
        "connection pair closed"
    );
}

/// Opens the remote side of a pair, honoring an optional timeout.
pub async fn connect_remote(addr: &str, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, limit),
                )
            })??,
        None => TcpStream::connect(addr).await?,
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(remote = %addr, error = %e, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Runs both relay directions between two connected sockets.
///
/// When either direction ends the pair token fires, which stops the other
/// direction too; both sockets are closed once this returns.
pub async fn splice(
    local: TcpStream,
    remote: TcpStream,
    pool: &Arc<BufferPool>,
    cancel: &CancellationToken,
) -> PairStats {
    let pair_token = cancel.child_token();
    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = remote.into_split();

    let outbound = spawn_direction(
        local_read,
        remote_write,
        Arc::clone(pool),
        pair_token.clone(),
        "local->remote",
    );
    let inbound = spawn_direction(
        remote_read,
        local_write,
        Arc::clone(pool),
        pair_token,
        "remote->local",
    );

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    PairStats {
        sent: join_outcome(outbound, "local->remote").bytes,
        received: join_outcome(inbound, "remote->local").bytes,
    }
}

fn spawn_direction<R, W>(
    src: R,
    dst: W,
    pool: Arc<BufferPool>,
    token: CancellationToken,
    direction: &'static str,
) -> JoinHandle<RelayOutcome>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Finishing this direction tears down the other one.
        let _guard = token.clone().drop_guard();
        let outcome = relay(src, dst, &pool, &token).await;
        if let Some(e) = &outcome.error {
            tracing::warn!(direction, error = %e, "relay failed");
        }
        outcome
    })
}

fn join_outcome(
    joined: std::result::Result<RelayOutcome, tokio::task::JoinError>,
    direction: &'static str,
) -> RelayOutcome {
    joined.unwrap_or_else(|e| {
        tracing::error!(direction, error = %e, "relay task panicked");
        RelayOutcome::default()
    })
}
