//! Per-mapping forwarder: one listener, one accept loop, many connection pairs.
//!
//! Lifecycle is `Starting -> Listening -> Draining -> Stopped`. A bind failure
//! never produces a handle. Once the stop token fires the listener is closed,
//! already spawned pairs get `drain_timeout` to finish on their own, and any
//! still alive after that are force-closed.

use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Mapping;
use crate::error::{Error, Result};
use crate::pair::{pair, PairContext};

/// Pause after a transient accept error before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Default grace period for in-flight pairs once a forwarder stops.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderState {
    /// Binding the local address.
    Starting,
    /// Accepting connections.
    Listening,
    /// Listener closed, waiting for live pairs.
    Draining,
    /// Listener closed and every pair has returned.
    Stopped,
}

/// Settings shared by every forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderContext {
    pub pair: PairContext,
    pub drain_timeout: Duration,
}

/// Runtime handle for one running mapping.
#[derive(Debug)]
pub struct ForwarderHandle {
    mapping: Mapping,
    local_addr: SocketAddr,
    stop: CancellationToken,
    tracker: TaskTracker,
    state: watch::Receiver<ForwarderState>,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ForwarderState {
        *self.state.borrow()
    }

    /// Number of connection pairs that have not returned yet.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting; live pairs drain as usual.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves once the listening socket has been closed.
    pub async fn listener_closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s >= ForwarderState::Draining).await;
    }

    /// Waits for the forwarder to reach `Stopped`.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(mapping = %self.mapping, error = %e, "forwarder task panicked");
        }
    }
}

/// Binds `mapping.local` and starts its accept loop.
///
/// The accept loop stops when `shutdown` or the handle's own stop fires.
pub async fn spawn_forwarder(
    mapping: Mapping,
    ctx: ForwarderContext,
    shutdown: &CancellationToken,
) -> Result<ForwarderHandle> {
    let (state_tx, state_rx) = watch::channel(ForwarderState::Starting);

    let bind_addr = mapping.local_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| Error::ListenFailed {
            addr: mapping.local.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let stop = shutdown.child_token();
    let kill = CancellationToken::new();
    let tracker = TaskTracker::new();

    state_tx.send_replace(ForwarderState::Listening);
    tracing::info!(mapping = %mapping, %local_addr, "port forwarding started");

    let forwarder = Forwarder {
        mapping: mapping.clone(),
        listener,
        ctx,
        stop: stop.clone(),
        kill,
        tracker: tracker.clone(),
        state: state_tx,
    };
    let task = tokio::spawn(forwarder.run());

    Ok(ForwarderHandle {
        mapping,
        local_addr,
        stop,
        tracker,
        state: state_rx,
        task,
    })
}

struct Forwarder {
    mapping: Mapping,
    listener: TcpListener,
    ctx: ForwarderContext,
    stop: CancellationToken,
    kill: CancellationToken,
    tracker: TaskTracker,
    state: watch::Sender<ForwarderState>,
}

impl Forwarder {
    async fn run(self) {
        let Forwarder {
            mapping,
            listener,
            ctx,
            stop,
            kill,
            tracker,
            state,
        } = self;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(mapping = %mapping, ?peer, "accepted connection");
                        let remote = mapping.remote.clone();
                        let pair_ctx = ctx.pair.clone();
                        let cancel = kill.child_token();
                        tracker.spawn(async move {
                            pair(stream, &remote, &pair_ctx, cancel).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(mapping = %mapping, error = %e, "failed to accept connection");
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                        }
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        state.send_replace(ForwarderState::Draining);
        tracing::info!(
            mapping = %mapping,
            active = tracker.len(),
            "shutting down port forwarding"
        );

        if tokio::time::timeout(ctx.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                mapping = %mapping,
                remaining = tracker.len(),
                "drain timeout elapsed, closing live connections"
            );
            kill.cancel();
            tracker.wait().await;
        }

        state.send_replace(ForwarderState::Stopped);
        tracing::info!(mapping = %mapping, "port forwarding stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn ctx(drain_timeout: Duration) -> ForwarderContext {
        ForwarderContext {
            pair: PairContext {
                pool: BufferPool::new(DEFAULT_BUFFER_SIZE, 8),
                connect_timeout: Some(Duration::from_secs(2)),
            },
            drain_timeout,
        }
    }

    /// Remote that accepts connections and holds them open without replying.
    async fn silent_remote() -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (addr, handle)
    }

    async fn echo_remote() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forwarder_relays_and_stops() {
        let remote = echo_remote().await;
        let shutdown = CancellationToken::new();
        let handle = spawn_forwarder(
            Mapping::new(remote.to_string(), "127.0.0.1:0"),
            ctx(Duration::from_secs(1)),
            &shutdown,
        )
        .await
        .unwrap();
        assert_eq!(handle.state(), ForwarderState::Listening);

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(client);

        let addr = handle.local_addr();
        handle.stop();
        handle.listener_closed().await;
        assert!(TcpStream::connect(addr).await.is_err());

        tokio::time::timeout(Duration::from_secs(3), handle.join())
            .await
            .expect("forwarder should stop");
    }

    #[tokio::test]
    async fn test_bind_failure_returns_listen_failed() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let err = spawn_forwarder(
            Mapping::new("127.0.0.1:1", addr.to_string()),
            ctx(Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ListenFailed { .. }));
    }

    #[tokio::test]
    async fn test_global_shutdown_stops_accept_loop() {
        let (remote, _remote_task) = silent_remote().await;
        let shutdown = CancellationToken::new();
        let handle = spawn_forwarder(
            Mapping::new(remote.to_string(), "127.0.0.1:0"),
            ctx(Duration::from_secs(1)),
            &shutdown,
        )
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle.listener_closed())
            .await
            .expect("listener should close on shutdown");
        assert!(handle.state() >= ForwarderState::Draining);
        handle.join().await;
    }

    #[tokio::test]
    async fn test_drain_timeout_force_closes_live_pairs() {
        let (remote, _remote_task) = silent_remote().await;
        let handle = spawn_forwarder(
            Mapping::new(remote.to_string(), "127.0.0.1:0"),
            ctx(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"x").await.unwrap();

        // wait until the pair is live
        for _ in 0..100 {
            if handle.active_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.active_connections(), 1);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(3), handle.join())
            .await
            .expect("drain timeout should bound shutdown");

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should see the connection close");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[test]
    fn test_state_ordering() {
        assert!(ForwarderState::Starting < ForwarderState::Listening);
        assert!(ForwarderState::Listening < ForwarderState::Draining);
        assert!(ForwarderState::Draining < ForwarderState::Stopped);
        assert_eq!(
            serde_json::to_string(&ForwarderState::Draining).unwrap(),
            "\"draining\""
        );
    }
}
