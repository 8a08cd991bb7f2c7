//! Forwarding supervisor.
//!
//! Owns one forwarder per configured mapping, applies replacement mapping sets
//! as a set difference, and holds the process-wide shutdown token. `wait`
//! returns only after every forwarder, including ones retired by a
//! reconfiguration, has reached `Stopped`.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::buffer::{BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE_BUFFERS};
use crate::config::{validate_mappings, ConfigSnapshot, Mapping, MappingStore};
use crate::error::{Error, Result};
use crate::forwarder::{
    spawn_forwarder, ForwarderContext, ForwarderHandle, ForwarderState, DEFAULT_DRAIN_TIMEOUT,
};
use crate::pair::PairContext;

/// Tunables for every forwarder the supervisor starts.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Grace period for live pairs once a forwarder stops.
    pub drain_timeout: Duration,
    /// Optional bound on remote dials.
    pub connect_timeout: Option<Duration>,
    /// Relay buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            connect_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Point-in-time view of one mapping's forwarder.
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStatus {
    pub mapping: Mapping,
    pub local_addr: Option<SocketAddr>,
    pub state: ForwarderState,
    pub active_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What an apply pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Mappings whose forwarder was started.
    pub started: Vec<Mapping>,
    /// Mappings whose forwarder was stopped.
    pub stopped: Vec<Mapping>,
    /// Mappings left running untouched.
    pub kept: Vec<Mapping>,
    /// Mappings that failed to bind, with the reason.
    pub failed: Vec<(Mapping, String)>,
}

#[derive(Default)]
struct Forwarders {
    running: HashMap<Mapping, ForwarderHandle>,
    failed: HashMap<Mapping, String>,
}

/// Supervises the set of running forwarders.
pub struct Supervisor {
    store: Arc<dyn MappingStore>,
    snapshot: ConfigSnapshot,
    ctx: ForwarderContext,
    shutdown: CancellationToken,
    forwarders: Mutex<Forwarders>,
    retiring: TaskTracker,
}

impl Supervisor {
    /// Creates a supervisor with no forwarders running.
    pub fn new(
        store: Arc<dyn MappingStore>,
        options: SupervisorOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let ctx = ForwarderContext {
            pair: PairContext {
                pool: BufferPool::new(options.buffer_size, DEFAULT_MAX_IDLE_BUFFERS),
                connect_timeout: options.connect_timeout,
            },
            drain_timeout: options.drain_timeout,
        };

        Self {
            store,
            snapshot: ConfigSnapshot::new(Vec::new()),
            ctx,
            shutdown,
            forwarders: Mutex::new(Forwarders::default()),
            retiring: TaskTracker::new(),
        }
    }

    /// Starts forwarders for the initial mapping list without persisting it.
    pub async fn start(&self, mappings: Vec<Mapping>) -> Result<ApplyReport> {
        validate_mappings(&mappings)?;
        let mut forwarders = self.forwarders.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.snapshot.replace(mappings.clone());
        Ok(self.apply(&mut forwarders, &mappings).await)
    }

    /// Replaces the mapping set: validate, persist, then stop removed mappings,
    /// keep unchanged ones and start added ones.
    ///
    /// Nothing changes if validation or persistence fails.
    pub async fn replace(&self, mappings: Vec<Mapping>) -> Result<ApplyReport> {
        validate_mappings(&mappings)?;

        let mut forwarders = self.forwarders.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        self.store.save(&mappings)?;
        self.snapshot.replace(mappings.clone());

        let report = self.apply(&mut forwarders, &mappings).await;
        tracing::info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            "configuration replaced"
        );
        Ok(report)
    }

    /// Current mapping list.
    pub fn mappings(&self) -> Arc<[Mapping]> {
        self.snapshot.load()
    }

    /// Broadcasts the shutdown signal. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// A clone of the shutdown token, for collaborators that stop with the forwarders.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Status of every mapping in the current snapshot.
    pub async fn status(&self) -> Vec<ForwarderStatus> {
        let mappings = self.snapshot.load();
        let forwarders = self.forwarders.lock().await;

        mappings
            .iter()
            .map(|mapping| match forwarders.running.get(mapping) {
                Some(handle) => ForwarderStatus {
                    mapping: mapping.clone(),
                    local_addr: Some(handle.local_addr()),
                    state: handle.state(),
                    active_connections: handle.active_connections(),
                    error: None,
                },
                None => ForwarderStatus {
                    mapping: mapping.clone(),
                    local_addr: None,
                    state: ForwarderState::Stopped,
                    active_connections: 0,
                    error: forwarders.failed.get(mapping).cloned(),
                },
            })
            .collect()
    }

    /// Waits for the shutdown signal, then for every forwarder to stop.
    pub async fn wait(&self) {
        self.shutdown.cancelled().await;

        let handles: Vec<ForwarderHandle> = {
            let mut forwarders = self.forwarders.lock().await;
            forwarders.failed.clear();
            forwarders.running.drain().map(|(_, handle)| handle).collect()
        };

        tracing::info!(forwarders = handles.len(), "waiting for forwarders to stop");
        for handle in handles {
            handle.join().await;
        }

        self.retiring.close();
        self.retiring.wait().await;
        tracing::info!("all forwarders stopped");
    }

    async fn apply(&self, forwarders: &mut Forwarders, desired: &[Mapping]) -> ApplyReport {
        let mut report = ApplyReport::default();
        let wanted: HashSet<&Mapping> = desired.iter().collect();

        let removed: Vec<Mapping> = forwarders
            .running
            .keys()
            .filter(|mapping| !wanted.contains(mapping))
            .cloned()
            .collect();

        // A forwarder whose listener is gone is not running, even if still wanted.
        let dead: Vec<Mapping> = forwarders
            .running
            .iter()
            .filter(|(mapping, handle)| {
                wanted.contains(mapping) && handle.state() >= ForwarderState::Draining
            })
            .map(|(mapping, _)| mapping.clone())
            .collect();

        let mut stopping = Vec::with_capacity(removed.len() + dead.len());
        for mapping in removed {
            if let Some(handle) = forwarders.running.remove(&mapping) {
                tracing::info!(mapping = %mapping, "stopping removed mapping");
                handle.stop();
                stopping.push(handle);
                report.stopped.push(mapping);
            }
        }
        for mapping in dead {
            if let Some(handle) = forwarders.running.remove(&mapping) {
                tracing::warn!(mapping = %mapping, state = ?handle.state(), "forwarder no longer listening, restarting");
                handle.stop();
                stopping.push(handle);
            }
        }

        // Free the ports before binding replacements; draining continues in the background.
        for handle in &stopping {
            handle.listener_closed().await;
        }
        for handle in stopping {
            self.retiring.spawn(handle.join());
        }

        forwarders.failed.clear();
        for mapping in desired {
            if forwarders.running.contains_key(mapping) {
                report.kept.push(mapping.clone());
                continue;
            }

            match spawn_forwarder(mapping.clone(), self.ctx.clone(), &self.shutdown).await {
                Ok(handle) => {
                    forwarders.running.insert(mapping.clone(), handle);
                    report.started.push(mapping.clone());
                }
                Err(e) => {
                    tracing::error!(mapping = %mapping, error = %e, "failed to start port forwarding");
                    forwarders.failed.insert(mapping.clone(), e.to_string());
                    report.failed.push((mapping.clone(), e.to_string()));
                }
            }
        }

        report
    }
}
