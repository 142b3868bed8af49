//! Topology probe runtime
//!
//! Each probe translates one class of host-level events into graph
//! mutations. Probes share the lifecycle discipline implemented here: a
//! single atomic state variable progressing Stopped -> Running -> Stopping
//! -> Stopped, cooperative shutdown polled between loop iterations, and a
//! stop that returns only once the background task has quiesced.

pub mod docker;
pub mod netlink;
pub mod netns;
pub mod ovsdb;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::graph::Graph;
use async_trait::async_trait;
use log::info;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

/// Shared lifecycle state for a probe's background task.
pub struct ProbeLifecycle {
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ProbeState::Stopped as u8),
            task: Mutex::new(None),
        }
    }

    /// Transition Stopped -> Running. Returns false when already started.
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(
                ProbeState::Stopped as u8,
                ProbeState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Loops poll this between iterations and exit when it turns false.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ProbeState::Running as u8
    }

    /// Record the spawned background task so stop can await it.
    pub async fn attach(&self, handle: JoinHandle<()>) {
        *self.task.lock().await = Some(handle);
    }

    /// Called by the loop on exit, terminal errors included.
    pub fn finished(&self) {
        self.state.store(ProbeState::Stopped as u8, Ordering::SeqCst);
    }

    /// Request shutdown and wait for the background task to quiesce.
    /// Idempotent; returns immediately when the probe never started.
    pub async fn stop(&self) {
        let _ = self.state.compare_exchange(
            ProbeState::Running as u8,
            ProbeState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.finished();
    }
}

impl Default for ProbeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// A topology probe: non-blocking start, idempotent quiescent stop.
#[async_trait]
pub trait TopologyProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launch background work. Must not block.
    async fn start(self: Arc<Self>);

    /// Request shutdown and return once background work has quiesced.
    async fn stop(&self);
}

/// The set of probes assembled from configuration, started and stopped
/// together.
pub struct ProbeBundle {
    probes: Vec<Arc<dyn TopologyProbe>>,
}

impl ProbeBundle {
    /// Instantiate the configured probes against the shared graph. Unknown
    /// probe names are an error; the caller decides whether to abort.
    pub fn from_config(graph: Arc<Graph>, config: &Config) -> Result<Self> {
        let root = graph.root().clone();
        let mut probes: Vec<Arc<dyn TopologyProbe>> = Vec::new();

        for name in &config.probes {
            match name.as_str() {
                "netlink" => {
                    probes.push(Arc::new(netlink::NetlinkProbe::new(
                        graph.clone(),
                        root.clone(),
                        None,
                    )));
                }
                "netns" => {
                    probes.push(Arc::new(netns::NetnsProbe::new(
                        graph.clone(),
                        root.clone(),
                        config.netns_paths.iter().map(Into::into).collect(),
                    )));
                }
                "ovsdb" => {
                    probes.push(Arc::new(ovsdb::OvsdbProbe::new(
                        graph.clone(),
                        root.clone(),
                        format!("127.0.0.1:{}", config.ovsdb_port),
                    )));
                }
                "docker" => {
                    probes.push(Arc::new(docker::DockerProbe::new(graph.clone(), root.clone())));
                }
                other => return Err(AgentError::UnknownProbe(other.to_string())),
            }
        }

        Ok(Self { probes })
    }

    pub async fn start(&self) {
        for probe in &self.probes {
            info!("Starting topology probe: {}", probe.name());
            probe.clone().start().await;
        }
    }

    pub async fn stop(&self) {
        for probe in &self.probes {
            info!("Stopping topology probe: {}", probe.name());
            probe.stop().await;
        }
    }
}
