//! Docker probe
//!
//! Subscribes to the Docker daemon's event stream (plus an initial listing)
//! and maps container lifecycle onto the graph. A container running in its
//! own network namespace is attached under the `netns` node matching its
//! sandbox bind-mount; `--net=host` containers hang directly off the root;
//! containers sharing a namespace end up as siblings under one `netns` node.

use crate::graph::{Graph, GraphState, Metadata, Node};
use crate::probes::{ProbeLifecycle, TopologyProbe};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct DockerProbe {
    graph: Arc<Graph>,
    root: Node,
    lifecycle: ProbeLifecycle,
}

/// The attributes the probe needs from one container inspection.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContainerDescription {
    pub name: String,
    pub host_network: bool,
    pub sandbox_key: Option<String>,
}

impl DockerProbe {
    pub fn new(graph: Arc<Graph>, root: Node) -> Self {
        Self {
            graph,
            root,
            lifecycle: ProbeLifecycle::new(),
        }
    }

    async fn run(self: Arc<Self>) {
        while self.lifecycle.is_running() {
            let docker = match Docker::connect_with_local_defaults() {
                Ok(docker) => docker,
                Err(e) => {
                    debug!("Unable to connect to Docker: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if let Err(e) = self.monitor(&docker).await {
                if self.lifecycle.is_running() {
                    warn!("Docker event stream ended: {}, reconnecting", e);
                }
            }

            if !self.lifecycle.is_running() {
                break;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }

        self.lifecycle.finished();
    }

    async fn monitor(&self, docker: &Docker) -> anyhow::Result<()> {
        // Initial listing, processed as if every container just started.
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;
        info!("Initial scan found {} containers", containers.len());

        for container in containers {
            let Some(id) = container.id else { continue };
            match docker.inspect_container(&id, None).await {
                Ok(inspect) => self.on_container_started(describe_container(&inspect)),
                Err(e) => debug!("Failed to inspect container {}: {}", id, e),
            }
        }

        let options = EventsOptions::<String> {
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                (
                    "event".to_string(),
                    vec!["start".to_string(), "die".to_string()],
                ),
            ]),
            ..Default::default()
        };
        let mut stream = docker.events(Some(options));

        loop {
            if !self.lifecycle.is_running() {
                return Ok(());
            }
            let event = match timeout(Duration::from_secs(1), stream.next()).await {
                Err(_) => continue,
                Ok(None) => anyhow::bail!("event stream closed"),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(event))) => event,
            };

            let Some(actor) = event.actor else { continue };
            let Some(id) = actor.id else { continue };

            match event.action.as_deref() {
                Some("start") => match docker.inspect_container(&id, None).await {
                    Ok(inspect) => self.on_container_started(describe_container(&inspect)),
                    Err(e) => debug!("Failed to inspect started container {}: {}", id, e),
                },
                Some("die") => {
                    let name = actor
                        .attributes
                        .and_then(|attrs| attrs.get("name").cloned())
                        .unwrap_or(id);
                    self.on_container_stopped(&name);
                }
                _ => {}
            }
        }
    }

    pub(crate) fn on_container_started(&self, desc: Option<ContainerDescription>) {
        let Some(desc) = desc else { return };
        debug!("Container started: {}", desc.name);

        let mut g = self.graph.write();

        let parent = if desc.host_network {
            // The container shares the host namespace: no netns node.
            self.root.clone()
        } else {
            let Some(sandbox) = &desc.sandbox_key else {
                debug!("Container {} reports no sandbox", desc.name);
                return;
            };
            self.netns_for_sandbox(&mut g, &desc.name, sandbox)
        };

        let container_name = format!("/{}", desc.name);
        let filter = Metadata::new()
            .with("Type", "container")
            .with("Docker.ContainerName", container_name.as_str());
        let container = g.lookup_first_child(&parent, &filter).unwrap_or_else(|| {
            g.new_node(
                Metadata::new()
                    .with("Name", desc.name.as_str())
                    .with("Type", "container")
                    .with("Manager", "docker")
                    .with("Docker.ContainerName", container_name.as_str()),
            )
        });

        if !g.are_linked(&parent, &container) {
            g.link(
                &parent,
                &container,
                Metadata::new().with("RelationType", "ownership"),
            );
        }
    }

    /// Find or create the `netns` node for a sandbox bind-mount. The
    /// namespace probe races with us; whichever side wins, exactly one node
    /// per sandbox path exists, and we claim it for Docker.
    fn netns_for_sandbox(&self, g: &mut GraphState, name: &str, sandbox: &str) -> Node {
        let filter = Metadata::new().with("Type", "netns").with("Path", sandbox);
        let netns = g.lookup_first_node(&filter).unwrap_or_else(|| {
            g.new_node(
                Metadata::new()
                    .with("Name", name)
                    .with("Type", "netns")
                    .with("Path", sandbox),
            )
        });

        let mut metadata = netns.metadata.clone();
        metadata.set("Name", name);
        metadata.set("Manager", "docker");
        let netns = g.set_metadata(&netns, metadata).unwrap_or(netns);

        if !g.are_linked(&self.root, &netns) {
            g.link(
                &self.root,
                &netns,
                Metadata::new().with("RelationType", "ownership"),
            );
        }
        netns
    }

    pub(crate) fn on_container_stopped(&self, name: &str) {
        debug!("Container stopped: {}", name);

        let mut g = self.graph.write();
        let filter = Metadata::new()
            .with("Type", "container")
            .with("Docker.ContainerName", format!("/{}", name).as_str());
        if let Some(container) = g.lookup_first_node(&filter) {
            // The netns node, if any, is removed by the namespace probe when
            // the sandbox mount disappears.
            g.del_node(&container);
        }
    }
}

#[async_trait]
impl TopologyProbe for DockerProbe {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(self: Arc<Self>) {
        if !self.lifecycle.begin() {
            return;
        }
        let probe = self.clone();
        let handle = tokio::spawn(async move { probe.run().await });
        self.lifecycle.attach(handle).await;
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

/// Project a container inspection onto the attributes the probe acts on.
pub(crate) fn describe_container(
    inspect: &ContainerInspectResponse,
) -> Option<ContainerDescription> {
    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())?;

    let network_mode = inspect
        .host_config
        .as_ref()
        .and_then(|hc| hc.network_mode.as_deref())
        .unwrap_or_default();

    let sandbox_key = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.sandbox_key.clone())
        .filter(|key| !key.is_empty());

    Some(ContainerDescription {
        name,
        host_network: network_mode == "host",
        sandbox_key,
    })
}
