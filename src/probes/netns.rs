//! Network-namespace probe
//!
//! Scans the conventional netns mount directories (`ip netns` and Docker
//! sandboxes) for added and removed namespace files. Each namespace gets a
//! `netns` node owned by the root and a netlink subprobe whose socket is
//! opened inside the namespace, so interfaces hang off the namespace node
//! instead of the host root.

use crate::graph::{Graph, Metadata, Node};
use crate::probes::netlink::NetlinkProbe;
use crate::probes::{ProbeLifecycle, TopologyProbe};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Enters a network namespace for the lifetime of the guard and restores
/// the original namespace on drop. Only the current thread is affected;
/// callers must not await while holding the guard.
pub(crate) struct NetnsGuard {
    host: File,
}

impl NetnsGuard {
    pub(crate) fn enter(path: &Path) -> io::Result<Self> {
        let host = File::open("/proc/self/ns/net")?;
        let target = File::open(path)?;
        let rc = unsafe { libc::setns(target.as_raw_fd(), libc::CLONE_NEWNET) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { host })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        let rc = unsafe { libc::setns(self.host.as_raw_fd(), libc::CLONE_NEWNET) };
        if rc != 0 {
            error!(
                "Failed to restore host network namespace: {}",
                io::Error::last_os_error()
            );
        }
    }
}

struct NetnsEntry {
    node_id: String,
    subprobe: Arc<NetlinkProbe>,
}

pub struct NetnsProbe {
    graph: Arc<Graph>,
    root: Node,
    watched: Vec<PathBuf>,
    lifecycle: ProbeLifecycle,
    known: Mutex<HashMap<PathBuf, NetnsEntry>>,
}

impl NetnsProbe {
    pub fn new(graph: Arc<Graph>, root: Node, watched: Vec<PathBuf>) -> Self {
        Self {
            graph,
            root,
            watched,
            lifecycle: ProbeLifecycle::new(),
            known: Mutex::new(HashMap::new()),
        }
    }

    async fn run(self: Arc<Self>) {
        while self.lifecycle.is_running() {
            self.scan().await;
            tokio::time::sleep(SCAN_INTERVAL).await;
        }

        // Quiesce subprobes before reporting stopped.
        let mut known = self.known.lock().await;
        for (path, entry) in known.drain() {
            debug!("Stopping netlink subprobe for {}", path.display());
            entry.subprobe.stop().await;
        }

        self.lifecycle.finished();
    }

    async fn scan(&self) {
        let mut seen = Vec::new();
        for dir in &self.watched {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                // The mount directory appears with the first namespace.
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    seen.push(path);
                }
            }
        }

        let mut known = self.known.lock().await;

        for path in &seen {
            if !known.contains_key(path) {
                if let Some(entry) = self.register(path).await {
                    known.insert(path.clone(), entry);
                }
            }
        }

        let gone: Vec<PathBuf> = known
            .keys()
            .filter(|path| !seen.contains(path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(entry) = known.remove(&path) {
                self.unregister(&path, entry).await;
            }
        }
    }

    /// Create (or adopt) the `netns` node for a namespace file and spawn a
    /// netlink subprobe rooted at it.
    async fn register(&self, path: &Path) -> Option<NetnsEntry> {
        let name = path.file_name()?.to_string_lossy().to_string();
        info!("Network namespace added: {}", path.display());

        let node = {
            let mut g = self.graph.write();
            // The Docker probe may have created the node first; one netns
            // node per namespace, keyed by the bind-mount path.
            let filter = Metadata::new()
                .with("Type", "netns")
                .with("Path", path.to_string_lossy().to_string());
            let node = g.lookup_first_node(&filter).unwrap_or_else(|| {
                g.new_node(
                    Metadata::new()
                        .with("Name", name.as_str())
                        .with("Type", "netns")
                        .with("Path", path.to_string_lossy().to_string()),
                )
            });
            let root = self.root.clone();
            if !g.are_linked(&root, &node) {
                g.link(&root, &node, Metadata::new().with("RelationType", "ownership"));
            }
            node
        };

        let subprobe = Arc::new(NetlinkProbe::new(
            self.graph.clone(),
            node.clone(),
            Some(path.to_path_buf()),
        ));
        subprobe.clone().start().await;

        Some(NetnsEntry {
            node_id: node.id,
            subprobe,
        })
    }

    async fn unregister(&self, path: &Path, entry: NetnsEntry) {
        info!("Network namespace removed: {}", path.display());
        entry.subprobe.stop().await;

        let mut g = self.graph.write();
        if let Some(node) = g.get_node(&entry.node_id) {
            g.del_node(&node);
        } else {
            warn!("Namespace node for {} already gone", path.display());
        }
    }
}

#[async_trait]
impl TopologyProbe for NetnsProbe {
    fn name(&self) -> &'static str {
        "netns"
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
