//! OVSDB probe
//!
//! Maintains a JSON-RPC (RFC 7047) session with the local OVSDB server and
//! mirrors the `Bridge`, `Port` and `Interface` tables as graph
//! sub-structure: bridges own their ports, ports own their interfaces, and
//! patch interfaces are joined by `layer2` edges. OVSDB is authoritative for
//! the `Type` of interfaces it owns; the netlink probe defers to it.

use crate::graph::{Graph, GraphState, Metadata, Node};
use crate::probes::{ProbeLifecycle, TopologyProbe};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MONITOR_ID: u64 = 1;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Cross-row references remembered between updates: which bridge row owns
/// which port row, which port row owns which interface row. Only touched
/// while holding the graph write lock.
#[derive(Default)]
struct OvsdbCache {
    port_owner: HashMap<String, String>,
    interface_owner: HashMap<String, String>,
}

pub struct OvsdbProbe {
    graph: Arc<Graph>,
    root: Node,
    addr: String,
    lifecycle: ProbeLifecycle,
    cache: Mutex<OvsdbCache>,
}

impl OvsdbProbe {
    pub fn new(graph: Arc<Graph>, root: Node, addr: String) -> Self {
        Self {
            graph,
            root,
            addr,
            lifecycle: ProbeLifecycle::new(),
            cache: Mutex::new(OvsdbCache::default()),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);

        while self.lifecycle.is_running() {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    info!("Connected to OVSDB at {}", self.addr);
                    backoff = Duration::from_secs(1);
                    if let Err(e) = self.monitor_loop(stream).await {
                        if self.lifecycle.is_running() {
                            warn!("OVSDB session ended: {}, reconnecting", e);
                        }
                    }
                }
                Err(e) => {
                    debug!("Unable to connect to OVSDB at {}: {}", self.addr, e);
                }
            }

            if !self.lifecycle.is_running() {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }

        self.lifecycle.finished();
    }

    async fn monitor_loop(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let monitor = json!({
            "id": MONITOR_ID,
            "method": "monitor",
            "params": ["Open_vSwitch", null, {
                "Bridge": {"columns": ["name", "ports"]},
                "Port": {"columns": ["name", "interfaces"]},
                "Interface": {"columns": ["name", "type", "options"]},
            }],
        });
        stream.write_all(monitor.to_string().as_bytes()).await?;

        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            if !self.lifecycle.is_running() {
                return Ok(());
            }
            // Bounded read so the state variable is polled while the
            // database is quiet.
            let n = match timeout(Duration::from_secs(1), stream.read(&mut chunk)).await {
                Err(_) => continue,
                Ok(Ok(0)) => anyhow::bail!("connection closed by server"),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
            };
            buf.extend_from_slice(&chunk[..n]);

            let consumed = self.drain_messages(&mut stream, &buf).await?;
            buf.drain(..consumed);
        }
    }

    /// OVSDB frames are bare JSON values back to back; parse every complete
    /// value in the buffer and report how many bytes were consumed.
    async fn drain_messages(&self, stream: &mut TcpStream, buf: &[u8]) -> anyhow::Result<usize> {
        let mut consumed = 0;
        let mut values = Vec::new();
        {
            let mut iter = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
            loop {
                match iter.next() {
                    Some(Ok(value)) => {
                        consumed = iter.byte_offset();
                        values.push(value);
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => anyhow::bail!("malformed OVSDB message: {}", e),
                    None => break,
                }
            }
        }
        for value in values {
            self.handle_message(stream, value).await?;
        }
        Ok(consumed)
    }

    async fn handle_message(&self, stream: &mut TcpStream, value: Value) -> anyhow::Result<()> {
        match value.get("method").and_then(Value::as_str) {
            // Liveness probe from the server; echo the params back.
            Some("echo") => {
                let reply = json!({
                    "id": value.get("id").cloned().unwrap_or(Value::Null),
                    "result": value.get("params").cloned().unwrap_or_else(|| json!([])),
                    "error": Value::Null,
                });
                stream.write_all(reply.to_string().as_bytes()).await?;
            }
            Some("update") => {
                if let Some(updates) = value.get("params").and_then(|p| p.get(1)) {
                    self.apply_table_updates(updates);
                }
            }
            Some(other) => debug!("Ignoring OVSDB method {}", other),
            None => {
                if value.get("id").and_then(Value::as_u64) == Some(MONITOR_ID) {
                    match value.get("error") {
                        Some(err) if !err.is_null() => {
                            anyhow::bail!("monitor request failed: {}", err)
                        }
                        _ => {
                            if let Some(initial) = value.get("result") {
                                self.apply_table_updates(initial);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconcile one table-updates object (initial dump or live update)
    /// against the graph, under a single write lock.
    fn apply_table_updates(&self, updates: &Value) {
        let mut g = self.graph.write();
        let mut cache = self.cache.lock();

        // Children before parents so containment links resolve in one pass.
        for table in ["Interface", "Port", "Bridge"] {
            let Some(rows) = updates.get(table).and_then(Value::as_object) else {
                continue;
            };
            for (uuid, change) in rows {
                match (change.get("new"), change.get("old")) {
                    (Some(row), _) => match table {
                        "Bridge" => self.upsert_bridge(&mut g, &mut cache, uuid, row),
                        "Port" => self.upsert_port(&mut g, &mut cache, uuid, row),
                        "Interface" => self.upsert_interface(&mut g, &mut cache, uuid, row),
                        _ => unreachable!(),
                    },
                    (None, Some(_)) => self.delete_row(&mut g, uuid),
                    (None, None) => debug!("OVSDB update for {} carries no row", uuid),
                }
            }
        }
    }

    fn upsert_bridge(&self, g: &mut GraphState, cache: &mut OvsdbCache, uuid: &str, row: &Value) {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            return;
        };

        let node = self.node_by_uuid(g, uuid).unwrap_or_else(|| {
            g.new_node(
                Metadata::new()
                    .with("Name", name)
                    .with("Type", "ovsbridge")
                    .with("UUID", uuid)
                    .with("Driver", "openvswitch"),
            )
        });
        if !g.are_linked(&self.root, &node) {
            g.link(&self.root, &node, ownership());
        }
        g.add_metadata(&node, "Name", name);

        for port_uuid in ovs_uuid_set(row.get("ports")) {
            cache.port_owner.insert(port_uuid.clone(), uuid.to_string());
            if let Some(port) = self.node_by_uuid(g, &port_uuid) {
                if !g.are_linked(&node, &port) {
                    g.link(&node, &port, ownership());
                }
            }
        }
    }

    fn upsert_port(&self, g: &mut GraphState, cache: &mut OvsdbCache, uuid: &str, row: &Value) {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            return;
        };

        let node = self.node_by_uuid(g, uuid).unwrap_or_else(|| {
            g.new_node(
                Metadata::new()
                    .with("Name", name)
                    .with("Type", "ovsport")
                    .with("UUID", uuid)
                    .with("Driver", "openvswitch"),
            )
        });
        g.add_metadata(&node, "Name", name);

        if let Some(bridge_uuid) = cache.port_owner.get(uuid) {
            if let Some(bridge) = self.node_by_uuid(g, bridge_uuid) {
                if !g.are_linked(&bridge, &node) {
                    g.link(&bridge, &node, ownership());
                }
            }
        }

        for intf_uuid in ovs_uuid_set(row.get("interfaces")) {
            cache
                .interface_owner
                .insert(intf_uuid.clone(), uuid.to_string());
            if let Some(intf) = self.node_by_uuid(g, &intf_uuid) {
                if !g.are_linked(&node, &intf) {
                    g.link(&node, &intf, ownership());
                }
            }
        }
    }

    fn upsert_interface(&self, g: &mut GraphState, cache: &mut OvsdbCache, uuid: &str, row: &Value) {
        let Some(name) = row.get("name").and_then(Value::as_str) else {
            return;
        };
        let intf_type = row.get("type").and_then(Value::as_str).unwrap_or("");

        // The netlink probe may have created the node first, keyed only by
        // name and driver; adopt it instead of duplicating.
        let node = self
            .node_by_uuid(g, uuid)
            .or_else(|| {
                g.lookup_first_node(
                    &Metadata::new()
                        .with("Name", name)
                        .with("Driver", "openvswitch"),
                )
            })
            .unwrap_or_else(|| {
                g.new_node(
                    Metadata::new()
                        .with("Name", name)
                        .with("UUID", uuid)
                        .with("Driver", "openvswitch"),
                )
            });

        let mut metadata = node.metadata.clone();
        metadata.set("Name", name);
        metadata.set("UUID", uuid);
        metadata.set("Driver", "openvswitch");
        if !intf_type.is_empty() {
            metadata.set("Type", intf_type);
        }

        let options = ovs_map(row.get("options"));
        if let Some(peer) = options.get("peer") {
            metadata.set("PatchPeer", peer.as_str());
        }

        let node = g.set_metadata(&node, metadata).unwrap_or(node);

        if let Some(port_uuid) = cache.interface_owner.get(uuid) {
            if let Some(port) = self.node_by_uuid(g, port_uuid) {
                if !g.are_linked(&port, &node) {
                    g.link(&port, &node, ownership());
                }
            }
        }

        // Patch peers resolve from whichever side lands second.
        if intf_type == "patch" {
            if let Some(peer_name) = options.get("peer") {
                let filter = Metadata::new()
                    .with("Name", peer_name.as_str())
                    .with("Type", "patch");
                if let Some(peer) = g.lookup_first_node(&filter) {
                    if !g.are_linked(&node, &peer) {
                        g.link(
                            &node,
                            &peer,
                            Metadata::new()
                                .with("RelationType", "layer2")
                                .with("Type", "patch"),
                        );
                    }
                }
            }
        }
    }

    /// Row deletion: top-down cascades arrive as individual row deletes, so
    /// dropping the node (and its incident edges) per row is enough.
    fn delete_row(&self, g: &mut GraphState, uuid: &str) {
        if let Some(node) = self.node_by_uuid(g, uuid) {
            debug!(
                "OVSDB row {} deleted, removing {:?}",
                uuid,
                node.metadata.get_str("Name")
            );
            g.del_node(&node);
        }
    }

    fn node_by_uuid(&self, g: &GraphState, uuid: &str) -> Option<Node> {
        g.lookup_first_node(&Metadata::new().with("UUID", uuid))
    }
}

#[async_trait]
impl TopologyProbe for OvsdbProbe {
    fn name(&self) -> &'static str {
        "ovsdb"
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

fn ownership() -> Metadata {
    Metadata::new().with("RelationType", "ownership")
}

/// OVSDB encodes references as `["uuid", id]` and sets of references as
/// `["set", [["uuid", id], ...]]`.
fn ovs_uuid_set(value: Option<&Value>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    match value.as_array().map(Vec::as_slice) {
        Some([tag, id]) if tag == "uuid" => id.as_str().map(str::to_string).into_iter().collect(),
        Some([tag, members]) if tag == "set" => members
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|member| match member.as_array().map(Vec::as_slice) {
                Some([tag, id]) if tag == "uuid" => id.as_str().map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// OVSDB maps are `["map", [[key, value], ...]]`.
fn ovs_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(array) = value.and_then(Value::as_array) else {
        return out;
    };
    if array.len() != 2 || array[0] != "map" {
        return out;
    }
    for pair in array[1].as_array().into_iter().flatten() {
        if let Some([key, val]) = pair.as_array().map(Vec::as_slice) {
            if let (Some(key), Some(val)) = (key.as_str(), val.as_str()) {
                out.insert(key.to_string(), val.to_string());
            }
        }
    }
    out
}
