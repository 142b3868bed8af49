//! RTNETLINK link probe
//!
//! Subscribes to `RTNLGRP_LINK` for one network namespace and translates
//! link add/delete notifications into graph mutations: interface nodes owned
//! by the probe root, `layer2` edges for bridge membership and veth peers,
//! VLAN and bond attributes. The root-namespace instance hangs interfaces
//! off the host node; per-namespace instances (spawned by the netns probe)
//! hang them off their `netns` node.
//!
//! Bridge masters and veth peers can be discovered in either order. A member
//! whose master is not in the graph yet is queued under the master's kernel
//! index and consumed when the master appears; a veth side whose peer is
//! missing retries on a short timer and gives up once the local interface
//! disappears.

use crate::graph::{Graph, GraphState, Identifier, Metadata, Node};
use crate::probes::netns::NetnsGuard;
use crate::probes::{ProbeLifecycle, TopologyProbe};
use async_trait::async_trait;
use futures::StreamExt;
use netlink_sys::AsyncSocket;
use futures::TryStreamExt;
use log::{debug, error, warn};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{
    InfoBond, InfoData, InfoKind, InfoVlan, LinkAttribute, LinkFlag, LinkInfo, LinkMessage,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::SocketAddr;
use parking_lot::Mutex;
use rtnetlink::constants::RTMGRP_LINK;
use rtnetlink::Handle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const VETH_PEER_RETRIES: u32 = 10;
const VETH_PEER_RETRY_DELAY: Duration = Duration::from_millis(200);

/// The kernel datapath interface backing OVS; carries no topology meaning.
const OVS_SYSTEM: &str = "ovs-system";

pub struct NetlinkProbe {
    graph: Arc<Graph>,
    root: Node,
    ns_path: Option<PathBuf>,
    lifecycle: ProbeLifecycle,
    // Members seen before their bridge master, keyed by the master's kernel
    // index. Only touched while holding the graph write lock.
    index_to_children_queue: Mutex<HashMap<i64, Vec<Identifier>>>,
}

/// Everything the probe needs to know about one kernel link, gathered before
/// the graph lock is taken so reconciliation itself stays synchronous.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkDescription {
    pub name: String,
    pub index: i64,
    pub kind: Option<String>,
    pub driver: String,
    pub mac: String,
    pub mtu: i64,
    pub up: bool,
    pub master_index: Option<i64>,
    pub peer_index: Option<i64>,
    pub vlan: Option<i64>,
    pub bond_mode: Option<String>,
    pub ipv4: Vec<String>,
}

impl NetlinkProbe {
    /// `ns_path` selects the network namespace the probe's socket is opened
    /// in; `None` means the namespace the agent runs in.
    pub fn new(graph: Arc<Graph>, root: Node, ns_path: Option<PathBuf>) -> Self {
        Self {
            graph,
            root,
            ns_path,
            lifecycle: ProbeLifecycle::new(),
            index_to_children_queue: Mutex::new(HashMap::new()),
        }
    }

    fn connect_subscribed(
        ns_path: Option<&Path>,
    ) -> anyhow::Result<(
        Handle,
        futures::channel::mpsc::UnboundedReceiver<(
            NetlinkMessage<RouteNetlinkMessage>,
            SocketAddr,
        )>,
    )> {
        // The socket keeps observing the namespace it was created in, so the
        // guard only needs to cover connection construction.
        let _guard = match ns_path {
            Some(path) => Some(NetnsGuard::enter(path)?),
            None => None,
        };
        let (mut connection, handle, messages) = rtnetlink::new_connection()?;
        let addr = SocketAddr::new(0, RTMGRP_LINK);
        connection.socket_mut().socket_mut().bind(&addr)?;
        tokio::spawn(connection);
        Ok((handle, messages))
    }

    async fn run(self: Arc<Self>) {
        let (handle, mut messages) = match Self::connect_subscribed(self.ns_path.as_deref()) {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to subscribe to RTNLGRP_LINK messages: {}", e);
                self.lifecycle.finished();
                return;
            }
        };

        self.initialize(&handle).await;

        while self.lifecycle.is_running() {
            // Bounded wait so the state variable is polled at least once a
            // second while the link group is quiet.
            match timeout(Duration::from_secs(1), messages.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    warn!("Netlink message stream closed");
                    break;
                }
                Ok(Some((message, _))) => self.process_message(&handle, message).await,
            }
        }

        self.lifecycle.finished();
    }

    async fn process_message(&self, handle: &Handle, message: NetlinkMessage<RouteNetlinkMessage>) {
        match message.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                self.on_link_added(handle, link.header.index).await;
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                self.on_link_deleted(handle, i64::from(link.header.index)).await;
            }
            NetlinkPayload::Error(err) => {
                debug!("Netlink error message: {:?}", err);
            }
            _ => {}
        }
    }

    /// Enumerate current links and process them as if just added, so the
    /// graph reflects pre-existing state before live events stream in.
    async fn initialize(&self, handle: &Handle) {
        let mut links = handle.link().get().execute();
        let mut messages = Vec::new();
        loop {
            match links.try_next().await {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => break,
                Err(e) => {
                    error!("Unable to list interfaces: {}", e);
                    return;
                }
            }
        }
        for msg in messages {
            self.ingest_link(handle, msg).await;
        }
    }

    async fn on_link_added(&self, handle: &Handle, index: u32) {
        let mut stream = handle.link().get().match_index(index).execute();
        match stream.try_next().await {
            Ok(Some(msg)) => self.ingest_link(handle, msg).await,
            Ok(None) => warn!("Failed to find interface {}", index),
            Err(e) => warn!("Failed to find interface {}: {}", index, e),
        }
    }

    async fn on_link_deleted(&self, handle: &Handle, index: i64) {
        debug!("Link {} deleted", index);
        // A delete notification also fires when an interface leaves a
        // bridge, so check whether the kernel still knows the index.
        let mut stream = handle.link().get().match_index(index as u32).execute();
        let still_present = matches!(stream.try_next().await, Ok(Some(_)));
        self.del_link_from_topology(index, still_present);
    }

    async fn ingest_link(&self, handle: &Handle, msg: LinkMessage) {
        let mut desc = describe_link(&msg);
        if desc.name.is_empty() {
            debug!("Skipping link {} without a name", desc.index);
            return;
        }
        desc.ipv4 = self.link_ipv4_addresses(handle, msg.header.index).await;
        desc.driver = self
            .in_namespace(|| ethtool_driver_name(&desc.name))
            .unwrap_or_default();
        if desc.driver.is_empty() && desc.kind.as_deref() == Some("bridge") {
            desc.driver = "bridge".to_string();
        }
        if desc.kind.as_deref() == Some("veth") {
            desc.peer_index = self.in_namespace(|| ethtool_peer_ifindex(&desc.name));
            if desc.peer_index.is_none() {
                debug!("Unable to get peer_ifindex from ethtool for {}", desc.name);
            }
        }
        self.add_link_to_topology(&desc);
    }

    /// Run an ethtool query inside the probe's namespace.
    fn in_namespace<T>(&self, query: impl FnOnce() -> Option<T>) -> Option<T> {
        let _guard = match self.ns_path.as_deref() {
            Some(path) => match NetnsGuard::enter(path) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    debug!("Unable to enter namespace for ethtool query: {}", e);
                    return None;
                }
            },
            None => None,
        };
        query()
    }

    async fn link_ipv4_addresses(&self, handle: &Handle, index: u32) -> Vec<String> {
        let mut out = Vec::new();
        let mut addrs = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        loop {
            match addrs.try_next().await {
                Ok(Some(msg)) => {
                    if msg.header.family != AddressFamily::Inet {
                        continue;
                    }
                    let prefix = msg.header.prefix_len;
                    for attr in &msg.attributes {
                        if let AddressAttribute::Address(ip) = attr {
                            out.push(format!("{}/{}", ip, prefix));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Unable to list addresses for link {}: {}", index, e);
                    break;
                }
            }
        }
        out
    }

    /// Reconcile one link against the graph. Holds the write lock for the
    /// whole operation so lookups and mutations are atomic with respect to
    /// other probes and publisher snapshots.
    pub(crate) fn add_link_to_topology(&self, desc: &LinkDescription) {
        debug!("Link \"{}({})\" added", desc.name, desc.index);

        let mut g = self.graph.write();
        let mut metadata = link_metadata(desc);

        let intf = match desc.driver.as_str() {
            "bridge" => self.add_bridge_link(&mut g, desc, &metadata),
            "openvswitch" => {
                let intf = self.add_ovs_link(&mut g, desc, &metadata);
                // The OVSDB probe is authoritative for the type of
                // interfaces it owns (internal, patch, ...).
                if let Some(existing) = intf.metadata.get_str("Type") {
                    metadata.set("Type", existing);
                }
                intf
            }
            _ => match self.add_generic_link(&mut g, desc, &metadata) {
                Some(intf) => intf,
                None => return,
            },
        };

        let mut merged = intf.metadata.clone();
        if merged.merge(&metadata) {
            g.set_metadata(&intf, merged);
        }
    }

    fn add_bridge_link(&self, g: &mut GraphState, desc: &LinkDescription, metadata: &Metadata) -> Node {
        let filter = Metadata::new()
            .with("Name", desc.name.as_str())
            .with("IfIndex", desc.index);
        let intf = g
            .lookup_first_child(&self.root, &filter)
            .unwrap_or_else(|| g.new_node(metadata.clone()));

        if !g.are_linked(&self.root, &intf) {
            g.link(&self.root, &intf, ownership());
        }

        self.link_master_children(g, &intf, desc.index);
        intf
    }

    fn add_ovs_link(&self, g: &mut GraphState, desc: &LinkDescription, metadata: &Metadata) -> Node {
        let filter = Metadata::new()
            .with("Name", desc.name.as_str())
            .with("Driver", "openvswitch");
        let intf = g
            .lookup_first_node(&filter)
            .unwrap_or_else(|| g.new_node(metadata.clone()));

        if !g.are_linked(&self.root, &intf) {
            g.link(&self.root, &intf, ownership());
        }
        intf
    }

    fn add_generic_link(
        &self,
        g: &mut GraphState,
        desc: &LinkDescription,
        metadata: &Metadata,
    ) -> Option<Node> {
        let mut intf =
            g.lookup_first_child(&self.root, &Metadata::new().with("IfIndex", desc.index));

        if intf.is_none() {
            // Could be a member of an OVS bridge, created by the OVSDB probe
            // before the kernel reported it.
            let filter = Metadata::new()
                .with("Name", desc.name.as_str())
                .with("IfIndex", desc.index);
            intf = g
                .lookup_nodes(&filter)
                .into_iter()
                .find(|n| n.metadata.contains_key("UUID"));
        }

        let intf = intf.unwrap_or_else(|| g.new_node(metadata.clone()));

        if !g.are_linked(&self.root, &intf) {
            g.link(&self.root, &intf, ownership());
        }

        if desc.name == OVS_SYSTEM {
            return Some(intf);
        }

        self.handle_intf_is_child(g, &intf, desc);
        self.handle_intf_is_veth(g, &intf, desc);
        self.handle_intf_is_bond(g, &intf, desc);

        Some(intf)
    }

    /// Flush members queued under this interface's index, then resolve this
    /// interface's own bridge master, queueing when the master is unknown.
    fn handle_intf_is_child(&self, g: &mut GraphState, intf: &Node, desc: &LinkDescription) {
        self.link_master_children(g, intf, desc.index);

        let Some(master_index) = desc.master_index else {
            return;
        };

        match g.lookup_first_child(&self.root, &Metadata::new().with("IfIndex", master_index)) {
            Some(parent) => {
                if parent.metadata.get_str("Name") == Some(OVS_SYSTEM) {
                    return;
                }
                if !g.are_linked(&parent, intf) {
                    g.link(&parent, intf, layer2());
                }
            }
            None => {
                self.index_to_children_queue
                    .lock()
                    .entry(master_index)
                    .or_default()
                    .push(intf.id.clone());
            }
        }
    }

    fn link_master_children(&self, g: &mut GraphState, intf: &Node, index: i64) {
        let children = self.index_to_children_queue.lock().remove(&index);
        for child_id in children.unwrap_or_default() {
            // The child may have been deleted while queued.
            if let Some(child) = g.get_node(&child_id) {
                if !g.are_linked(intf, &child) {
                    g.link(intf, &child, layer2());
                }
            }
        }
    }

    fn handle_intf_is_veth(&self, g: &mut GraphState, intf: &Node, desc: &LinkDescription) {
        if desc.kind.as_deref() != Some("veth") {
            return;
        }
        let Some(peer_index) = desc.peer_index else {
            debug!("Veth {} reports no peer index", desc.name);
            return;
        };

        // The side with the higher index links the pair so the edge is
        // created exactly once.
        if desc.index <= peer_index {
            return;
        }

        if resolve_veth_peer(g, &intf.id, peer_index) {
            return;
        }

        // The peer can be inserted by a later event; retry on a short timer
        // and abandon once the local interface is gone.
        let graph = self.graph.clone();
        let local_id = intf.id.clone();
        tokio::spawn(async move {
            for _ in 0..VETH_PEER_RETRIES {
                tokio::time::sleep(VETH_PEER_RETRY_DELAY).await;
                let mut g = graph.write();
                if resolve_veth_peer(&mut g, &local_id, peer_index) {
                    return;
                }
            }
        });
    }

    fn handle_intf_is_bond(&self, g: &mut GraphState, intf: &Node, desc: &LinkDescription) {
        if desc.kind.as_deref() != Some("bond") {
            return;
        }
        if let Some(mode) = &desc.bond_mode {
            g.add_metadata(intf, "BondMode", mode.as_str());
        }
    }

    pub(crate) fn del_link_from_topology(&self, index: i64, still_present: bool) {
        let mut g = self.graph.write();

        let candidates = g.lookup_nodes(&Metadata::new().with("IfIndex", index));
        let intf = match candidates.len() {
            0 => None,
            1 => candidates.into_iter().next(),
            // Several namespaces can reuse an index; prefer the node owned
            // by this probe's root.
            _ => candidates.into_iter().find(|candidate| {
                g.lookup_owners(candidate)
                    .iter()
                    .any(|parent| parent.id == self.root.id)
            }),
        };

        if let Some(intf) = intf {
            // Removing an interface from a bridge also raises a delete
            // event; in that case only the bridge membership goes away.
            for parent in g.lookup_parent_nodes(&intf, &Metadata::new().with("Type", "bridge")) {
                g.unlink(&parent, &intf);
            }

            if !still_present {
                if intf.metadata.get_str("Driver") == Some("openvswitch") {
                    // The OVSDB probe owns deletion of its interfaces.
                    g.unlink(&self.root, &intf);
                } else {
                    g.del_node(&intf);
                }
            }
        }

        self.index_to_children_queue.lock().remove(&index);
    }
}

#[async_trait]
impl TopologyProbe for NetlinkProbe {
    fn name(&self) -> &'static str {
        "netlink"
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

/// Attempt to link a veth interface with its peer. Returns true when done:
/// either the edge exists or the local interface has disappeared.
fn resolve_veth_peer(g: &mut GraphState, local_id: &str, peer_index: i64) -> bool {
    let Some(local) = g.get_node(local_id) else {
        return true;
    };
    let filter = Metadata::new().with("IfIndex", peer_index).with("Type", "veth");
    match g.lookup_first_node(&filter) {
        Some(peer) => {
            if !g.are_linked(&peer, &local) {
                g.link(
                    &peer,
                    &local,
                    Metadata::new()
                        .with("RelationType", "layer2")
                        .with("Type", "veth"),
                );
            }
            true
        }
        None => false,
    }
}

fn ownership() -> Metadata {
    Metadata::new().with("RelationType", "ownership")
}

fn layer2() -> Metadata {
    Metadata::new().with("RelationType", "layer2")
}

fn link_metadata(desc: &LinkDescription) -> Metadata {
    let mut metadata = Metadata::new()
        .with("Name", desc.name.as_str())
        .with("Type", desc.kind.as_deref().unwrap_or("device"))
        .with("IfIndex", desc.index)
        .with("MAC", desc.mac.as_str())
        .with("MTU", desc.mtu)
        .with("Driver", desc.driver.as_str())
        .with("State", if desc.up { "UP" } else { "DOWN" });

    if !desc.ipv4.is_empty() {
        metadata.set("IPV4", desc.ipv4.join(", "));
    }
    if let Some(vlan) = desc.vlan {
        metadata.set("Vlan", vlan);
    }
    metadata
}

/// Project a kernel link message onto the probe's own description type.
pub(crate) fn describe_link(msg: &LinkMessage) -> LinkDescription {
    let mut desc = LinkDescription {
        index: i64::from(msg.header.index),
        up: msg.header.flags.contains(&LinkFlag::Up),
        ..Default::default()
    };

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => desc.name = name.clone(),
            LinkAttribute::Address(bytes) => desc.mac = format_mac(bytes),
            LinkAttribute::Mtu(mtu) => desc.mtu = i64::from(*mtu),
            LinkAttribute::Controller(master) if *master != 0 => {
                desc.master_index = Some(i64::from(*master));
            }
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(kind) => desc.kind = Some(kind_name(kind)),
                        LinkInfo::Data(InfoData::Vlan(attrs)) => {
                            for vlan_attr in attrs {
                                if let InfoVlan::Id(id) = vlan_attr {
                                    desc.vlan = Some(i64::from(*id));
                                }
                            }
                        }
                        LinkInfo::Data(InfoData::Bond(attrs)) => {
                            for bond_attr in attrs {
                                if let InfoBond::Mode(mode) = bond_attr {
                                    desc.bond_mode = Some(bond_mode_name(*mode).to_string());
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    desc
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Veth => "veth".to_string(),
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Vlan => "vlan".to_string(),
        InfoKind::Bond => "bond".to_string(),
        InfoKind::Vxlan => "vxlan".to_string(),
        InfoKind::Dummy => "dummy".to_string(),
        InfoKind::Tun => "tun".to_string(),
        InfoKind::MacVlan => "macvlan".to_string(),
        InfoKind::IpVlan => "ipvlan".to_string(),
        InfoKind::Other(name) => name.clone(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

fn bond_mode_name(mode: u8) -> &'static str {
    match mode {
        0 => "balance-rr",
        1 => "active-backup",
        2 => "balance-xor",
        3 => "broadcast",
        4 => "802.3ad",
        5 => "balance-tlb",
        6 => "balance-alb",
        _ => "unknown",
    }
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GDRVINFO: u32 = 0x0000_0003;
const ETHTOOL_GSTRINGS: u32 = 0x0000_001b;
const ETHTOOL_GSTATS: u32 = 0x0000_001d;
const ETH_SS_STATS: u32 = 1;
const ETH_GSTRING_LEN: usize = 32;

#[repr(C)]
struct EthtoolDrvinfo {
    cmd: u32,
    driver: [u8; 32],
    version: [u8; 32],
    fw_version: [u8; 32],
    bus_info: [u8; 32],
    erom_version: [u8; 32],
    reserved2: [u8; 12],
    n_priv_flags: u32,
    n_stats: u32,
    testinfo_len: u32,
    eedump_len: u32,
    regdump_len: u32,
}

// Mirrors struct ifreq: name plus the data pointer arm of the union,
// padded out to the kernel's size.
#[repr(C)]
struct Ifreq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_char,
    _pad: [u8; 16],
}

/// One `SIOCETHTOOL` round trip for the named interface; `data` points at
/// the command buffer, which the kernel fills in place.
fn ethtool_ioctl(name: &str, data: *mut libc::c_char) -> Option<()> {
    if name.len() >= libc::IFNAMSIZ {
        return None;
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return None;
    }

    let mut ifr: Ifreq = unsafe { std::mem::zeroed() };
    ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());
    ifr.ifr_data = data;

    let rc = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut ifr) };
    unsafe { libc::close(fd) };
    if rc < 0 {
        return None;
    }
    Some(())
}

fn ethtool_drvinfo(name: &str) -> Option<EthtoolDrvinfo> {
    let mut drvinfo: EthtoolDrvinfo = unsafe { std::mem::zeroed() };
    drvinfo.cmd = ETHTOOL_GDRVINFO;
    ethtool_ioctl(name, &mut drvinfo as *mut EthtoolDrvinfo as *mut libc::c_char)?;
    Some(drvinfo)
}

/// `ETHTOOL_GDRVINFO`, the same query `ethtool -i` runs. Returns None when
/// the interface has no driver info (OVS internal ports in foreign
/// namespaces, vanished interfaces).
fn ethtool_driver_name(name: &str) -> Option<String> {
    let drvinfo = ethtool_drvinfo(name)?;
    let len = drvinfo
        .driver
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(drvinfo.driver.len());
    let driver = String::from_utf8_lossy(&drvinfo.driver[..len]).to_string();
    if driver.is_empty() {
        None
    } else {
        Some(driver)
    }
}

/// The `peer_ifindex` counter the veth driver exposes through the ethtool
/// statistics interface, the same data `ethtool -S` walks: stat names via
/// `ETHTOOL_GSTRINGS`, values via `ETHTOOL_GSTATS`, matched by position.
fn ethtool_peer_ifindex(name: &str) -> Option<i64> {
    let n_stats = ethtool_drvinfo(name)?.n_stats as usize;
    if n_stats == 0 {
        return None;
    }

    // struct ethtool_gstrings: three u32 fields, then len * 32-byte names.
    let mut strings = vec![0u8; 12 + n_stats * ETH_GSTRING_LEN];
    strings[0..4].copy_from_slice(&ETHTOOL_GSTRINGS.to_ne_bytes());
    strings[4..8].copy_from_slice(&ETH_SS_STATS.to_ne_bytes());
    strings[8..12].copy_from_slice(&(n_stats as u32).to_ne_bytes());
    ethtool_ioctl(name, strings.as_mut_ptr() as *mut libc::c_char)?;

    let position = (0..n_stats).find(|i| {
        let start = 12 + i * ETH_GSTRING_LEN;
        let field = &strings[start..start + ETH_GSTRING_LEN];
        let len = field.iter().position(|&b| b == 0).unwrap_or(ETH_GSTRING_LEN);
        &field[..len] == b"peer_ifindex"
    })?;

    // struct ethtool_stats: two u32 fields, then n_stats u64 values.
    let mut stats = vec![0u8; 8 + n_stats * 8];
    stats[0..4].copy_from_slice(&ETHTOOL_GSTATS.to_ne_bytes());
    stats[4..8].copy_from_slice(&(n_stats as u32).to_ne_bytes());
    ethtool_ioctl(name, stats.as_mut_ptr() as *mut libc::c_char)?;

    let start = 8 + position * 8;
    let value = u64::from_ne_bytes(stats[start..start + 8].try_into().ok()?);
    i64::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::backend::MemoryBackend;

    fn test_probe() -> (Arc<Graph>, NetlinkProbe) {
        let graph = Arc::new(Graph::new(Box::new(MemoryBackend::new()), "test-host"));
        let root = graph.root().clone();
        let probe = NetlinkProbe::new(graph.clone(), root, None);
        (graph, probe)
    }

    fn veth(name: &str, index: i64, peer: i64) -> LinkDescription {
        LinkDescription {
            name: name.to_string(),
            index,
            kind: Some("veth".to_string()),
            driver: "veth".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            mtu: 1500,
            up: true,
            peer_index: Some(peer),
            ..Default::default()
        }
    }

    fn bridge(name: &str, index: i64) -> LinkDescription {
        LinkDescription {
            name: name.to_string(),
            index,
            kind: Some("bridge".to_string()),
            driver: "bridge".to_string(),
            mtu: 1500,
            up: true,
            ..Default::default()
        }
    }

    fn plain(name: &str, index: i64) -> LinkDescription {
        LinkDescription {
            name: name.to_string(),
            index,
            driver: "e1000".to_string(),
            mtu: 1500,
            up: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_generic_link_owned_by_root() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&plain("eth0", 2));

        let g = graph.read();
        let node = g
            .lookup_first_node(&Metadata::new().with("Name", "eth0"))
            .expect("node");
        assert_eq!(node.metadata.get_int("IfIndex"), Some(2));
        assert_eq!(node.metadata.get_str("Type"), Some("device"));
        assert_eq!(node.metadata.get_str("State"), Some("UP"));
        assert!(g.are_linked(graph.root(), &node));
    }

    #[test]
    fn test_link_add_is_idempotent() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&plain("eth0", 2));
        probe.add_link_to_topology(&plain("eth0", 2));

        let g = graph.read();
        assert_eq!(g.lookup_nodes(&Metadata::new().with("Name", "eth0")).len(), 1);
        assert_eq!(g.edges().len(), 1);
    }

    #[test]
    fn test_metadata_delta_applied_on_change() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&plain("vm1-veth1", 5));

        // Rename plus MAC change arrives as a fresh NEWLINK for index 5.
        let mut renamed = plain("vm1-veth2", 5);
        renamed.mac = "00:00:00:00:00:aa".to_string();
        probe.add_link_to_topology(&renamed);

        let g = graph.read();
        assert!(g
            .lookup_first_node(&Metadata::new().with("Name", "vm1-veth1"))
            .is_none());
        let node = g
            .lookup_first_node(&Metadata::new().with("Name", "vm1-veth2"))
            .expect("renamed node");
        assert_eq!(node.metadata.get_str("MAC"), Some("00:00:00:00:00:aa"));
        assert_eq!(g.lookup_nodes(&Metadata::new().with("IfIndex", 5i64)).len(), 1);
    }

    #[tokio::test]
    async fn test_veth_pair_linked_once() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&veth("vm1-veth0", 4, 5));
        probe.add_link_to_topology(&veth("vm1-veth1", 5, 4));

        let g = graph.read();
        let a = g
            .lookup_first_node(&Metadata::new().with("Name", "vm1-veth0"))
            .expect("a");
        let b = g
            .lookup_first_node(&Metadata::new().with("Name", "vm1-veth1"))
            .expect("b");
        assert!(g.are_linked(&a, &b));

        let peer_edges: Vec<_> = g
            .edges()
            .into_iter()
            .filter(|e| e.metadata.get_str("Type") == Some("veth"))
            .collect();
        assert_eq!(peer_edges.len(), 1);
        assert_eq!(peer_edges[0].metadata.get_str("RelationType"), Some("layer2"));
    }

    #[tokio::test]
    async fn test_veth_peer_resolved_by_retry() {
        let (graph, probe) = test_probe();
        // Higher-index side first: the peer is unknown, a resolver task is
        // spawned.
        probe.add_link_to_topology(&veth("vm1-veth1", 5, 4));
        probe.add_link_to_topology(&veth("vm1-veth0", 4, 5));

        tokio::time::sleep(Duration::from_millis(500)).await;

        let g = graph.read();
        let a = g
            .lookup_first_node(&Metadata::new().with("Name", "vm1-veth0"))
            .expect("a");
        let b = g
            .lookup_first_node(&Metadata::new().with("Name", "vm1-veth1"))
            .expect("b");
        assert!(g.are_linked(&a, &b));
    }

    #[test]
    fn test_bridge_member_before_master_is_queued() {
        let (graph, probe) = test_probe();
        let mut member = plain("eth0", 2);
        member.master_index = Some(7);
        probe.add_link_to_topology(&member);

        {
            let g = graph.read();
            let node = g
                .lookup_first_node(&Metadata::new().with("Name", "eth0"))
                .expect("member");
            // Owned by root but not yet bridged.
            assert_eq!(g.lookup_parent_nodes(&node, &Metadata::new()).len(), 1);
        }

        probe.add_link_to_topology(&bridge("br0", 7));

        let g = graph.read();
        let br = g
            .lookup_first_node(&Metadata::new().with("Name", "br0"))
            .expect("bridge");
        let member = g
            .lookup_first_node(&Metadata::new().with("Name", "eth0"))
            .expect("member");
        assert!(g.are_linked(&br, &member));
    }

    #[test]
    fn test_bridge_member_after_master_links_directly() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&bridge("br0", 7));
        let mut member = plain("eth0", 2);
        member.master_index = Some(7);
        probe.add_link_to_topology(&member);

        let g = graph.read();
        let br = g
            .lookup_first_node(&Metadata::new().with("Name", "br0"))
            .expect("bridge");
        let children = g.lookup_children(&br, &Metadata::new());
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].metadata.get_str("Name"), Some("eth0"));
    }

    #[test]
    fn test_ovs_system_gets_no_adjacency() {
        let (graph, probe) = test_probe();
        let mut datapath = plain(OVS_SYSTEM, 3);
        datapath.kind = Some("veth".to_string());
        datapath.peer_index = Some(99);
        probe.add_link_to_topology(&datapath);

        let g = graph.read();
        let node = g
            .lookup_first_node(&Metadata::new().with("Name", OVS_SYSTEM))
            .expect("node");
        // Owned by root, nothing else.
        assert_eq!(g.edges().len(), 1);
        assert!(g.are_linked(graph.root(), &node));
    }

    #[test]
    fn test_delete_removes_node_and_edges() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&plain("eth0", 2));
        probe.del_link_from_topology(2, false);

        let g = graph.read();
        assert!(g.lookup_first_node(&Metadata::new().with("Name", "eth0")).is_none());
        assert!(g.edges().is_empty());
    }

    #[test]
    fn test_bridge_member_removal_keeps_node() {
        let (graph, probe) = test_probe();
        probe.add_link_to_topology(&bridge("br0", 7));
        let mut member = plain("eth0", 2);
        member.master_index = Some(7);
        probe.add_link_to_topology(&member);

        // Interface left the bridge but still exists in the kernel.
        probe.del_link_from_topology(2, true);

        let g = graph.read();
        let br = g
            .lookup_first_node(&Metadata::new().with("Name", "br0"))
            .expect("bridge");
        let member = g
            .lookup_first_node(&Metadata::new().with("Name", "eth0"))
            .expect("member survives");
        assert!(!g.are_linked(&br, &member));
        assert!(g.are_linked(graph.root(), &member));
    }

    #[test]
    fn test_ovs_interface_delete_unlinks_only() {
        let (graph, probe) = test_probe();
        let mut intf = plain("br-int", 9);
        intf.driver = "openvswitch".to_string();
        probe.add_link_to_topology(&intf);

        probe.del_link_from_topology(9, false);

        let g = graph.read();
        // The node survives for the OVSDB probe to delete.
        let node = g
            .lookup_first_node(&Metadata::new().with("Name", "br-int"))
            .expect("ovs node");
        assert!(!g.are_linked(graph.root(), &node));
    }

    #[test]
    fn test_ovs_type_preserved_over_kernel_kind() {
        let (graph, probe) = test_probe();
        {
            let mut g = graph.write();
            let node = g.new_node(
                Metadata::new()
                    .with("Name", "patch-br1")
                    .with("Type", "patch")
                    .with("UUID", "row-uuid")
                    .with("Driver", "openvswitch"),
            );
            let root = graph.root().clone();
            g.link(&root, &node, Metadata::new().with("RelationType", "ownership"));
        }

        let mut intf = plain("patch-br1", 12);
        intf.driver = "openvswitch".to_string();
        intf.kind = Some("openvswitch".to_string());
        probe.add_link_to_topology(&intf);

        let g = graph.read();
        let node = g
            .lookup_first_node(&Metadata::new().with("Name", "patch-br1"))
            .expect("node");
        assert_eq!(node.metadata.get_str("Type"), Some("patch"));
        assert_eq!(node.metadata.get_int("IfIndex"), Some(12));
    }

    #[test]
    fn test_bond_mode_recorded() {
        let (graph, probe) = test_probe();
        let mut bond = plain("bond0", 6);
        bond.kind = Some("bond".to_string());
        bond.bond_mode = Some("active-backup".to_string());
        probe.add_link_to_topology(&bond);

        let g = graph.read();
        let node = g
            .lookup_first_node(&Metadata::new().with("Name", "bond0"))
            .expect("bond");
        assert_eq!(node.metadata.get_str("BondMode"), Some("active-backup"));
    }

    #[test]
    fn test_bond_mode_names() {
        assert_eq!(bond_mode_name(0), "balance-rr");
        assert_eq!(bond_mode_name(4), "802.3ad");
        assert_eq!(bond_mode_name(42), "unknown");
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0, 0, 0, 0, 0, 0xaa]), "00:00:00:00:00:aa");
    }
}
