//! In-memory model of the sensor network.
//!
//! One [`NodeProxy`] per registered node id, held in a process-wide
//! registry. The registry lock covers only the map itself; per-node
//! fields are mutated through the registry by the serialized command
//! dispatch, so no per-node lock is needed. Bridge pairs are handed out
//! of the lock for teardown so that joining bridge threads never happens
//! with the map locked.

use crate::config::RehandshakePolicy;
use crate::proto::Handshake;
use crate::server::bridge::BridgePair;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime};

/// Node liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    Stale,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Liveness::Live => "live",
            Liveness::Stale => "stale",
        })
    }
}

/// Wi-Fi module bridging mode, as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Unknown,
    Default,
    Uart,
    Disabled,
    Trefoil,
    Flyover,
    Unsupported,
}

impl BridgeMode {
    /// Map the mode strings nodes report to model values.
    pub fn from_report(s: &str) -> Self {
        match s {
            "NORMAL" => BridgeMode::Default,
            "UART-ONLY" => BridgeMode::Uart,
            "NONE" => BridgeMode::Disabled,
            "TREFOIL" => BridgeMode::Trefoil,
            "FLYOVER" => BridgeMode::Flyover,
            _ => BridgeMode::Unsupported,
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeMode::Unknown => "unknown",
            BridgeMode::Default => "default",
            BridgeMode::Uart => "uart-only",
            BridgeMode::Disabled => "none",
            BridgeMode::Trefoil => "trefoil",
            BridgeMode::Flyover => "flyover",
            BridgeMode::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// Server-side proxy for one remote node.
struct NodeProxy {
    id: u32,
    /// Bumped on every accepted registration; lets a lost main
    /// connection clean up only its own registration's bridges.
    generation: u64,
    ip: IpAddr,
    mac: String,
    #[allow(dead_code)]
    registered_at: SystemTime,
    last_seen: Instant,
    liveness: Liveness,
    bridge_mode: BridgeMode,
    heartbeats: u64,
    bridges: Option<BridgePair>,
}

/// Clonable snapshot of one node's state, for display and LIST_NODES.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: u32,
    pub ip: IpAddr,
    pub mac: String,
    pub liveness: Liveness,
    pub bridge_mode: BridgeMode,
    pub heartbeats: u64,
    pub last_seen_age: Duration,
    pub bridge_ports: Option<(u16, u16)>,
}

/// Outcome of a registration attempt
pub enum Registration {
    /// Node accepted; any bridges from a prior registration are handed
    /// back for teardown. `generation` names this registration.
    Accepted {
        previous_bridges: Option<BridgePair>,
        generation: u64,
    },
    /// Refused under the reject policy.
    Rejected,
}

/// Process-wide map of node id to proxy.
pub struct NodeRegistry {
    nodes: Mutex<HashMap<u32, NodeProxy>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn node_with_ip(nodes: &HashMap<u32, NodeProxy>, ip: IpAddr, not: u32) -> Option<u32> {
        nodes
            .values()
            .find(|n| n.ip == ip && n.id != not)
            .map(|n| n.id)
    }

    /// Record a powerup message for `hs.node_id`.
    pub fn register(&self, hs: &Handshake, policy: RehandshakePolicy) -> Registration {
        let mut nodes = self.nodes.lock();

        let ip_claimant = Self::node_with_ip(&nodes, hs.ip, hs.node_id);

        if let Some(existing) = nodes.get_mut(&hs.node_id) {
            if policy == RehandshakePolicy::Reject {
                return Registration::Rejected;
            }
            if existing.ip == hs.ip {
                log::info!("existing node {} at {} powered on again", hs.node_id, hs.ip);
            } else {
                log::warn!(
                    "existing node {} powered on from a new IP address {} (was {})",
                    hs.node_id,
                    hs.ip,
                    existing.ip
                );
                if let Some(other) = ip_claimant {
                    log::warn!("another node {} in the registry already uses IP {}", other, hs.ip);
                }
            }
            existing.generation += 1;
            existing.ip = hs.ip;
            existing.mac = hs.mac.clone();
            existing.last_seen = Instant::now();
            existing.liveness = Liveness::Live;
            let previous_bridges = existing.bridges.take();
            return Registration::Accepted {
                previous_bridges,
                generation: existing.generation,
            };
        }

        log::info!("new node {} seen at IP address {}", hs.node_id, hs.ip);
        if let Some(other) = ip_claimant {
            log::warn!("another node {} in the registry already uses IP {}", other, hs.ip);
        }
        nodes.insert(
            hs.node_id,
            NodeProxy {
                id: hs.node_id,
                generation: 1,
                ip: hs.ip,
                mac: hs.mac.clone(),
                registered_at: SystemTime::now(),
                last_seen: Instant::now(),
                liveness: Liveness::Live,
                bridge_mode: BridgeMode::Unknown,
                heartbeats: 0,
                bridges: None,
            },
        );
        Registration::Accepted {
            previous_bridges: None,
            generation: 1,
        }
    }

    /// Attach the bridge pair serving a registered node.
    ///
    /// `generation` must still name the current registration; a pair
    /// spawned for a registration that has since been replaced is torn
    /// down instead of attached.
    pub fn attach_bridges(&self, id: u32, generation: u64, pair: BridgePair) {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if node.generation == generation => node.bridges = Some(pair),
            Some(_) => {
                drop(nodes);
                log::warn!(
                    "node {} re-registered before its bridges came up; discarding the stale pair",
                    id
                );
                pair.stop();
            }
            None => {
                // Node vanished between registration and bridge startup;
                // drop the pair outside the lock.
                drop(nodes);
                log::warn!("node {} disappeared before its bridges came up", id);
                pair.stop();
            }
        }
    }

    /// Record that a message claiming to be from `id` arrived from `ip`.
    ///
    /// Unknown ids are added with a warning so traffic from a node whose
    /// powerup message was missed is not thrown away. A stale node seen
    /// again becomes live.
    pub fn touch(&self, id: u32, ip: Option<IpAddr>) {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) => {
                if let Some(ip) = ip {
                    if node.ip != ip {
                        log::warn!(
                            "message claiming to be from node {} came from {}, but its address on file is {}",
                            id,
                            ip,
                            node.ip
                        );
                    }
                }
                node.last_seen = Instant::now();
                if node.liveness == Liveness::Stale {
                    log::info!("node {} is talking again, marking it live", id);
                    node.liveness = Liveness::Live;
                }
            }
            None => {
                let Some(ip) = ip else {
                    log::warn!("message for unregistered node {} with no sender address; ignoring", id);
                    return;
                };
                log::warn!(
                    "received a message from {} claiming to be node {}, which is not registered; adding it",
                    ip,
                    id
                );
                nodes.insert(
                    id,
                    NodeProxy {
                        id,
                        generation: 1,
                        ip,
                        mac: String::new(),
                        registered_at: SystemTime::now(),
                        last_seen: Instant::now(),
                        liveness: Liveness::Live,
                        bridge_mode: BridgeMode::Unknown,
                        heartbeats: 0,
                        bridges: None,
                    },
                );
            }
        }
    }

    pub fn record_heartbeat(&self, id: u32) -> Option<u64> {
        let mut nodes = self.nodes.lock();
        nodes.get_mut(&id).map(|node| {
            node.heartbeats += 1;
            node.heartbeats
        })
    }

    /// Returns false if the node id is unknown.
    pub fn set_bridge_mode(&self, id: u32, mode: BridgeMode) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) => {
                node.bridge_mode = mode;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Snapshot of all nodes, ordered by id.
    pub fn list(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.lock();
        let mut infos: Vec<NodeInfo> = nodes
            .values()
            .map(|n| NodeInfo {
                id: n.id,
                ip: n.ip,
                mac: n.mac.clone(),
                liveness: n.liveness,
                bridge_mode: n.bridge_mode,
                heartbeats: n.heartbeats,
                last_seen_age: n.last_seen.elapsed(),
                bridge_ports: n.bridges.as_ref().map(|b| b.ports()),
            })
            .collect();
        infos.sort_by_key(|n| n.id);
        infos
    }

    pub fn info(&self, id: u32) -> Option<NodeInfo> {
        self.list().into_iter().find(|n| n.id == id)
    }

    /// Mark every live node silent for longer than `threshold` as stale
    /// and hand back its bridges for teardown.
    pub fn sweep_stale(&self, threshold: Duration) -> Vec<(u32, Option<BridgePair>)> {
        let mut nodes = self.nodes.lock();
        let mut swept = Vec::new();
        for node in nodes.values_mut() {
            if node.liveness == Liveness::Live && node.last_seen.elapsed() > threshold {
                node.liveness = Liveness::Stale;
                swept.push((node.id, node.bridges.take()));
            }
        }
        swept
    }

    /// Detach the node's bridges, but only if `generation` still names
    /// the current registration. Cleanup path for a lost main
    /// connection; a newer registration's bridges are left alone.
    pub fn detach_bridges_if(&self, id: u32, generation: u64) -> Option<BridgePair> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&id)?;
        if node.generation == generation {
            node.bridges.take()
        } else {
            None
        }
    }

    /// Detach every bridge pair, for process shutdown.
    pub fn take_all_bridges(&self) -> Vec<BridgePair> {
        let mut nodes = self.nodes.lock();
        nodes.values_mut().filter_map(|n| n.bridges.take()).collect()
    }

    /// Artificially age a node's last-seen time.
    #[cfg(test)]
    pub fn backdate(&self, id: u32, age: Duration) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(&id) {
            node.last_seen = Instant::now() - age;
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
