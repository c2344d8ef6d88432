//! Node-facing servers: the rendezvous main server, per-node bridge
//! listeners, and the registry of node proxies.

pub mod bridge;
pub mod main_server;
pub mod registry;

pub use bridge::{BridgePair, ChannelKind};
pub use main_server::MainServer;
pub use registry::{NodeInfo, NodeRegistry};

use crate::command::WorkItem;
use crate::comm::ConsoleHandle;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto::Handshake;
use crate::sync::Worklist;
use registry::Registration;
use std::net::IpAddr;
use std::sync::Arc;

/// Register a node from a validated powerup message and stand up its
/// bridge pair.
///
/// Used both for the handshake on a fresh main connection and for a
/// `POWERED_ON` line arriving as an ordinary command. When the node id is
/// already registered, the configured re-handshake policy decides whether
/// the old registration (bridges first) is replaced or the new one
/// refused.
pub fn register_node(
    registry: &NodeRegistry,
    config: &Config,
    worklist: &Worklist<WorkItem>,
    console: &ConsoleHandle,
    hs: &Handshake,
    peer_ip: Option<IpAddr>,
) -> Result<u64> {
    if let Some(peer) = peer_ip {
        if peer != hs.ip {
            log::warn!(
                "node {} self-reported IP {} does not match sender address {}; using reported value",
                hs.node_id,
                hs.ip,
                peer
            );
        }
    }

    match registry.register(hs, config.policy.rehandshake) {
        Registration::Rejected => {
            log::warn!(
                "refusing re-handshake for node {}: policy is reject",
                hs.node_id
            );
            Err(Error::AlreadyRegistered(hs.node_id))
        }
        Registration::Accepted {
            previous_bridges,
            generation,
        } => {
            // Old bridges must be gone before the new pair binds the same
            // derived ports.
            if let Some(pair) = previous_bridges {
                log::info!("node {} restarted, tearing down previous bridges", hs.node_id);
                pair.stop();
            }
            let pair = BridgePair::spawn(hs.node_id, config, worklist.clone(), console.clone())?;
            let (auxio_port, uart_port) = pair.ports();
            console.lifecycle(format!(
                "Node {} registered from {} (auxio:{}, uart:{})",
                hs.node_id, hs.ip, auxio_port, uart_port
            ));
            registry.attach_bridges(hs.node_id, generation, pair);
            Ok(generation)
        }
    }
}
