//! The rendezvous server every node contacts first.
//!
//! Nodes only know one well-known address. A fresh connection must open
//! with a powerup handshake line; once that is accepted and the node's
//! bridge pair is up, every further line on the connection is an
//! ordinary command routed through the shared worklist. Connections
//! that fail to hand-shake in time, or that open with garbage, are
//! dropped.

use crate::command::{Source, WorkItem};
use crate::comm::{Communicator, Connection, ConsoleHandle, LineHandler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto;
use crate::server::{register_node, NodeRegistry};
use crate::sync::Worklist;
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on concurrently connected nodes.
const MAX_MAIN_CLIENTS: usize = 64;

enum HandshakeState {
    /// No valid powerup line yet; the connection is dropped at `deadline`.
    Awaiting { deadline: Instant },
    Registered { node_id: u32, generation: u64 },
}

struct MainHandler {
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    worklist: Worklist<WorkItem>,
    console: ConsoleHandle,
    state: HandshakeState,
}

impl MainHandler {
    fn handle_handshake(&mut self, conn: &Arc<Connection>, line: &str) -> bool {
        let hs = match proto::parse_handshake(line) {
            Ok(hs) => hs,
            Err(e) => {
                log::warn!("[{}] bad handshake from {}: {}", conn.label(), conn.peer(), e);
                let _ = conn.send_line("ERR bad handshake");
                return false;
            }
        };
        match register_node(
            &self.registry,
            &self.config,
            &self.worklist,
            &self.console,
            &hs,
            Some(conn.peer().ip()),
        ) {
            Ok(generation) => {
                self.state = HandshakeState::Registered {
                    node_id: hs.node_id,
                    generation,
                };
                true
            }
            Err(Error::AlreadyRegistered(id)) => {
                let _ = conn.send_line(&format!("ERR node {} already registered", id));
                false
            }
            Err(e) => {
                log::error!("failed to bring node {} online: {}", hs.node_id, e);
                let _ = conn.send_line("ERR internal error");
                false
            }
        }
    }
}

impl LineHandler for MainHandler {
    fn on_line(&mut self, conn: &Arc<Connection>, line: &str) -> bool {
        match self.state {
            HandshakeState::Awaiting { .. } => self.handle_handshake(conn, line),
            HandshakeState::Registered { node_id, .. } => self
                .worklist
                .push(WorkItem::Line {
                    source: Source::Main {
                        conn: Arc::clone(conn),
                        node_id: Some(node_id),
                    },
                    text: line.to_string(),
                })
                .is_ok(),
        }
    }

    fn on_idle(&mut self, conn: &Arc<Connection>) -> bool {
        if let HandshakeState::Awaiting { deadline } = self.state {
            if Instant::now() >= deadline {
                let timeout = self.config.timing.handshake_timeout();
                log::warn!(
                    "[{}] {}: dropping connection from {}",
                    conn.label(),
                    Error::HandshakeTimeout(timeout),
                    conn.peer()
                );
                return false;
            }
        }
        true
    }

    /// Losing the main connection tears down the node's bridges. The
    /// generation check means a connection replaced by a re-handshake
    /// cannot take down its successor's bridges.
    fn on_disconnect(&mut self, _conn: &Arc<Connection>) {
        if let HandshakeState::Registered { node_id, generation } = self.state {
            if let Some(pair) = self.registry.detach_bridges_if(node_id, generation) {
                log::warn!(
                    "{}; closing its bridges",
                    Error::ConnectionLost(format!("node {}", node_id))
                );
                pair.stop();
            }
        }
    }
}

/// The well-known-port listener, wrapped around a [`Communicator`].
pub struct MainServer {
    comm: Communicator,
}

impl MainServer {
    pub fn start(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        worklist: Worklist<WorkItem>,
        console: ConsoleHandle,
    ) -> Result<Self> {
        let addr = config.network.rendezvous_address();
        let factory_console = console.clone();
        let comm = Communicator::start(
            "main",
            &addr,
            MAX_MAIN_CLIENTS,
            Box::new(move |_conn| {
                Box::new(MainHandler {
                    config: Arc::clone(&config),
                    registry: Arc::clone(&registry),
                    worklist: worklist.clone(),
                    console: factory_console.clone(),
                    state: HandshakeState::Awaiting {
                        deadline: Instant::now() + config.timing.handshake_timeout(),
                    },
                })
            }),
            console,
        )?;
        Ok(Self { comm })
    }

    pub fn port(&self) -> u16 {
        self.comm.port()
    }

    pub fn stop(&mut self) {
        self.comm.stop();
    }
}
