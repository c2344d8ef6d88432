//! Per-node bridge listeners.
//!
//! Each registered node gets two dedicated TCP ports, one per data
//! stream the node's Wi-Fi module can bridge: the auxiliary I/O stream
//! and the UART stream. Port numbers are derived from a per-stream base
//! port plus the node id, so a node always finds its bridges at a
//! predictable address. Each bridge accepts a single client and feeds
//! every received line into the shared command worklist.

use crate::command::{Source, WorkItem};
use crate::comm::{Communicator, Connection, ConsoleHandle, LineHandler};
use crate::config::{Config, NetworkConfig};
use crate::error::{Error, Result};
use crate::sync::Worklist;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which of a node's two bridged streams a port serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Auxio,
    Uart,
}

impl ChannelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Auxio => "auxio",
            ChannelKind::Uart => "uart",
        }
    }

    fn base_port(&self, net: &NetworkConfig) -> u16 {
        match self {
            ChannelKind::Auxio => net.auxio_base_port,
            ChannelKind::Uart => net.uart_base_port,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Port a given node's bridge for `kind` listens on.
pub fn derived_port(kind: ChannelKind, net: &NetworkConfig, node_id: u32) -> Result<u16> {
    let base = kind.base_port(net) as u32;
    let port = base + node_id;
    if port > u16::MAX as u32 {
        return Err(Error::Config(format!(
            "{} bridge port for node {} would be {}, beyond the valid port range",
            kind, node_id, port
        )));
    }
    Ok(port as u16)
}

/// Append-only log of everything crossing one bridge, one timestamped
/// line per message.
struct Transcript {
    file: Mutex<File>,
}

impl Transcript {
    fn open(dir: &str, node_id: u32, kind: ChannelKind) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = Path::new(dir).join(format!("node{}.{}.trnscr", node_id, kind));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// `mark` is `<` for received lines, `>` for sent ones.
    fn record(&self, mark: char, text: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "[{}.{:03}] {} {}", now.as_secs(), now.subsec_millis(), mark, text) {
            log::warn!("transcript write failed: {}", e);
        }
    }
}

struct BridgeHandler {
    node_id: u32,
    kind: ChannelKind,
    worklist: Worklist<WorkItem>,
    transcript: Option<Arc<Transcript>>,
}

impl LineHandler for BridgeHandler {
    fn on_line(&mut self, conn: &Arc<Connection>, line: &str) -> bool {
        if let Some(t) = &self.transcript {
            t.record('<', line);
        }
        self.worklist
            .push(WorkItem::Line {
                source: Source::Bridge {
                    conn: Arc::clone(conn),
                    node_id: self.node_id,
                    kind: self.kind,
                },
                text: line.to_string(),
            })
            .is_ok()
    }
}

struct BridgeChannel {
    kind: ChannelKind,
    comm: Communicator,
    transcript: Option<Arc<Transcript>>,
}

impl BridgeChannel {
    fn spawn(
        node_id: u32,
        kind: ChannelKind,
        config: &Config,
        worklist: Worklist<WorkItem>,
        console: ConsoleHandle,
    ) -> Result<Self> {
        let port = derived_port(kind, &config.network, node_id)?;
        let transcript = if config.logging.transcript_dir.is_empty() {
            None
        } else {
            Some(Arc::new(Transcript::open(
                &config.logging.transcript_dir,
                node_id,
                kind,
            )?))
        };

        let name = format!("{}{}", kind, node_id);
        let addr = format!("{}:{}", config.network.bind_address, port);
        let handler_transcript = transcript.clone();
        let comm = Communicator::start(
            &name,
            &addr,
            1,
            Box::new(move |_conn| {
                Box::new(BridgeHandler {
                    node_id,
                    kind,
                    worklist: worklist.clone(),
                    transcript: handler_transcript.clone(),
                })
            }),
            console,
        )?;

        Ok(Self {
            kind,
            comm,
            transcript,
        })
    }

    fn send(&self, line: &str) {
        if let Some(t) = &self.transcript {
            t.record('>', line);
        }
        self.comm.send_all(line);
    }
}

/// The two bridge listeners serving one node.
pub struct BridgePair {
    node_id: u32,
    auxio: BridgeChannel,
    uart: BridgeChannel,
}

impl BridgePair {
    pub fn spawn(
        node_id: u32,
        config: &Config,
        worklist: Worklist<WorkItem>,
        console: ConsoleHandle,
    ) -> Result<Self> {
        let auxio = BridgeChannel::spawn(
            node_id,
            ChannelKind::Auxio,
            config,
            worklist.clone(),
            console.clone(),
        )?;
        let uart = BridgeChannel::spawn(node_id, ChannelKind::Uart, config, worklist, console)?;
        Ok(Self {
            node_id,
            auxio,
            uart,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn ports(&self) -> (u16, u16) {
        (self.auxio.comm.port(), self.uart.comm.port())
    }

    /// Queue a line for the client of one of the node's bridges.
    pub fn send(&self, kind: ChannelKind, line: &str) {
        match kind {
            ChannelKind::Auxio => self.auxio.send(line),
            ChannelKind::Uart => self.uart.send(line),
        }
    }

    /// Tear both listeners down and join their threads. The derived
    /// ports are free again once this returns.
    pub fn stop(self) {
        let mut auxio = self.auxio;
        let mut uart = self.uart;
        log::debug!("stopping {} and {} bridges of node {}", auxio.kind, uart.kind, self.node_id);
        auxio.comm.stop();
        uart.comm.stop();
    }
}
