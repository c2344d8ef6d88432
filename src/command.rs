//! Command dispatch.
//!
//! Every line the servers receive, wherever it arrived, becomes a
//! [`WorkItem`] on one shared worklist. A small pool of worker threads
//! pops items and runs them through the [`Dispatcher`]. Commands naming
//! the same node are serialized by a per-node guard so two workers never
//! mutate one node's state at the same time; commands for different
//! nodes run in parallel.

use crate::comm::{Connection, ConsoleHandle};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto::{self, CommandLine, POWERUP_VERB};
use crate::server::registry::BridgeMode;
use crate::server::{register_node, ChannelKind, NodeRegistry};
use crate::sync::{Flag, Worklist};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Worker threads draining the command worklist
pub const COMMAND_WORKERS: usize = 2;

/// Where a command line came from.
pub enum Source {
    /// The node's connection to the rendezvous port. `node_id` is set
    /// once the connection has hand-shaken.
    Main {
        conn: Arc<Connection>,
        node_id: Option<u32>,
    },
    /// One of a node's bridge listeners.
    Bridge {
        conn: Arc<Connection>,
        node_id: u32,
        kind: ChannelKind,
    },
    /// Injected by the server itself.
    Local,
}

impl Source {
    pub fn node_id(&self) -> Option<u32> {
        match self {
            Source::Main { node_id, .. } => *node_id,
            Source::Bridge { node_id, .. } => Some(*node_id),
            Source::Local => None,
        }
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            Source::Main { conn, .. } | Source::Bridge { conn, .. } => Some(conn.peer().ip()),
            Source::Local => None,
        }
    }

    /// Send a response back where the command came from. Local commands
    /// get their response through the log.
    pub fn reply(&self, line: &str) {
        match self {
            Source::Main { conn, .. } | Source::Bridge { conn, .. } => {
                if let Err(e) = conn.send_line(line) {
                    log::debug!("[{}] reply dropped: {}", conn.label(), e);
                }
            }
            Source::Local => log::info!("{}", line),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Main { conn, node_id } => f
                .debug_struct("Main")
                .field("conn", &conn.label())
                .field("node_id", node_id)
                .finish(),
            Source::Bridge {
                conn,
                node_id,
                kind,
            } => f
                .debug_struct("Bridge")
                .field("conn", &conn.label())
                .field("node_id", node_id)
                .field("kind", kind)
                .finish(),
            Source::Local => f.write_str("Local"),
        }
    }
}

/// One unit of work for the command pool.
#[derive(Debug)]
pub enum WorkItem {
    /// A received line to interpret
    Line { source: Source, text: String },
    /// Periodic pulse from the server heartbeat
    Tick { beat: u64 },
    /// Ask the whole process to wind down
    Shutdown,
}

/// Serializes work per node id across the worker pool.
struct NodeGuard {
    busy: Mutex<HashSet<u32>>,
    freed: Condvar,
}

struct NodeHold<'a> {
    guard: &'a NodeGuard,
    id: u32,
}

impl NodeGuard {
    fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
            freed: Condvar::new(),
        }
    }

    /// Blocks until no other worker holds `id`.
    fn hold(&self, id: u32) -> NodeHold<'_> {
        let mut busy = self.busy.lock();
        while busy.contains(&id) {
            self.freed.wait(&mut busy);
        }
        busy.insert(id);
        NodeHold { guard: self, id }
    }
}

impl Drop for NodeHold<'_> {
    fn drop(&mut self) {
        let mut busy = self.guard.busy.lock();
        busy.remove(&self.id);
        self.guard.freed.notify_all();
    }
}

/// Interprets work items against the registry and configuration.
pub struct Dispatcher {
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    worklist: Worklist<WorkItem>,
    console: ConsoleHandle,
    shutdown: Flag,
    guard: NodeGuard,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        worklist: Worklist<WorkItem>,
        console: ConsoleHandle,
        shutdown: Flag,
    ) -> Self {
        Self {
            config,
            registry,
            worklist,
            console,
            shutdown,
            guard: NodeGuard::new(),
        }
    }

    pub fn handle(&self, item: WorkItem) {
        match item {
            WorkItem::Line { source, text } => self.handle_line(&source, &text),
            WorkItem::Tick { beat } => self.tick(beat),
            WorkItem::Shutdown => {
                log::info!("shutdown work item received");
                self.shutdown.set();
            }
        }
    }

    fn handle_line(&self, source: &Source, text: &str) {
        let cmd = match proto::parse_command(text) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("ignoring malformed command {:?}: {}", text, e);
                source.reply("ERR malformed command");
                return;
            }
        };

        // Commands naming a node run one at a time for that node.
        let subject = proto::parse_node_id(&cmd).ok().or_else(|| source.node_id());
        let _hold = subject.map(|id| self.guard.hold(id));

        // Any line from an identifiable node counts as liveness, whether or
        // not the verb is one we understand. Powerup goes through the full
        // registration path instead.
        if cmd.verb != POWERUP_VERB {
            if let Some(id) = subject {
                self.registry.touch(id, source.peer_ip());
            }
        }

        match cmd.verb.as_str() {
            POWERUP_VERB => self.cmd_powered_on(source, text),
            "LOGMSG" => self.cmd_logmsg(&cmd),
            "HEARTBEAT" => self.cmd_heartbeat(&cmd),
            "BRIDGE_MODE" => self.cmd_bridge_mode(&cmd),
            "PONG" => self.cmd_pong(&cmd),
            "LIST_NODES" => self.cmd_list_nodes(source),
            "SHUTDOWN" => {
                log::info!("shutdown commanded from {:?}", source);
                self.console.lifecycle("shutdown requested");
                source.reply("OK shutting down");
                self.shutdown.set();
            }
            other => {
                log::warn!("unknown command {:?} from {:?}", other, source);
                source.reply(&format!("ERR unknown command {}", other));
            }
        }
    }

    /// A powerup message arriving outside the handshake position, over
    /// an already-established main connection or a bridge.
    fn cmd_powered_on(&self, source: &Source, raw: &str) {
        let hs = match proto::parse_handshake(raw) {
            Ok(hs) => hs,
            Err(e) => {
                log::warn!("bad powerup message from {:?}: {}", source, e);
                source.reply("ERR bad handshake");
                return;
            }
        };
        match register_node(
            &self.registry,
            &self.config,
            &self.worklist,
            &self.console,
            &hs,
            source.peer_ip(),
        ) {
            Ok(_) => {}
            Err(Error::AlreadyRegistered(id)) => {
                source.reply(&format!("ERR node {} already registered", id));
            }
            Err(e) => {
                log::error!("failed to bring node {} online: {}", hs.node_id, e);
                source.reply("ERR internal error");
            }
        }
    }

    fn cmd_logmsg(&self, cmd: &CommandLine) {
        // LOGMSG <nodenum> <level> <depth> <message...>
        if cmd.args.len() < 4 {
            log::warn!(
                "LOGMSG has {} argument(s) after the verb; at least 4 were expected",
                cmd.args.len()
            );
            return;
        }
        let Ok(id) = proto::parse_node_id(cmd) else {
            log::warn!("LOGMSG with unparsable node id {:?}; ignoring", cmd.args[0]);
            return;
        };
        let level = level_by_name(&cmd.args[1]);
        let depth: usize = cmd.args[2].parse().unwrap_or(0);
        let message = cmd.args[3..].join(" ");
        let indent = "  ".repeat(depth);
        log::log!(level, "Node {}: {}{}", id, indent, message);
    }

    fn cmd_heartbeat(&self, cmd: &CommandLine) {
        // HEARTBEAT <nodenum> <hbnum>
        if cmd.args.len() != 2 {
            log::warn!(
                "HEARTBEAT has {} argument(s) after the verb; 2 were expected",
                cmd.args.len()
            );
            return;
        }
        let Ok(id) = proto::parse_node_id(cmd) else {
            log::warn!("HEARTBEAT with unparsable node id {:?}; ignoring", cmd.args[0]);
            return;
        };
        match self.registry.record_heartbeat(id) {
            Some(count) => {
                log::info!("Heartbeat #{} received from node {} ({} total)", cmd.args[1], id, count);
            }
            None => log::warn!("heartbeat for node {} which is not registered", id),
        }
    }

    fn cmd_bridge_mode(&self, cmd: &CommandLine) {
        // BRIDGE_MODE <nodenum> <bmname>
        if cmd.args.len() != 2 {
            log::warn!(
                "BRIDGE_MODE has {} argument(s) after the verb; 2 were expected",
                cmd.args.len()
            );
            return;
        }
        let Ok(id) = proto::parse_node_id(cmd) else {
            log::warn!("BRIDGE_MODE with unparsable node id {:?}; ignoring", cmd.args[0]);
            return;
        };
        let mode = BridgeMode::from_report(&cmd.args[1]);
        if mode == BridgeMode::Unsupported {
            log::warn!("node {} reports unsupported bridging mode {:?}", id, cmd.args[1]);
        }
        if self.registry.set_bridge_mode(id, mode) {
            log::info!("Node {} reports that its bridging mode is now {}.", id, mode);
        }
    }

    fn cmd_pong(&self, cmd: &CommandLine) {
        // PONG <nodenum> <seqno>
        if cmd.args.len() != 2 {
            log::warn!(
                "PONG has {} argument(s) after the verb; 2 were expected",
                cmd.args.len()
            );
            return;
        }
        if let Ok(id) = proto::parse_node_id(cmd) {
            log::debug!("PONG #{} from node {}", cmd.args[1], id);
        }
    }

    fn cmd_list_nodes(&self, source: &Source) {
        let infos = self.registry.list();
        for info in &infos {
            let (auxio, uart) = match info.bridge_ports {
                Some((a, u)) => (a.to_string(), u.to_string()),
                None => ("-".to_string(), "-".to_string()),
            };
            source.reply(&format!(
                "NODE {} ip={} mac={} state={} mode={} beats={} seen={}s auxio={} uart={}",
                info.id,
                info.ip,
                if info.mac.is_empty() { "?" } else { &info.mac },
                info.liveness,
                info.bridge_mode,
                info.heartbeats,
                info.last_seen_age.as_secs(),
                auxio,
                uart
            ));
        }
        source.reply(&format!("OK {} node(s)", infos.len()));
    }

    /// Server heartbeat pulse: log it and retire nodes that have gone
    /// quiet for longer than the staleness threshold.
    fn tick(&self, beat: u64) {
        log::info!("Server heartbeat #{}", beat);
        let threshold = self.config.timing.staleness_threshold();
        for (id, bridges) in self.registry.sweep_stale(threshold) {
            log::warn!(
                "node {} has been silent for over {:?}, marking it stale",
                id,
                threshold
            );
            self.console.lifecycle(format!("Node {} went stale", id));
            if let Some(pair) = bridges {
                pair.stop();
            }
        }
    }
}

fn level_by_name(name: &str) -> log::Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" | "verbose" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "info" | "normal" | "notice" => log::Level::Info,
        "warn" | "warning" => log::Level::Warn,
        "error" | "critical" | "fatal" => log::Level::Error,
        _ => log::Level::Info,
    }
}

/// The worker pool draining the shared worklist.
pub struct CommandProcessor {
    worklist: Worklist<WorkItem>,
    workers: Vec<JoinHandle<()>>,
}

impl CommandProcessor {
    pub fn spawn(dispatcher: Arc<Dispatcher>, workers: usize) -> Result<Self> {
        let worklist = dispatcher.worklist.clone();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let dispatcher = Arc::clone(&dispatcher);
            let handle = thread::Builder::new()
                .name(format!("command-{}", i))
                .spawn(move || worker_loop(dispatcher))
                .map_err(|e| Error::Other(format!("failed to spawn command worker: {}", e)))?;
            handles.push(handle);
        }
        Ok(Self {
            worklist,
            workers: handles,
        })
    }

    /// Close the worklist and wait for the workers to drain it.
    pub fn stop(&mut self) {
        self.worklist.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        log::info!("command processor stopped");
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

fn worker_loop(dispatcher: Arc<Dispatcher>) {
    loop {
        match dispatcher.worklist.pop() {
            Ok(item) => dispatcher.handle(item),
            // Worklist closed and drained.
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Console, LogConsole};
    use crate::config::RehandshakePolicy;
    use crate::proto::Handshake;
    use crate::server::registry::Liveness;
    use std::io::{BufRead, BufReader};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_dispatcher(auxio_base: u16, uart_base: u16) -> (Arc<Dispatcher>, Arc<NodeRegistry>, Flag, Console) {
        let mut config = Config::site_defaults();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.auxio_base_port = auxio_base;
        config.network.uart_base_port = uart_base;
        // Staleness threshold of 60 seconds, well under the backdates
        // the tests apply.
        config.timing.heartbeat_interval_secs = 30;
        config.timing.staleness_multiplier = 2;
        config.logging.transcript_dir = String::new();
        let (console, handle) = Console::spawn(Box::new(LogConsole));
        let registry = Arc::new(NodeRegistry::new());
        let shutdown = Flag::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(config),
            Arc::clone(&registry),
            Worklist::new("commands"),
            handle,
            shutdown.clone(),
        ));
        (dispatcher, registry, shutdown, console)
    }

    fn seed_node(registry: &NodeRegistry, id: u32) {
        let hs = Handshake {
            node_id: id,
            ip: "127.0.0.1".parse().unwrap(),
            mac: "00:1E:3D:33:FE:0D".to_string(),
        };
        registry.register(&hs, RehandshakePolicy::Replace);
    }

    fn line(text: &str) -> WorkItem {
        WorkItem::Line {
            source: Source::Local,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_heartbeat_command_counts_and_touches() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46110, 46210);
        seed_node(&registry, 1);
        registry.backdate(1, Duration::from_secs(180));

        dispatcher.handle(line("HEARTBEAT 1 7"));
        let info = registry.info(1).unwrap();
        assert_eq!(info.heartbeats, 1);
        // touch() refreshed last_seen, so a sweep finds nothing.
        assert!(registry.sweep_stale(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_bridge_mode_command_updates_model() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46120, 46220);
        seed_node(&registry, 2);
        dispatcher.handle(line("BRIDGE_MODE 2 UART-ONLY"));
        assert_eq!(registry.info(2).unwrap().bridge_mode, BridgeMode::Uart);
    }

    #[test]
    fn test_logmsg_arity_is_enforced() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46130, 46230);
        seed_node(&registry, 1);
        registry.backdate(1, Duration::from_secs(180));
        // Too few arguments: the message itself is dropped, but traffic
        // from the node still counts as liveness.
        dispatcher.handle(line("LOGMSG 1 info"));
        assert_eq!(registry.info(1).unwrap().heartbeats, 0);
        assert!(registry.sweep_stale(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_bridge_traffic_refreshes_liveness() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46310, 46410);
        seed_node(&registry, 1);
        registry.backdate(1, Duration::from_secs(180));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let (_bridge_console, handle) = Console::spawn(Box::new(LogConsole));
        let conn = Connection::spawn(0, "auxio1#0".to_string(), accepted, handle).unwrap();

        // Free-form detector data: not a verb the dispatcher knows, but
        // still proof the node is alive.
        dispatcher.handle(WorkItem::Line {
            source: Source::Bridge {
                conn: Arc::clone(&conn),
                node_id: 1,
                kind: ChannelKind::Auxio,
            },
            text: "GPS_DATA 12.5".to_string(),
        });
        assert!(registry.sweep_stale(Duration::from_secs(60)).is_empty());
        conn.close();
        drop(client);
    }

    #[test]
    fn test_powered_on_command_registers_node() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46140, 46240);
        dispatcher.handle(line("POWERED_ON 5 127.0.0.1 00:1E:3D:33:FE:0D"));
        let info = registry.info(5).expect("node 5 registered");
        assert_eq!(info.bridge_ports, Some((46145, 46245)));
        for pair in registry.take_all_bridges() {
            pair.stop();
        }
    }

    #[test]
    fn test_shutdown_command_raises_flag() {
        let (dispatcher, _registry, shutdown, _console) = test_dispatcher(46150, 46250);
        assert!(!shutdown.is_set());
        dispatcher.handle(line("SHUTDOWN"));
        assert!(shutdown.is_set());
    }

    #[test]
    fn test_shutdown_work_item_raises_flag() {
        let (dispatcher, _registry, shutdown, _console) = test_dispatcher(46180, 46280);
        dispatcher.handle(WorkItem::Shutdown);
        assert!(shutdown.is_set());
    }

    #[test]
    fn test_tick_sweeps_silent_nodes() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46160, 46260);
        seed_node(&registry, 1);
        seed_node(&registry, 2);
        registry.backdate(2, Duration::from_secs(180));

        dispatcher.handle(WorkItem::Tick { beat: 1 });
        assert_eq!(registry.info(1).unwrap().liveness, Liveness::Live);
        assert_eq!(registry.info(2).unwrap().liveness, Liveness::Stale);
    }

    #[test]
    fn test_list_nodes_and_unknown_verb_replies() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46190, 46290);
        seed_node(&registry, 1);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let (_reply_console, handle) = Console::spawn(Box::new(LogConsole));
        let conn = Connection::spawn(0, "test#0".to_string(), accepted, handle).unwrap();

        let from_conn = |text: &str| WorkItem::Line {
            source: Source::Main {
                conn: Arc::clone(&conn),
                node_id: None,
            },
            text: text.to_string(),
        };
        dispatcher.handle(from_conn("LIST_NODES"));
        dispatcher.handle(from_conn("FROBNICATE 1"));

        let mut reader = BufReader::new(client);
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert!(reply.starts_with("NODE 1 ip=127.0.0.1"), "got {:?}", reply);
        reply.clear();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply.trim_end(), "OK 1 node(s)");
        reply.clear();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply.trim_end(), "ERR unknown command FROBNICATE");
        conn.close();
    }

    #[test]
    fn test_node_guard_serializes_same_node() {
        let guard = Arc::new(NodeGuard::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let guard = Arc::clone(&guard);
            let concurrent = Arc::clone(&concurrent);
            let overlap = Arc::clone(&overlap);
            threads.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _hold = guard.hold(9);
                    if concurrent.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(200));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_node_guard_allows_distinct_nodes() {
        let guard = NodeGuard::new();
        let _a = guard.hold(1);
        // Must not block.
        let _b = guard.hold(2);
    }

    #[test]
    fn test_processor_drains_queue_on_stop() {
        let (dispatcher, registry, _shutdown, _console) = test_dispatcher(46170, 46270);
        seed_node(&registry, 1);
        let worklist = dispatcher.worklist.clone();
        let mut processor = CommandProcessor::spawn(Arc::clone(&dispatcher), COMMAND_WORKERS).unwrap();

        for i in 0..10 {
            worklist.push(line(&format!("HEARTBEAT 1 {}", i))).unwrap();
        }
        processor.stop();
        assert_eq!(registry.info(1).unwrap().heartbeats, 10);
    }
}
