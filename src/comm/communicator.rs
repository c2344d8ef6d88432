//! Generic accept-loop-plus-handler-thread server.
//!
//! A `Communicator` binds one port, accepts connections on a dedicated
//! listener thread, and runs one handler thread per accepted connection.
//! What happens to each framed line is decided by the handler the
//! injected factory produces, so the same machinery serves the main
//! rendezvous port and every per-node bridge.

use crate::comm::connection::{Connection, LifeCycle};
use crate::comm::console::{ConsoleHandle, Direction};
use crate::error::{Error, Result};
use crate::sync::Flag;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval of the accept loop between shutdown checks
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Socket read timeout; bounds how long a handler thread can ignore the
/// shutdown flag
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest accepted unterminated line. A peer that streams bytes without
/// ever sending a newline is disconnected once its buffer passes this.
const MAX_LINE_LEN: usize = 8 * 1024;

/// Per-connection protocol logic, produced by the handler factory.
///
/// `on_line` and `on_idle` return `false` to ask for the connection to be
/// closed.
pub trait LineHandler: Send {
    fn on_connect(&mut self, _conn: &Arc<Connection>) {}

    /// One framed line arrived (newline stripped).
    fn on_line(&mut self, conn: &Arc<Connection>, line: &str) -> bool;

    /// Called at least once per read-timeout interval, whether or not
    /// bytes are arriving, so handlers can enforce deadlines even on a
    /// connection that trickles traffic. Default: keep waiting.
    fn on_idle(&mut self, _conn: &Arc<Connection>) -> bool {
        true
    }

    fn on_disconnect(&mut self, _conn: &Arc<Connection>) {}
}

/// Produces one handler per accepted connection.
pub type HandlerFactory = Box<dyn FnMut(&Arc<Connection>) -> Box<dyn LineHandler> + Send>;

struct Shared {
    name: String,
    conns: Mutex<Vec<Arc<Connection>>>,
    handler_threads: Mutex<Vec<JoinHandle<()>>>,
    next_cid: AtomicU64,
    shutdown: Flag,
    console: ConsoleHandle,
}

/// One listening port plus its accept loop and handler threads.
pub struct Communicator {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
}

impl Communicator {
    /// Bind `addr` and start accepting.
    ///
    /// Fails fast with [`Error::Bind`] if the port is already in use.
    /// `max_clients` bounds concurrently active connections; extra
    /// connection attempts are dropped with a warning.
    pub fn start(
        name: &str,
        addr: &str,
        max_clients: usize,
        factory: HandlerFactory,
        console: ConsoleHandle,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| {
            let port = addr.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0);
            if e.kind() == ErrorKind::AddrInUse {
                Error::Bind { port, source: e }
            } else {
                Error::Io(e)
            }
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            name: name.to_string(),
            conns: Mutex::new(Vec::new()),
            handler_threads: Mutex::new(Vec::new()),
            next_cid: AtomicU64::new(0),
            shutdown: Flag::new(),
            console,
        });

        log::info!("[{}] listening on {}", name, local_addr);

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name(format!("{}-accept", name))
            .spawn(move || accept_loop(accept_shared, listener, max_clients, factory))
            .map_err(|e| Error::Other(format!("failed to spawn accept thread: {}", e)))?;

        Ok(Self {
            shared,
            local_addr,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Snapshot of currently open connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .conns
            .lock()
            .iter()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    /// Queue a line on every open connection.
    pub fn send_all(&self, line: &str) {
        for conn in self.connections() {
            if let Err(e) = conn.send_line(line) {
                log::debug!("[{}] send to {} failed: {}", self.shared.name, conn.peer(), e);
            }
        }
    }

    /// Stop accepting, close every connection, and join all threads.
    pub fn stop(&mut self) {
        self.shared.shutdown.set();
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        let conns: Vec<_> = self.shared.conns.lock().drain(..).collect();
        for conn in conns {
            conn.close();
        }
        let threads: Vec<_> = self.shared.handler_threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
        log::info!("[{}] stopped", self.shared.name);
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if self.accept_thread.is_some() {
            self.stop();
        }
    }
}

fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    max_clients: usize,
    mut factory: HandlerFactory,
) {
    while !shared.shutdown.is_set() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let open_count = {
                    let mut conns = shared.conns.lock();
                    conns.retain(|c| c.is_open());
                    conns.len()
                };
                if open_count >= max_clients {
                    log::warn!(
                        "[{}] rejecting connection from {}: {} client(s) already active",
                        shared.name,
                        peer,
                        open_count
                    );
                    drop(stream);
                    continue;
                }
                if let Err(e) = register_connection(&shared, stream, peer, &mut factory) {
                    log::error!("[{}] failed to set up connection from {}: {}", shared.name, peer, e);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                // No connection pending.
                shared.shutdown.wait_timeout(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!("[{}] accept error: {}", shared.name, e);
            }
        }
    }
}

fn register_connection(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    factory: &mut HandlerFactory,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let read_stream = stream.try_clone()?;

    let cid = shared.next_cid.fetch_add(1, Ordering::Relaxed);
    let label = format!("{}#{}", shared.name, cid);
    let conn = Connection::spawn(cid, label.clone(), stream, shared.console.clone())?;

    shared.console.connected(&label, peer);
    let handler = factory(&conn);

    let loop_shared = Arc::clone(shared);
    let loop_conn = Arc::clone(&conn);
    let handle = thread::Builder::new()
        .name(label)
        .spawn(move || connection_loop(loop_shared, loop_conn, read_stream, handler))
        .map_err(|e| Error::Other(format!("failed to spawn handler thread: {}", e)))?;

    shared.handler_threads.lock().push(handle);
    shared.conns.lock().push(conn);
    Ok(())
}

/// Read loop of one handler thread. Frames bytes into lines and feeds
/// them to the connection's handler.
fn connection_loop(
    shared: Arc<Shared>,
    conn: Arc<Connection>,
    stream: TcpStream,
    mut handler: Box<dyn LineHandler>,
) {
    handler.on_connect(&conn);

    let mut stream = stream;
    let mut buf = [0u8; 1024];
    let mut pending: Vec<u8> = Vec::new();
    let mut last_idle = Instant::now();

    'read: loop {
        if shared.shutdown.is_set() || !conn.is_open() {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                log::debug!("[{}] peer {} closed the connection", conn.label(), conn.peer());
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let Ok(text) = std::str::from_utf8(&raw) else {
                        // Non-UTF-8 input: reject the connection, leave
                        // everything else untouched.
                        log::warn!("[{}] non-text input from {}, closing", conn.label(), conn.peer());
                        break 'read;
                    };
                    let text = text.trim_end_matches(&['\r', '\n'][..]);
                    shared.console.line(conn.label(), Direction::In, text);
                    if !handler.on_line(&conn, text) {
                        break 'read;
                    }
                }
                if pending.len() > MAX_LINE_LEN {
                    log::warn!(
                        "[{}] unterminated line from {} exceeds {} bytes, closing",
                        conn.label(),
                        conn.peer(),
                        MAX_LINE_LEN
                    );
                    break;
                }
                // Even a steady byte trickle must not starve the idle
                // callback; handler deadlines hang off it.
                if last_idle.elapsed() >= READ_TIMEOUT {
                    last_idle = Instant::now();
                    if !handler.on_idle(&conn) {
                        break;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                // Timeout tick; partial line bytes stay buffered in `pending`.
                last_idle = Instant::now();
                if !handler.on_idle(&conn) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!(
                    "[{}] {}: {}",
                    conn.label(),
                    Error::ConnectionLost(conn.peer().to_string()),
                    e
                );
                break;
            }
        }
    }

    handler.on_disconnect(&conn);
    conn.mark(LifeCycle::Closing);
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::console::{Console, LogConsole};
    use crate::sync::Worklist;
    use std::io::{BufRead, BufReader, Write};

    struct PushHandler {
        worklist: Worklist<String>,
    }

    impl LineHandler for PushHandler {
        fn on_line(&mut self, _conn: &Arc<Connection>, line: &str) -> bool {
            self.worklist.push(line.to_string()).is_ok()
        }
    }

    fn start_push_server(max_clients: usize) -> (Communicator, Worklist<String>, Console) {
        let (console, handle) = Console::spawn(Box::new(LogConsole));
        let worklist: Worklist<String> = Worklist::new("test-lines");
        let factory_wl = worklist.clone();
        let comm = Communicator::start(
            "test",
            "127.0.0.1:0",
            max_clients,
            Box::new(move |_conn| {
                Box::new(PushHandler {
                    worklist: factory_wl.clone(),
                })
            }),
            handle,
        )
        .unwrap();
        (comm, worklist, console)
    }

    #[test]
    fn test_lines_are_framed_and_queued_in_order() {
        let (mut comm, worklist, _console) = start_push_server(8);
        let mut client = TcpStream::connect(comm.local_addr()).unwrap();
        client.write_all(b"first 1\r\nsecond 2\nthird 3\n").unwrap();
        client.flush().unwrap();

        assert_eq!(worklist.pop_timeout(Duration::from_secs(2)).unwrap().unwrap(), "first 1");
        assert_eq!(worklist.pop_timeout(Duration::from_secs(2)).unwrap().unwrap(), "second 2");
        assert_eq!(worklist.pop_timeout(Duration::from_secs(2)).unwrap().unwrap(), "third 3");
        comm.stop();
    }

    #[test]
    fn test_bind_conflict_fails_fast() {
        let (comm, _worklist, _console) = start_push_server(8);
        let addr = format!("127.0.0.1:{}", comm.port());
        let (console2, handle2) = Console::spawn(Box::new(LogConsole));
        let result = Communicator::start(
            "dup",
            &addr,
            8,
            Box::new(|_conn| {
                Box::new(PushHandler {
                    worklist: Worklist::new("unused"),
                })
            }),
            handle2,
        );
        assert!(matches!(result, Err(Error::Bind { port, .. }) if port == comm.port()));
        drop(console2);
    }

    #[test]
    fn test_max_clients_enforced() {
        let (mut comm, worklist, _console) = start_push_server(1);
        let mut first = TcpStream::connect(comm.local_addr()).unwrap();
        first.write_all(b"hold 0\n").unwrap();
        // Wait until the first client is registered before poking a second.
        assert!(worklist.pop_timeout(Duration::from_secs(2)).unwrap().is_some());

        let mut second = TcpStream::connect(comm.local_addr()).unwrap();
        second.write_all(b"extra 0\n").ok();
        // The rejected client's line must never show up.
        assert!(worklist.pop_timeout(Duration::from_millis(300)).unwrap().is_none());
        assert_eq!(comm.connections().len(), 1);
        comm.stop();
    }

    struct DeadlineHandler {
        deadline: Instant,
    }

    impl LineHandler for DeadlineHandler {
        fn on_line(&mut self, _conn: &Arc<Connection>, _line: &str) -> bool {
            true
        }

        fn on_idle(&mut self, _conn: &Arc<Connection>) -> bool {
            Instant::now() < self.deadline
        }
    }

    #[test]
    fn test_idle_deadline_fires_despite_byte_trickle() {
        let (console, handle) = Console::spawn(Box::new(LogConsole));
        let mut comm = Communicator::start(
            "deadline",
            "127.0.0.1:0",
            8,
            Box::new(|_conn| {
                Box::new(DeadlineHandler {
                    deadline: Instant::now() + Duration::from_secs(1),
                })
            }),
            handle,
        )
        .unwrap();

        // One byte every 100 ms, never a newline. The deadline must still
        // cut the connection off.
        let mut client = TcpStream::connect(comm.local_addr()).unwrap();
        let mut cut_off = false;
        for _ in 0..40 {
            if client.write_all(b"x").is_err() {
                cut_off = true;
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        assert!(cut_off, "connection survived past the idle deadline");
        comm.stop();
        drop(console);
    }

    #[test]
    fn test_unterminated_line_is_bounded() {
        let (mut comm, worklist, _console) = start_push_server(8);
        let mut client = TcpStream::connect(comm.local_addr()).unwrap();
        let chunk = vec![b'a'; 4096];
        // Well past the line cap without ever sending a newline.
        for _ in 0..4 {
            if client.write_all(&chunk).is_err() {
                break;
            }
        }
        let mut reader = BufReader::new(client);
        let mut buf = String::new();
        assert_eq!(reader.read_line(&mut buf).unwrap_or(0), 0);
        // The fragment never reached the handler as a line.
        assert!(worklist.pop_timeout(Duration::from_millis(200)).unwrap().is_none());
        comm.stop();
    }

    #[test]
    fn test_stop_closes_connections_promptly() {
        let (mut comm, _worklist, _console) = start_push_server(8);
        let client = TcpStream::connect(comm.local_addr()).unwrap();
        // Give the accept loop a chance to register the connection.
        let deadline = Instant::now() + Duration::from_secs(2);
        while comm.connections().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let started = Instant::now();
        comm.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        // Peer observes EOF.
        let mut reader = BufReader::new(client);
        let mut buf = String::new();
        assert_eq!(reader.read_line(&mut buf).unwrap_or(0), 0);
    }
}
