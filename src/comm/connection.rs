//! A single accepted socket.
//!
//! The handler thread that accepted the connection owns the read side.
//! Writes may originate from any command handler, so they go through a
//! per-connection outbound worklist drained by one writer thread
//! (single-writer discipline; no interleaved output).

use crate::comm::console::{ConsoleHandle, Direction};
use crate::error::Result;
use crate::sync::Worklist;
use parking_lot::Mutex;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeCycle {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// An accepted socket with a serialized write path.
pub struct Connection {
    id: u64,
    label: String,
    peer: SocketAddr,
    stream: TcpStream,
    outbound: Worklist<String>,
    state: Mutex<LifeCycle>,
    writer: Mutex<Option<JoinHandle<()>>>,
    console: ConsoleHandle,
}

impl Connection {
    /// Wrap an accepted stream and start its writer thread.
    pub fn spawn(
        id: u64,
        label: String,
        stream: TcpStream,
        console: ConsoleHandle,
    ) -> std::io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        let write_stream = stream.try_clone()?;
        let outbound: Worklist<String> = Worklist::new(&format!("{}-out", label));

        let conn = Arc::new(Self {
            id,
            label,
            peer,
            stream,
            outbound: outbound.clone(),
            state: Mutex::new(LifeCycle::Active),
            writer: Mutex::new(None),
            console,
        });

        let writer_conn = Arc::clone(&conn);
        let writer = thread::Builder::new()
            .name(format!("{}-writer", conn.label))
            .spawn(move || writer_conn.writer_loop(write_stream))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        *conn.writer.lock() = Some(writer);

        Ok(conn)
    }

    fn writer_loop(&self, mut stream: TcpStream) {
        loop {
            let line = match self.outbound.pop() {
                Ok(line) => line,
                // Queue closed: normal end of the writer's life.
                Err(_) => break,
            };
            if stream
                .write_all(line.as_bytes())
                .and_then(|_| stream.write_all(b"\n"))
                .and_then(|_| stream.flush())
                .is_err()
            {
                log::debug!("[{}] write failed, peer gone", self.label);
                self.mark(LifeCycle::Closing);
                break;
            }
            self.console.line(&self.label, Direction::Out, &line);
        }
    }

    /// Queue a line for transmission. The trailing newline is appended by
    /// the writer thread.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.outbound.push(line.to_string())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> LifeCycle {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), LifeCycle::Connecting | LifeCycle::Active)
    }

    pub(crate) fn mark(&self, state: LifeCycle) {
        *self.state.lock() = state;
    }

    /// Close both directions and stop the writer thread. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == LifeCycle::Closed {
                return;
            }
            *state = LifeCycle::Closing;
        }
        self.outbound.close();
        let _ = self.stream.shutdown(Shutdown::Both);
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        self.mark(LifeCycle::Closed);
        self.console.disconnected(&self.label);
    }
}
