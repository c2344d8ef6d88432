//! Operator console notifications.
//!
//! The server core emits display events (new connections, traffic lines,
//! lifecycle messages) as best-effort notifications: a bounded channel is
//! written with `try_send`, so a slow or absent display collaborator can
//! never block server logic. The default sink renders events through the
//! process log.

use crate::sync::Flag;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capacity of the notification channel; overflow events are dropped.
const CONSOLE_QUEUE_DEPTH: usize = 256;

/// Traffic direction relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A display event emitted by the server core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A connection was established
    Connected { label: String, peer: SocketAddr },
    /// A connection went away
    Disconnected { label: String },
    /// One line of traffic on a connection
    Line {
        label: String,
        dir: Direction,
        text: String,
    },
    /// Process-level event (startup banner, node registered, shutdown)
    Lifecycle(String),
}

/// Receives console events. Implemented by the display collaborator.
pub trait ConsoleSink: Send {
    fn display(&mut self, event: &ConsoleEvent);
}

/// Default sink: renders every event into the process log.
pub struct LogConsole;

impl ConsoleSink for LogConsole {
    fn display(&mut self, event: &ConsoleEvent) {
        match event {
            ConsoleEvent::Connected { label, peer } => {
                log::info!("[{}] connection from {}", label, peer);
            }
            ConsoleEvent::Disconnected { label } => {
                log::info!("[{}] disconnected", label);
            }
            ConsoleEvent::Line { label, dir, text } => {
                let dirchar = match dir {
                    Direction::In => '<',
                    Direction::Out => '>',
                };
                log::debug!("[{}] {} {}", label, dirchar, text);
            }
            ConsoleEvent::Lifecycle(text) => {
                log::info!("{}", text);
            }
        }
    }
}

/// Clonable sender side of the console channel.
#[derive(Clone)]
pub struct ConsoleHandle {
    tx: Sender<ConsoleEvent>,
}

impl ConsoleHandle {
    /// Best-effort delivery: drops the event if the channel is full.
    pub fn notify(&self, event: ConsoleEvent) {
        let _ = self.tx.try_send(event);
    }

    pub fn connected(&self, label: &str, peer: SocketAddr) {
        self.notify(ConsoleEvent::Connected {
            label: label.to_string(),
            peer,
        });
    }

    pub fn disconnected(&self, label: &str) {
        self.notify(ConsoleEvent::Disconnected {
            label: label.to_string(),
        });
    }

    pub fn line(&self, label: &str, dir: Direction, text: &str) {
        self.notify(ConsoleEvent::Line {
            label: label.to_string(),
            dir,
            text: text.to_string(),
        });
    }

    pub fn lifecycle(&self, text: impl Into<String>) {
        self.notify(ConsoleEvent::Lifecycle(text.into()));
    }
}

/// Owns the thread that drains console events into a sink.
pub struct Console {
    shutdown: Flag,
    thread: Option<JoinHandle<()>>,
}

impl Console {
    /// Spawn the console thread around the given sink.
    pub fn spawn(mut sink: Box<dyn ConsoleSink>) -> (Self, ConsoleHandle) {
        let (tx, rx): (Sender<ConsoleEvent>, Receiver<ConsoleEvent>) =
            bounded(CONSOLE_QUEUE_DEPTH);
        let shutdown = Flag::new();
        let shutdown_thread = shutdown.clone();
        let thread = thread::Builder::new()
            .name("console".to_string())
            .spawn(move || {
                while !shutdown_thread.is_set() {
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(event) => sink.display(&event),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Drain whatever is still queued so shutdown banners land.
                while let Ok(event) = rx.try_recv() {
                    sink.display(&event);
                }
            })
            .expect("failed to spawn console thread");
        (
            Self {
                shutdown,
                thread: Some(thread),
            },
            ConsoleHandle { tx },
        )
    }

    pub fn stop(&mut self) {
        self.shutdown.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Test sink that records every event it sees.
    #[derive(Clone, Default)]
    pub struct RecordingConsole {
        pub events: Arc<Mutex<Vec<ConsoleEvent>>>,
    }

    impl ConsoleSink for RecordingConsole {
        fn display(&mut self, event: &ConsoleEvent) {
            self.events.lock().push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingConsole;
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    #[test]
    fn test_events_reach_sink() {
        let sink = RecordingConsole::default();
        let events = sink.events.clone();
        let (mut console, handle) = Console::spawn(Box::new(sink));

        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        handle.connected("main#1", peer);
        handle.line("main#1", Direction::In, "HELLO");
        handle.lifecycle("startup");

        let deadline = Instant::now() + Duration::from_secs(2);
        while events.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        console.stop();

        let seen = events.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[0],
            ConsoleEvent::Connected {
                label: "main#1".to_string(),
                peer
            }
        );
    }

    #[test]
    fn test_notify_never_blocks_when_console_stopped() {
        let (mut console, handle) = Console::spawn(Box::new(LogConsole));
        console.stop();
        // Channel may fill up; every notify must still return promptly.
        for i in 0..CONSOLE_QUEUE_DEPTH * 2 {
            handle.lifecycle(format!("event {}", i));
        }
    }
}
