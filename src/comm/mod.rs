//! Connection framework.
//!
//! - [`Communicator`]: generic accept-loop server with one handler thread
//!   per accepted connection
//! - [`Connection`]: a single accepted socket with serialized writes
//! - [`console`]: best-effort display notifications for the operator

pub mod communicator;
pub mod connection;
pub mod console;

pub use communicator::{Communicator, HandlerFactory, LineHandler};
pub use connection::{Connection, LifeCycle};
pub use console::{Console, ConsoleEvent, ConsoleHandle, ConsoleSink, Direction, LogConsole};
