//! cosmicd - coordination server for a distributed cosmic-ray detector
//!
//! Remote sensor nodes phone home to one well-known TCP port, announce
//! themselves with a powerup handshake, and get a pair of dedicated
//! bridge ports in return, one per data stream their Wi-Fi module can
//! relay. From then on every line the server receives, on any port,
//! becomes a work item interpreted by a small pool of command workers
//! against an in-memory model of the sensor network.

pub mod command;
pub mod comm;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod proto;
pub mod server;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
