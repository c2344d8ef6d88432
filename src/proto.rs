//! Line-oriented wire grammar.
//!
//! All traffic is ASCII text, space-separated fields, newline-terminated.
//! The first line a node sends on its main connection must be the powerup
//! message:
//!
//! ```text
//! POWERED_ON <node_id> <ip_address> <mac_address>
//! ```
//!
//! Every later line is a free-form command: a verb followed by arguments.
//! The verb set is extensible; node-scoped verbs carry the node id as
//! their first argument.

use crate::error::{Error, Result};
use std::net::IpAddr;

/// Verb that opens every handshake line
pub const POWERUP_VERB: &str = "POWERED_ON";

/// Parsed powerup message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub node_id: u32,
    pub ip: IpAddr,
    pub mac: String,
}

/// Parsed command line: verb plus argument words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub verb: String,
    pub args: Vec<String>,
}

/// Parse the powerup message a node must send first on its main
/// connection. Anything else is a protocol violation.
pub fn parse_handshake(line: &str) -> Result<Handshake> {
    let cmd = parse_command(line).map_err(|e| Error::HandshakeParse(e.to_string()))?;
    if cmd.verb != POWERUP_VERB {
        return Err(Error::HandshakeParse(format!(
            "expected {}, got '{}'",
            POWERUP_VERB, cmd.verb
        )));
    }
    if cmd.args.len() != 3 {
        return Err(Error::HandshakeParse(format!(
            "{} takes 3 arguments, got {}",
            POWERUP_VERB,
            cmd.args.len()
        )));
    }
    let node_id: u32 = cmd.args[0]
        .parse()
        .map_err(|_| Error::HandshakeParse(format!("bad node id '{}'", cmd.args[0])))?;
    let ip: IpAddr = cmd.args[1]
        .parse()
        .map_err(|_| Error::HandshakeParse(format!("bad IP address '{}'", cmd.args[1])))?;
    let mac = cmd.args[2].clone();
    if !is_mac_address(&mac) {
        return Err(Error::HandshakeParse(format!("bad MAC address '{}'", mac)));
    }
    Ok(Handshake { node_id, ip, mac })
}

/// Split a line into verb and argument words.
///
/// Empty lines and non-ASCII input are rejected, never fatal to the
/// caller.
pub fn parse_command(line: &str) -> Result<CommandLine> {
    if !line.is_ascii() {
        return Err(Error::Parse("non-ASCII input".to_string()));
    }
    let mut words = line.split_whitespace();
    let verb = match words.next() {
        Some(word) => word.to_string(),
        None => return Err(Error::Parse("empty command line".to_string())),
    };
    Ok(CommandLine {
        verb,
        args: words.map(str::to_string).collect(),
    })
}

/// Parse the node id that node-scoped commands carry as first argument.
pub fn parse_node_id(cmd: &CommandLine) -> Result<u32> {
    let first = cmd
        .args
        .first()
        .ok_or_else(|| Error::Parse(format!("{} requires a node id argument", cmd.verb)))?;
    first
        .parse()
        .map_err(|_| Error::Parse(format!("'{}' is not a node id", first)))
}

/// Six colon-separated pairs of hex digits.
fn is_mac_address(s: &str) -> bool {
    let groups: Vec<&str> = s.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}
