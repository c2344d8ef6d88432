//! cosmicd daemon entry point.
//!
//! Wires the pieces together: loads configuration, starts the operator
//! console, the command worker pool, the server heartbeat, and the
//! rendezvous server, then parks until a shutdown is requested by
//! Ctrl-C or a SHUTDOWN command.

use cosmicd::command::{CommandProcessor, Dispatcher, WorkItem, COMMAND_WORKERS};
use cosmicd::comm::{Console, LogConsole};
use cosmicd::config::Config;
use cosmicd::error::{Error, Result};
use cosmicd::heartbeat::Heartbeat;
use cosmicd::server::{MainServer, NodeRegistry};
use cosmicd::sync::{Flag, Worklist};
use std::env;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "/etc/cosmicd.toml";

/// Parse config path from command line arguments.
///
/// Supports:
/// - `cosmicd <path>` (positional)
/// - `cosmicd --config <path>` (flag-based)
/// - `cosmicd -c <path>` (short flag)
fn parse_config_path() -> Option<String> {
    let args: Vec<String> = env::args().collect();

    // Look for --config or -c flag
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }

    // Fall back to first positional argument (if it doesn't start with -)
    if args.len() > 1 && !args[1].starts_with('-') {
        return Some(args[1].clone());
    }

    None
}

/// Load configuration. An explicitly given path must exist; with no
/// path given, a missing default file falls back to site defaults.
fn load_config() -> Result<(Config, bool)> {
    match parse_config_path() {
        Some(path) => Ok((Config::load(&path)?, false)),
        None => {
            if Path::new(DEFAULT_CONFIG_PATH).exists() {
                Ok((Config::load(DEFAULT_CONFIG_PATH)?, false))
            } else {
                Ok((Config::site_defaults(), true))
            }
        }
    }
}

fn main() -> Result<()> {
    let (config, used_defaults) = load_config()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    log::info!("cosmicd v{} starting...", env!("CARGO_PKG_VERSION"));
    if used_defaults {
        log::warn!(
            "no configuration file at {}, using site defaults",
            DEFAULT_CONFIG_PATH
        );
    }

    let config = Arc::new(config);

    // Shutdown is a shared flag anything can raise: the signal handler,
    // a SHUTDOWN command, or a fatal startup error path.
    let shutdown = Flag::new();
    let signal_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        signal_shutdown.set();
    })
    .map_err(|e| Error::Other(format!("error setting Ctrl-C handler: {}", e)))?;

    let (mut console, console_handle) = Console::spawn(Box::new(LogConsole));
    let registry = Arc::new(NodeRegistry::new());
    let worklist: Worklist<WorkItem> = Worklist::new("commands");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        worklist.clone(),
        console_handle.clone(),
        shutdown.clone(),
    ));
    let mut processor = CommandProcessor::spawn(dispatcher, COMMAND_WORKERS)?;
    let mut heartbeat = Heartbeat::start(config.timing.heartbeat_interval(), worklist.clone())?;

    let mut main_server = MainServer::start(
        Arc::clone(&config),
        Arc::clone(&registry),
        worklist,
        console_handle.clone(),
    )?;

    console_handle.lifecycle(format!(
        "cosmicd listening on {}",
        config.network.rendezvous_address()
    ));
    log::info!("cosmicd running. Press Ctrl-C to stop.");

    shutdown.wait();

    // Orderly teardown: stop the line sources first, then the pool that
    // drains them, then the display.
    log::info!("shutting down");
    main_server.stop();
    heartbeat.stop();
    for pair in registry.take_all_bridges() {
        pair.stop();
    }
    processor.stop();
    console.stop();

    log::info!("cosmicd stopped");
    Ok(())
}
