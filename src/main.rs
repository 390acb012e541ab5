use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use log::{error, info};
use nix::sys::signal::{signal, SigHandler, Signal};

mod cgi;
mod config;
mod request;
mod response;
mod server;

use server::ServerManager;

/// Config file used when none is given on the command line.
const DEFAULT_CONFIG: &str = "config/default.conf";

/// Upper bound on simultaneously served clients; past it, accepts are left
/// to the listen backlog.
pub const MAX_CONNECTIONS: usize = 512;
/// Events handled per epoll wake.
pub const MAX_EPOLL_EVENTS: usize = 64;
/// Idle connections older than this many seconds are closed.
pub const CLIENT_CONNECTION_TIMEOUT: i64 = 30;
/// Bytes read from a client socket per readable event.
pub const REQUEST_READ_SIZE: usize = 8192;
/// Bytes written to a client socket per writable event.
pub const RESPONSE_WRITE_SIZE: usize = 8192;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn setup_signals() -> Result<()> {
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;
    Ok(())
}

fn run(config_path: &str) -> Result<()> {
    setup_signals()?;
    info!("setting up servers ...");
    let mut manager = ServerManager::setup(config_path)?;
    info!("booting servers ...");
    manager.run()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.len() {
        1 => DEFAULT_CONFIG,
        2 => args[1].as_str(),
        _ => {
            error!("usage: {} [config-path]", args[0]);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config_path) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
