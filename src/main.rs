//! Waypoint - a minimal SOCKS5 proxy.
//!
//! Accepts SOCKS5 CONNECT requests, resolves domain targets through an
//! asynchronous DNS sidecar, and relays bytes between each client and its
//! target, all on a single edge-triggered event loop thread.

mod dns;
mod event;
mod proxy;
mod session;
mod socket;

use clap::Parser;
use tracing::{error, info};

use crate::event::EventLoop;
use crate::proxy::{ProxyConfig, ProxyService};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Minimal SOCKS5 proxy", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 1080)]
    port: u16,
}

fn main() {
    let args = Args::parse();
    setup_tracing();

    info!("initializing SOCKS5 proxy");

    let mut event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!(error = %e, "failed to create event loop");
            std::process::exit(1);
        }
    };

    let config = ProxyConfig {
        port: args.port,
        ..Default::default()
    };
    let mut proxy = match ProxyService::new(&config) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, port = args.port, "failed to create proxy service");
            std::process::exit(1);
        }
    };

    if let Err(e) = proxy.start(&event_loop) {
        error!(error = %e, "failed to register server sockets");
        std::process::exit(1);
    }

    info!(port = args.port, "proxy listening");

    if let Err(e) = event_loop.run(&mut proxy) {
        error!(error = %e, "proxy stopped unexpectedly");
        std::process::exit(1);
    }
}

fn setup_tracing() {
    let filter = std::env::var("WAYPOINT_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
