//! Screen relay server
//!
//! Run with: cargo run --example relay_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example relay_server                  # binds to 0.0.0.0:8765
//!   cargo run --example relay_server localhost        # binds to 127.0.0.1:8765
//!   cargo run --example relay_server 127.0.0.1:9000   # binds to 127.0.0.1:9000
//!
//! Environment:
//!   ADB_PATH             adb binary (default: adb on PATH)
//!   SCRCPY_SERVER_PATH   scrcpy-server jar (default: searched)
//!   RUST_LOG             log filter
//!
//! ## Watching a device
//!
//!   adb devices
//!   cargo run --example player -- 127.0.0.1:8765 emulator-5554 | ffplay -f h264 -
//!
//! ## Features
//!
//! - One capture per device, shared by every consumer
//! - Late joiners receive SPS, PPS and the latest IDR before live units
//! - Capture keeps running for a grace period after the last consumer leaves
//! - Slow consumers are dropped instead of stalling the others

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use screen_relay::server::config::DEFAULT_PORT;
use screen_relay::{AdbLauncher, CaptureConfig, RelayConfig, RelayServer, ServerConfig};

fn parse_bind_addr(s: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let with_port = if s.contains(':') {
        s.to_string()
    } else {
        format!("{}:{}", s, DEFAULT_PORT)
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| format!("Invalid address '{}': {}", s, e))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| format!("No IPv4 address for '{}'", s))
}

fn print_usage() {
    eprintln!("Usage: relay_server [BIND_ADDR]");
    eprintln!();
    eprintln!("  relay_server                     # binds to 0.0.0.0:8765");
    eprintln!("  relay_server localhost           # binds to 127.0.0.1:8765");
    eprintln!("  relay_server 127.0.0.1:9000      # binds to 127.0.0.1:9000");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind_addr = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => ServerConfig::default().bind_addr,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("screen_relay=debug".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    let config = ServerConfig::with_addr(bind_addr);
    let capture = CaptureConfig::from_env();
    let relay = RelayConfig::default().grace_period(Duration::from_secs(10));

    println!("Starting relay on ws://{}/video/{{device_id}}", config.bind_addr);
    println!("adb: {}", capture.adb_path.display());
    println!();

    let server = RelayServer::with_relay_config(config, AdbLauncher::new(capture), relay);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nShutting down...");
    };

    if let Err(e) = server.run_until(shutdown).await {
        eprintln!("Server error: {}", e);
    }

    let stats = server.stats();
    println!(
        "Stats: connections={} rejected={} units_sent={}",
        stats.total_connections, stats.rejected_connections, stats.units_sent
    );

    Ok(())
}
