//! Playback client writing the elementary stream to stdout
//!
//! Run with: cargo run --example player -- RELAY DEVICE
//!
//! Examples:
//!   cargo run --example player -- 127.0.0.1:8765 emulator-5554 | ffplay -f h264 -
//!   cargo run --example player -- 127.0.0.1:8765 192.168.1.20:5555 > capture.h264
//!
//! Logs go to stderr. The process exits when playback falls back (no data,
//! or the relay kept failing) or on Ctrl+C.

use screen_relay::playback::{
    PlaybackClient, PlaybackConfig, PlaybackOutcome, SinkFactory, WsConnector,
};

fn print_usage() {
    eprintln!("Usage: player RELAY DEVICE");
    eprintln!();
    eprintln!("  player 127.0.0.1:8765 emulator-5554 | ffplay -f h264 -");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() != 3 {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("screen_relay=info".parse()?)
                .add_directive("player=debug".parse()?),
        )
        .init();

    let connector = WsConnector::for_device(&args[1], &args[2]);
    eprintln!("Connecting to {}", connector.url());

    let client = PlaybackClient::new(
        connector,
        SinkFactory::new(std::io::stdout),
        PlaybackConfig::default(),
    );

    let mut status = client.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            tracing::debug!(
                state = %snapshot.state,
                units = snapshot.units,
                resyncs = snapshot.resyncs,
                "Status"
            );
        }
    });

    let outcome = client
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    match outcome {
        PlaybackOutcome::Fallback(reason) => {
            eprintln!("Playback gave up: {:?}", reason);
            std::process::exit(2);
        }
        PlaybackOutcome::Stopped => eprintln!("\nStopped"),
    }

    Ok(())
}
