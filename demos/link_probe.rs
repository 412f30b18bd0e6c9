// Link probe: READ-ONLY check of the flight controller link
//
// Performs the heartbeat handshake and watches liveness for a few seconds.
// Sends nothing but our own GCS heartbeat - no channel outputs, no movement.
//
// Usage: cargo run --example link_probe -- [port] [baud]
// Example: cargo run --example link_probe -- /dev/ttyAMA0 57600

use rover_link_runtime::config::{DEFAULT_BAUD, DEFAULT_PORT};
use rover_link_runtime::link::{CommandLink, LinkSession, SessionOptions};
use std::thread::sleep;
use std::time::Duration;

const WATCH_SECONDS: u64 = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    // Get port/baud from args or use defaults
    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| DEFAULT_PORT.to_string());
    let baud = match args.next() {
        Some(b) => b.parse()?,
        None => DEFAULT_BAUD,
    };

    println!("Flight controller link probe (READ-ONLY)");
    println!("Serial port: {} @ {} baud", port, baud);
    println!();

    println!("Step 1: Waiting for heartbeat...");
    let mut session = match LinkSession::connect(&port, baud, SessionOptions::default()) {
        Ok(session) => {
            println!(
                "  ✓ Connected: system {} component {}",
                session.target_system(),
                session.target_component()
            );
            session
        }
        Err(e) => {
            println!("  ✗ {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path and baud rate (SERIALn_BAUD on the autopilot)");
            println!("  - Verify the TELEM port protocol is set to MAVLink");
            println!("  - On a Pi, make sure the serial console is disabled");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Watching liveness for {}s...", WATCH_SECONDS);
    for second in 1..=WATCH_SECONDS {
        sleep(Duration::from_secs(1));
        match session.poll_liveness() {
            Ok(()) => println!("  [{}s] ✓ alive ({})", second, session.liveness()),
            Err(e) => {
                println!("  [{}s] ✗ {}", second, e);
                return Err(e.into());
            }
        }
    }
    if let Some((command, result)) = session.last_ack() {
        println!("  Last COMMAND_ACK: command={} result={}", command, result);
    }

    println!();
    println!("Link healthy. Next step: `rover-link-runtime run` with wheels OFF THE GROUND");
    Ok(())
}
