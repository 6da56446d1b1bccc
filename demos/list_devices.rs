// Instrument discovery example
//
// Lists every USBTMC device and every VXI-11 instrument answering a broadcast,
// then identifies each one.

use clap::Parser;
use scopelink_rs::{LinkConfig, Oscilloscope, ScopeConnector};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "list_devices")]
#[command(version = "1.0")]
#[command(about = "List oscilloscopes reachable over USB and the local network")]
struct Args {
    /// How long to wait for VXI-11 broadcast replies, in milliseconds
    #[arg(short, long, default_value_t = 500)]
    window: u64,

    /// Connect to each device and print its identification
    #[arg(short, long)]
    identify: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("Scanning for instruments...");
    let devices = ScopeConnector::available_devices(Duration::from_millis(args.window));

    if devices.is_empty() {
        println!("No instruments found. Connect one over USB or check the network.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {} [{}] at {}", i + 1, device.name, device.kind, device.path);

        if args.identify {
            match Oscilloscope::open(device, LinkConfig::default()) {
                Ok(scope) => {
                    println!("     {} ({} series)", scope.identity(), scope.series());
                    scope.close();
                }
                Err(e) => println!("     not a supported scope: {e}"),
            }
        }
    }

    Ok(())
}
