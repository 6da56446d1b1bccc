// Waveform capture example
//
// Connects to an oscilloscope, stops acquisition if needed and reads the
// requested channels from the screen or from acquisition memory.

use clap::Parser;
use scopelink_rs::{CaptureRequest, LinkConfig, RunState, ScopeConnector};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "capture_waveform")]
#[command(version = "1.0")]
#[command(about = "Capture waveforms from a bench oscilloscope")]
#[command(long_about = "Read analog and digital channels from a USBTMC, raw TCP or VXI-11 oscilloscope and print a summary of the captured samples.")]
struct Args {
    /// Instrument address: usb:<bus>:<addr>, tcp://host[:port] or a VXI-11 host.
    /// The first discovered scope is used when omitted.
    target: Option<String>,

    /// Analog channels to read (1-based)
    #[arg(short, long, value_delimiter = ',', default_value = "1")]
    analog: Vec<u8>,

    /// Digital channels to read (0-based)
    #[arg(short, long, value_delimiter = ',')]
    digital: Vec<u8>,

    /// Read the full acquisition memory instead of the screen
    #[arg(short, long)]
    memory: bool,

    /// Data timeout in seconds
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,

    /// Print this many rows of the resulting table
    #[arg(short, long, default_value_t = 10)]
    rows: usize,

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

    let config = LinkConfig::default().with_data_timeout(Duration::from_secs(args.timeout));
    let mut scope = ScopeConnector::connect(args.target.as_deref(), config)?;
    println!("Connected to {} ({} series)", scope.identity(), scope.series());

    let base = if args.memory {
        CaptureRequest::memory(&args.analog)
    } else {
        CaptureRequest::screen(&args.analog)
    };
    let request = base.with_digital(&args.digital);

    if (request.channel_count() > 1 || args.memory) && scope.run_state()? != RunState::Stopped {
        println!("Stopping acquisition");
        scope.stop()?;
    }

    let abort = AtomicBool::new(false);
    let started = Instant::now();
    let capture = scope.capture(&request, &abort, &mut |p| {
        println!("  {:>5.1}% ({} of {} samples)", p.fraction() * 100.0, p.transferred, p.total);
    });

    let capture = match capture {
        Ok(Some(capture)) => capture,
        Ok(None) => {
            println!("Capture aborted");
            return Ok(());
        }
        Err(e) => {
            if let Some(reason) = scope.last_error() {
                eprintln!("Instrument error queue: {reason}");
            }
            return Err(e.into());
        }
    };

    println!(
        "Read {} channel(s), {} samples, {} ps apart, in {:.2?}",
        capture.channels.len(),
        capture.total_samples,
        capture.sample_interval_ps,
        started.elapsed()
    );
    for warning in &capture.warnings {
        println!("warning: {warning}");
    }

    let df = capture.to_dataframe()?;
    println!("{}", df.head(Some(args.rows)));

    scope.close();
    Ok(())
}
