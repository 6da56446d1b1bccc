//! # ScopeLink RS
//!
//! A Rust library for controlling bench oscilloscopes and reading back captured
//! waveforms over USBTMC, raw TCP sockets or VXI-11.
//!
//! One SCPI command vocabulary is carried over three unrelated framings. This
//! crate implements each framing, unifies them behind a single command API and
//! adds a capture engine that knows the quirks of individual instrument series.
//!
//! ## Features
//!
//! - **USBTMC**: 12-byte bulk headers with tag checking, multi-transfer responses, `rusb` backed pipes
//! - **VXI-11**: portmapper lookup, UDP broadcast discovery, link lifecycle, fragmented records
//! - **Raw TCP**: terminator and minimum-size response detection for text and binary replies
//! - **Command API**: string, number, boolean and binary queries plus `*OPC?` synchronisation
//! - **Capture engine**: per-series command tables, windowed memory reads, pod unpacking
//! - **DataFrame output**: captures convert to `polars` frames with a time column
//!
//! ## Examples
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use scopelink_rs::ScopeConnector;
//! use std::time::Duration;
//!
//! for device in ScopeConnector::available_devices(Duration::from_millis(500)) {
//!     println!("Found {} at {}", device.name, device.path);
//! }
//! ```
//!
//! ### Capturing Two Channels
//!
//! ```rust,no_run
//! use scopelink_rs::{CaptureRequest, LinkConfig, ScopeConnector};
//! use std::sync::atomic::AtomicBool;
//!
//! let mut scope = ScopeConnector::connect(Some("192.168.1.20"), LinkConfig::default())?;
//! scope.stop()?;
//!
//! let abort = AtomicBool::new(false);
//! let request = CaptureRequest::memory(&[1, 2]);
//! if let Some(capture) = scope.capture(&request, &abort, &mut |p| {
//!     println!("{:.0}%", p.fraction() * 100.0);
//! })? {
//!     for warning in &capture.warnings {
//!         eprintln!("warning: {warning}");
//!     }
//!     let df = capture.to_dataframe()?;
//!     println!("{df}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Raw SCPI
//!
//! ```rust,no_run
//! use scopelink_rs::{DeviceDescriptor, LinkConfig, ScpiLink};
//! use std::time::Duration;
//!
//! let descriptor = DeviceDescriptor::tcp("192.168.1.20", 5555);
//! let mut link = ScpiLink::connect(&descriptor, LinkConfig::default())?;
//! let idn = link.send_string("*IDN?", Duration::from_secs(1))?;
//! let timebase = link.send_double(":TIM:SCAL?", Duration::from_secs(1))?;
//! println!("{idn}: {timebase} s/div");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod block_transfer;
pub mod bulk_frame;
pub mod bulk_transport;
pub mod capture;
pub mod capture_engine;
pub mod command_table;
pub mod oscilloscope;
pub mod preamble;
pub mod raw_socket;
pub mod rpc_client;
pub mod rpc_wire;
pub mod scope_connector;
pub mod scpi_link;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export the main types for convenience
pub use transport::{DeviceDescriptor, ScpiTransport, StreamTermination, TransportError, TransportKind};

pub use scpi_link::{LinkConfig, OpcSupport, ScpiError, ScpiLink};

pub use command_table::{Command, CommandError, ScopeSeries, SeriesProfile};

pub use capture::{Capture, Channel};

pub use capture_engine::{CaptureEngine, CaptureError, CaptureRequest, WaveformSource};

pub use block_transfer::TransferProgress;

pub use oscilloscope::{InstrumentIdentity, Oscilloscope, RunState, ScopeError};

pub use scope_connector::{ConnectorError, ScopeConnector};
