use std::fmt;
use std::time::Duration;

/// Physical framing used to reach an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// USB bulk transfers framed as USBTMC messages
    UsbTmc,
    /// Plain SCPI over a TCP socket
    RawTcp,
    /// VXI-11 remote procedure calls
    Vxi11,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UsbTmc => "USBTMC",
            Self::RawTcp => "TCP",
            Self::Vxi11 => "VXI-11",
        };
        f.write_str(name)
    }
}

/// An instrument found by enumeration or typed in by the user.
///
/// `path` is opaque to everything except the transport that opens it:
/// `usb:<bus>:<address>` for USBTMC, `host` or `host:port` for the network
/// transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub path: String,
    pub kind: TransportKind,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
        }
    }

    pub fn usb(name: impl Into<String>, bus: u8, address: u8) -> Self {
        Self::new(name, format!("usb:{bus:03}:{address:03}"), TransportKind::UsbTmc)
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Self::new(host, format!("{host}:{port}"), TransportKind::RawTcp)
    }

    pub fn vxi11(host: &str) -> Self {
        Self::new(host, host, TransportKind::Vxi11)
    }

    /// Split a network path into host and optional port.
    pub fn host_and_port(&self) -> (&str, Option<u16>) {
        match self.path.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, Some(port)),
                Err(_) => (self.path.as_str(), None),
            },
            None => (self.path.as_str(), None),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.kind, self.path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No instrument is present at {path}")]
    NotPresent { path: String },

    #[error("Instrument at {path} is unavailable ({reason}). If the computer resumed from sleep, unplug and reconnect the instrument")]
    Unavailable { path: String, reason: String },

    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Timeout after {timeout:?} while {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short transfer: requested {expected} bytes but {actual} were transferred")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Instrument reported error {code}: {message}")]
    Device { code: i32, message: String },

    #[error("Transport is not connected")]
    NotConnected,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Map an I/O error from a socket read/write, turning expired socket
    /// timeouts into [`TransportError::Timeout`].
    pub(crate) fn from_socket(
        error: std::io::Error,
        operation: &'static str,
        timeout: Duration,
    ) -> Self {
        match error.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                Self::Timeout { operation, timeout }
            }
            _ => Self::Io(error),
        }
    }
}

/// How to decide that a response on a stream without message boundaries is
/// complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTermination {
    /// Stop once a received chunk ends in a line feed (allowing a couple of
    /// pad bytes after it). Only safe for payloads that never contain `\n`.
    Terminator,
    /// Stop once at least this many bytes have been received, regardless of
    /// content.
    MinimumSize(usize),
}

/// One open connection to an instrument.
///
/// Implementations are not thread safe in the protocol sense: exactly one
/// request/response pair may be in flight at a time.
pub trait ScpiTransport: Send {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read one complete response. Message-oriented transports ignore
    /// `termination`.
    fn read(
        &mut self,
        termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn cancel_pending(&mut self);

    fn close(&mut self);
}
