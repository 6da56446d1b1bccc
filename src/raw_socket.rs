use crate::transport::{ScpiTransport, StreamTermination, TransportError};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Port most LAN-enabled scopes listen on for raw SCPI.
pub const DEFAULT_PORT: u16 = 5555;

/// Pad bytes some firmware appends after the final line feed.
const TRAILING_PAD_TOLERANCE: usize = 2;
const CHUNK_SIZE: usize = 64 * 1024;

/// SCPI over a bare TCP socket. The stream carries no message boundaries, so
/// every read must be told how to recognise the end of the response.
pub struct RawSocketTransport<S: Read + Write = TcpStream> {
    stream: Option<S>,
}

impl RawSocketTransport<TcpStream> {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let path = format!("{host}:{port}");
        let address = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Open {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::NotPresent { path: path.clone() })?;

        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout {
                    operation: "connecting",
                    timeout,
                }
            }
            std::io::ErrorKind::ConnectionRefused => TransportError::NotPresent { path: path.clone() },
            _ => TransportError::Open {
                path: path.clone(),
                reason: e.to_string(),
            },
        })?;
        stream.set_nodelay(true)?;
        log::debug!("Connected to {} over raw TCP", path);

        Ok(Self::from_stream(stream))
    }

    fn apply_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
        }
        Ok(())
    }
}

impl<S: Read + Write> RawSocketTransport<S> {
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut S, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream
            .write_all(data)
            .and_then(|()| stream.flush())
            .map_err(|e| TransportError::from_socket(e, "sending", timeout))
    }

    /// Accumulate chunks until `termination` says the response is complete.
    ///
    /// In minimum-size mode a reply that opens with a `#N<digits>` block
    /// header ends where the header says, plus its line feed, whatever
    /// minimum was asked for.
    pub fn receive(
        &mut self,
        termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let stream = self.stream()?;
        let mut response = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];

        loop {
            let n = match stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    let error = TransportError::from_socket(e, "receiving", timeout);
                    if error.is_timeout() && block_payload_complete(termination, &response) {
                        log::debug!("Block complete but no line feed followed it");
                        return Ok(response);
                    }
                    return Err(error);
                }
            };
            if n == 0 {
                return Err(TransportError::protocol(format!(
                    "connection closed after {} bytes",
                    response.len()
                )));
            }
            response.extend_from_slice(&chunk[..n]);

            let complete = match termination {
                StreamTermination::Terminator => chunk[..n]
                    .iter()
                    .rev()
                    .take(TRAILING_PAD_TOLERANCE + 1)
                    .any(|&b| b == b'\n'),
                StreamTermination::MinimumSize(size) => match block_extent(&response) {
                    BlockExtent::Ends(end) => response[end.min(response.len())..].contains(&b'\n'),
                    BlockExtent::HeaderPending => false,
                    BlockExtent::NotABlock => response.len() >= size,
                },
            };
            if complete {
                return Ok(response);
            }

            if Instant::now() >= deadline {
                if block_payload_complete(termination, &response) {
                    return Ok(response);
                }
                return Err(TransportError::Timeout {
                    operation: "receiving",
                    timeout,
                });
            }
        }
    }
}

enum BlockExtent {
    NotABlock,
    HeaderPending,
    /// Offset just past the declared payload
    Ends(usize),
}

fn block_extent(data: &[u8]) -> BlockExtent {
    if data.first() != Some(&b'#') {
        return BlockExtent::NotABlock;
    }
    let digits = match data.get(1).copied() {
        None => return BlockExtent::HeaderPending,
        Some(d @ b'1'..=b'9') => usize::from(d - b'0'),
        Some(_) => return BlockExtent::NotABlock,
    };
    let Some(field) = data.get(2..2 + digits) else {
        return BlockExtent::HeaderPending;
    };
    match std::str::from_utf8(field).ok().and_then(|f| f.parse::<usize>().ok()) {
        Some(declared) => BlockExtent::Ends(2 + digits + declared),
        None => BlockExtent::NotABlock,
    }
}

fn block_payload_complete(termination: StreamTermination, response: &[u8]) -> bool {
    matches!(termination, StreamTermination::MinimumSize(_))
        && matches!(block_extent(response), BlockExtent::Ends(end) if response.len() >= end)
}

impl RawSocketTransport<TcpStream> {
    /// Throw away whatever is already buffered in the socket, such as the
    /// pad byte of an earlier block or the tail of an abandoned reply.
    fn discard_stale(&mut self) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let mut scratch = [0u8; 4096];
        let mut discarded = 0;
        while let Ok(n) = stream.read(&mut scratch) {
            if n == 0 {
                break;
            }
            discarded += n;
        }
        let _ = stream.set_nonblocking(false);
        if discarded > 0 {
            log::debug!("Discarded {} stale byte(s)", discarded);
        }
    }
}

impl ScpiTransport for RawSocketTransport<TcpStream> {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.discard_stale();
        self.apply_timeout(timeout)?;
        self.send(data, timeout)
    }

    fn read(
        &mut self,
        termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.apply_timeout(timeout)?;
        self.receive(termination, timeout)
    }

    fn cancel_pending(&mut self) {
        self.discard_stale();
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
