//! VXI-11 client: portmapper discovery, link lifecycle and the
//! device_write/device_read exchange, over a record-marked TCP stream.

use crate::rpc_wire::{
    self, device_error_text, flags, fragment_marker, ip_protocol, parse_fragment_marker, program,
    reason, CallHeader, Procedure, ReplyHeader, XdrReader, XdrWriter,
};
use crate::transport::{DeviceDescriptor, ScpiTransport, StreamTermination, TransportError};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

/// Bytes asked for in each device_read; the device answers with less.
const READ_REQUEST_SIZE: u32 = 0x7FFF_FFFF;
/// Extra socket slack on top of the instrument-side I/O timeout.
const SOCKET_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);
const DISCOVERY_XID: u32 = 0x0D15_C0;

/// A byte stream the client can run over. Sockets forward the timeout to
/// the OS; in-memory streams may ignore it.
pub trait RpcStream: Read + Write {
    fn set_timeout(&self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }
}

impl RpcStream for TcpStream {
    fn set_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub id: i32,
    pub max_payload: u32,
    pub abort_port: u16,
}

pub struct RpcClient<S: RpcStream = TcpStream> {
    stream: S,
    next_xid: u32,
    link: Option<Link>,
    io_timeout: Duration,
    client_id: i32,
}

fn get_port_params(prog: u32, vers: u32, protocol: u32) -> XdrWriter {
    let mut w = XdrWriter::new();
    w.put_u32(prog).put_u32(vers).put_u32(protocol).put_u32(0);
    w
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// The instrument gives up after `timeout` and says so with an error code;
/// that case is reported as a timeout like any other.
fn check_device_error(code: i32, timeout: Duration) -> Result<(), TransportError> {
    match code {
        0 => Ok(()),
        rpc_wire::DEVICE_IO_TIMEOUT => Err(TransportError::Timeout {
            operation: "waiting for the instrument",
            timeout,
        }),
        _ => Err(TransportError::Device {
            code,
            message: device_error_text(code).to_string(),
        }),
    }
}

/// Port number from a portmapper GETPORT reply, or `None` if the datagram is
/// not a valid answer to call `xid`.
fn parse_get_port_reply(datagram: &[u8], xid: u32) -> Option<u16> {
    let mut reader = XdrReader::new(datagram);
    let header = ReplyHeader::decode(&mut reader).ok()?;
    if header.diagnose(xid).is_some() {
        return None;
    }
    u16::try_from(reader.get_u32().ok()?).ok()
}

impl RpcClient<TcpStream> {
    /// Broadcast a portmapper GETPORT for the device core program and
    /// collect every host that answers before `window` elapses.
    pub fn discover(window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, rpc_wire::port::PORTMAPPER));
        Self::discover_at(target, window)
    }

    /// Send the discovery request to `target`, which may be a broadcast or a
    /// single host, and collect the answers that arrive within `window`.
    pub fn discover_at(target: SocketAddr, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;

        let mut request = XdrWriter::new();
        CallHeader {
            xid: DISCOVERY_XID,
            procedure: Procedure::GetPort,
        }
        .encode(&mut request);
        let params = get_port_params(
            program::DEVICE_CORE,
            program::DEVICE_CORE_VERSION,
            ip_protocol::TCP,
        );
        let mut datagram = request.into_bytes();
        datagram.extend_from_slice(&params.into_bytes());

        socket.send_to(&datagram, target)?;
        log::debug!("Sent VXI-11 discovery request to {}, listening for {:?}", target, window);

        let deadline = Instant::now() + window;
        let mut found: Vec<IpAddr> = Vec::new();
        let mut buffer = [0u8; 512];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining))?;

            match socket.recv_from(&mut buffer) {
                Ok((n, from)) => match parse_get_port_reply(&buffer[..n], DISCOVERY_XID) {
                    Some(port) if port != 0 => {
                        if !found.contains(&from.ip()) {
                            log::debug!("VXI-11 instrument at {} (core port {})", from.ip(), port);
                            found.push(from.ip());
                        }
                    }
                    _ => log::debug!("Ignoring malformed discovery reply from {}", from),
                },
                // The loop condition ends the scan once the window has passed
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(found
            .into_iter()
            .map(|ip| DeviceDescriptor::vxi11(&ip.to_string()))
            .collect())
    }

    /// Connect to the device core service. Without an explicit port the
    /// portmapper on `host` is asked where the service lives.
    #[tracing::instrument(skip(timeout))]
    pub fn connect(host: &str, port: Option<u16>, timeout: Duration) -> Result<Self, TransportError> {
        Self::connect_via(host, port, rpc_wire::port::PORTMAPPER, timeout)
    }

    fn connect_via(
        host: &str,
        port: Option<u16>,
        mapper_port: u16,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = match port {
            Some(port) => port,
            None => {
                let mut mapper = Self::open_tcp(host, mapper_port, timeout)?;
                let core_port = mapper.get_port(
                    program::DEVICE_CORE,
                    program::DEVICE_CORE_VERSION,
                    ip_protocol::TCP,
                )?;
                if core_port == 0 {
                    return Err(TransportError::protocol(format!(
                        "portmapper on {host} has no VXI-11 device core registration"
                    )));
                }
                log::debug!("Portmapper on {} resolved device core to port {}", host, core_port);
                core_port
            }
        };

        Self::open_tcp(host, port, timeout).map(|client| client.with_io_timeout(timeout))
    }

    fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
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
        stream.set_timeout(timeout)?;

        Ok(Self::from_stream(stream))
    }
}

impl<S: RpcStream> RpcClient<S> {
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            next_xid: 1,
            link: None,
            io_timeout: Duration::from_secs(2),
            client_id: i32::try_from(std::process::id() & 0x7FFF_FFFF).unwrap_or(0),
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn with_client_id(mut self, client_id: i32) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    fn send_record(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut record = Vec::with_capacity(4 + payload.len());
        record.extend_from_slice(&fragment_marker(payload.len()));
        record.extend_from_slice(payload);

        let timeout = self.io_timeout;
        self.stream
            .write_all(&record)
            .and_then(|()| self.stream.flush())
            .map_err(|e| TransportError::from_socket(e, "sending an RPC call", timeout))
    }

    fn fill(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        let timeout = self.io_timeout;
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self
                .stream
                .read(&mut buffer[filled..])
                .map_err(|e| TransportError::from_socket(e, "receiving an RPC reply", timeout))?;
            if n == 0 {
                return Err(TransportError::protocol(format!(
                    "connection closed after {} of {} bytes",
                    filled,
                    buffer.len()
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read one record, joining fragments until the last-fragment bit.
    pub(crate) fn read_record(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut record = Vec::new();
        loop {
            let mut marker = [0u8; 4];
            self.fill(&mut marker)?;
            let (last, len) = parse_fragment_marker(marker);

            let start = record.len();
            record.resize(start + len, 0);
            self.fill(&mut record[start..])?;

            if last {
                return Ok(record);
            }
        }
    }

    fn call(&mut self, procedure: Procedure, params: XdrWriter) -> Result<Vec<u8>, TransportError> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);

        let mut message = XdrWriter::new();
        CallHeader { xid, procedure }.encode(&mut message);
        let mut payload = message.into_bytes();
        payload.extend_from_slice(&params.into_bytes());
        self.send_record(&payload)?;

        let reply = self.read_record()?;
        let mut reader = XdrReader::new(&reply);
        let header = ReplyHeader::decode(&mut reader)?;
        if let Some(problem) = header.diagnose(xid) {
            return Err(TransportError::protocol(format!("{procedure:?}: {problem}")));
        }
        Ok(reader.remaining().to_vec())
    }

    fn require_link(&self) -> Result<Link, TransportError> {
        self.link.ok_or(TransportError::NotConnected)
    }

    pub fn get_port(&mut self, prog: u32, vers: u32, protocol: u32) -> Result<u16, TransportError> {
        let body = self.call(Procedure::GetPort, get_port_params(prog, vers, protocol))?;
        let port = XdrReader::new(&body).get_u32()?;
        u16::try_from(port)
            .map_err(|_| TransportError::protocol(format!("portmapper returned port {port}")))
    }

    /// Open a link to the logical device `device_name` (case sensitive,
    /// usually `inst0`).
    pub fn create_link(&mut self, device_name: &str) -> Result<Link, TransportError> {
        let mut params = XdrWriter::new();
        params
            .put_i32(self.client_id)
            .put_bool(false)
            .put_u32(0)
            .put_string(device_name);

        let body = self.call(Procedure::CreateLink, params)?;
        let mut r = XdrReader::new(&body);
        check_device_error(r.get_i32()?, self.io_timeout)?;
        let link = Link {
            id: r.get_i32()?,
            abort_port: u16::try_from(r.get_u32()?).unwrap_or(0),
            max_payload: r.get_u32()?,
        };

        log::debug!(
            "Created VXI-11 link {} to {} (max payload {})",
            link.id,
            device_name,
            link.max_payload
        );
        self.link = Some(link);
        Ok(link)
    }

    pub fn device_write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let link = self.require_link()?;
        let chunk_size = match link.max_payload {
            0 => data.len().max(1),
            n => n as usize,
        };

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk_size).collect()
        };
        let last = chunks.len() - 1;

        let mut written = 0;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut params = XdrWriter::new();
            params
                .put_i32(link.id)
                .put_u32(timeout_millis(self.io_timeout))
                .put_u32(0)
                .put_i32(if i == last { flags::END } else { 0 })
                .put_opaque(chunk);

            let body = self.call(Procedure::DeviceWrite, params)?;
            let mut r = XdrReader::new(&body);
            check_device_error(r.get_i32()?, self.io_timeout)?;
            let size = r.get_u32()? as usize;
            if size != chunk.len() {
                return Err(TransportError::ShortTransfer {
                    expected: chunk.len(),
                    actual: size,
                });
            }
            written += size;
        }
        Ok(written)
    }

    /// Read one complete response, concatenating every chunk the device
    /// sends until it reports END.
    pub fn device_read(&mut self) -> Result<Vec<u8>, TransportError> {
        let link = self.require_link()?;
        let mut data = Vec::new();
        let mut chunks = 0usize;

        loop {
            let mut params = XdrWriter::new();
            params
                .put_i32(link.id)
                .put_u32(READ_REQUEST_SIZE)
                .put_u32(timeout_millis(self.io_timeout))
                .put_u32(0)
                .put_i32(flags::TERM_CHAR_SET)
                .put_i32(i32::from(b'\n'));

            let body = self.call(Procedure::DeviceRead, params)?;
            let mut r = XdrReader::new(&body);
            check_device_error(r.get_i32()?, self.io_timeout)?;
            let read_reason = r.get_i32()?;
            data.extend_from_slice(r.get_opaque()?);
            chunks += 1;

            if read_reason & reason::END != 0 {
                log::debug!("device_read returned {} bytes in {} chunk(s)", data.len(), chunks);
                return Ok(data);
            }
        }
    }

    pub fn device_clear(&mut self) -> Result<(), TransportError> {
        let link = self.require_link()?;
        let mut params = XdrWriter::new();
        params
            .put_i32(link.id)
            .put_i32(0)
            .put_u32(0)
            .put_u32(timeout_millis(self.io_timeout));

        let body = self.call(Procedure::DeviceClear, params)?;
        check_device_error(XdrReader::new(&body).get_i32()?, self.io_timeout)
    }

    /// Tear the link down. Failures are logged and otherwise ignored.
    pub fn destroy_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        let mut params = XdrWriter::new();
        params.put_i32(link.id);
        match self
            .call(Procedure::DestroyLink, params)
            .and_then(|body| check_device_error(XdrReader::new(&body).get_i32()?, self.io_timeout))
        {
            Ok(()) => log::debug!("Destroyed VXI-11 link {}", link.id),
            Err(e) => log::debug!("Ignoring failure to destroy VXI-11 link {}: {}", link.id, e),
        }
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.io_timeout = timeout;
        self.stream.set_timeout(timeout + SOCKET_TIMEOUT_MARGIN)?;
        Ok(())
    }
}

impl<S: RpcStream> Drop for RpcClient<S> {
    fn drop(&mut self) {
        self.destroy_link();
    }
}

impl<S: RpcStream + Send> ScpiTransport for RpcClient<S> {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.apply_timeout(timeout)?;
        self.device_write(data).map(|_| ())
    }

    fn read(
        &mut self,
        _termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.apply_timeout(timeout)?;
        self.device_read()
    }

    fn cancel_pending(&mut self) {
        // Calls are synchronous; nothing is left outstanding locally
    }

    fn close(&mut self) {
        self.destroy_link();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_wire::MSG_REPLY;
    use std::collections::VecDeque;

    /// Stream that serves canned bytes in fixed read sizes and records what
    /// the client writes.
    struct MockStream {
        incoming: VecDeque<u8>,
        read_sizes: VecDeque<usize>,
        written: Vec<u8>,
    }

    impl MockStream {
        fn new(incoming: Vec<u8>) -> Self {
            Self {
                incoming: incoming.into(),
                read_sizes: VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.incoming.is_empty() {
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            let limit = self.read_sizes.pop_front().unwrap_or(usize::MAX);
            let n = buf.len().min(limit).min(self.incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.incoming.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl RpcStream for MockStream {}

    fn reply_record(xid: u32, results: &XdrWriter) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_u32(xid)
            .put_u32(MSG_REPLY)
            .put_u32(0)
            .put_u32(0)
            .put_u32(0)
            .put_u32(0);
        let mut body = w.into_bytes();
        body.extend_from_slice(&results.clone().into_bytes());

        let mut record = fragment_marker(body.len()).to_vec();
        record.extend_from_slice(&body);
        record
    }

    fn create_link_reply(xid: u32, error: i32) -> Vec<u8> {
        let mut r = XdrWriter::new();
        r.put_i32(error).put_i32(42).put_u32(0).put_u32(1024);
        reply_record(xid, &r)
    }

    fn read_reply(xid: u32, reason_bits: i32, data: &[u8]) -> Vec<u8> {
        let mut r = XdrWriter::new();
        r.put_i32(0).put_i32(reason_bits).put_opaque(data);
        reply_record(xid, &r)
    }

    #[test]
    fn test_record_reassembly_from_short_reads() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut incoming = fragment_marker(payload.len()).to_vec();
        incoming.extend_from_slice(&payload);

        let mut stream = MockStream::new(incoming);
        stream.read_sizes = VecDeque::from(vec![4, 1, 7, 500, 492]);
        let mut client = RpcClient::from_stream(stream);

        assert_eq!(client.read_record().unwrap(), payload);
    }

    #[test]
    fn test_multi_fragment_record() {
        let mut incoming = vec![0, 0, 0, 3, b'a', b'b', b'c'];
        incoming.extend_from_slice(&[0x80, 0, 0, 2, b'd', b'e']);
        let mut client = RpcClient::from_stream(MockStream::new(incoming));

        assert_eq!(client.read_record().unwrap(), b"abcde");
    }

    #[test]
    fn test_create_link_stores_session() {
        let mut client = RpcClient::from_stream(MockStream::new(create_link_reply(1, 0)));

        let link = client.create_link("inst0").unwrap();
        assert_eq!(link.id, 42);
        assert_eq!(link.max_payload, 1024);
        assert_eq!(client.link(), Some(&link));

        // The call went out as one last-fragment record with the create_link procedure
        let written = &client.stream.written;
        assert_eq!(written[0] & 0x80, 0x80);
        let mut r = XdrReader::new(&written[4..]);
        let words: Vec<u32> = (0..6).map(|_| r.get_u32().unwrap()).collect();
        assert_eq!(words, vec![1, 0, 2, 0x0006_07AF, 1, 10]);
    }

    #[test]
    fn test_create_link_error_is_translated() {
        let mut client = RpcClient::from_stream(MockStream::new(create_link_reply(1, 11)));

        match client.create_link("inst0") {
            Err(TransportError::Device { code, message }) => {
                assert_eq!(code, 11);
                assert_eq!(message, "device locked by another link");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_reply_with_wrong_xid_is_a_protocol_violation() {
        let mut client = RpcClient::from_stream(MockStream::new(create_link_reply(9, 0)));

        let err = client.create_link("inst0").unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_device_read_concatenates_until_end() {
        let mut incoming = create_link_reply(1, 0);
        incoming.extend(read_reply(2, 0, b"#9000000010"));
        incoming.extend(read_reply(3, reason::TERM_CHAR, b"0123\n"));
        incoming.extend(read_reply(4, reason::END, b"456789\n"));

        let mut client = RpcClient::from_stream(MockStream::new(incoming));
        client.create_link("inst0").unwrap();

        assert_eq!(client.device_read().unwrap(), b"#90000000100123\n456789\n");
        assert_eq!(client.next_xid, 5);
    }

    #[test]
    fn test_device_write_splits_on_max_payload() {
        let mut incoming = create_link_reply(1, 0);
        for xid in 2..=4 {
            let mut r = XdrWriter::new();
            let size = if xid == 4 { 452 } else { 1024 };
            r.put_i32(0).put_u32(size);
            incoming.extend(reply_record(xid, &r));
        }

        let mut client = RpcClient::from_stream(MockStream::new(incoming));
        client.create_link("inst0").unwrap();

        let data = vec![b'x'; 2500];
        assert_eq!(client.device_write(&data).unwrap(), 2500);
    }

    #[test]
    fn test_io_without_link_is_rejected() {
        let mut client = RpcClient::from_stream(MockStream::new(Vec::new()));
        assert!(matches!(
            client.device_read(),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_destroy_link_never_fails() {
        let mut client = RpcClient::from_stream(MockStream::new(create_link_reply(1, 0)));
        client.create_link("inst0").unwrap();

        // No reply queued: the call fails but the link is still dropped
        client.destroy_link();
        assert!(client.link().is_none());
    }

    #[test]
    fn test_timeout_is_distinguished() {
        let mut client = RpcClient::from_stream(MockStream::new(create_link_reply(1, 0)));
        client.create_link("inst0").unwrap();

        let err = client.device_read().unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_parse_get_port_reply() {
        let mut r = XdrWriter::new();
        r.put_u32(1024);
        let record = reply_record(DISCOVERY_XID, &r);

        assert_eq!(parse_get_port_reply(&record[4..], DISCOVERY_XID), Some(1024));
        assert_eq!(parse_get_port_reply(&record[4..], 1), None);
        assert_eq!(parse_get_port_reply(&[1, 2, 3], DISCOVERY_XID), None);
    }

    #[test]
    fn test_instrument_io_timeout_is_a_timeout() {
        let mut incoming = create_link_reply(1, 0);
        let mut r = XdrWriter::new();
        r.put_i32(rpc_wire::DEVICE_IO_TIMEOUT).put_i32(0).put_opaque(&[]);
        incoming.extend(reply_record(2, &r));

        let mut client =
            RpcClient::from_stream(MockStream::new(incoming)).with_io_timeout(Duration::from_millis(500));
        client.create_link("inst0").unwrap();

        let err = client.device_read().unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, TransportError::Timeout { timeout, .. } if timeout == Duration::from_millis(500)));
    }

    /// Accept one connection and answer every call with `handler`, which
    /// gets the procedure number and a reader positioned at the parameters.
    fn serve_rpc<F>(mut handler: F) -> u16
    where
        F: FnMut(u32, &mut XdrReader<'_>) -> XdrWriter + Send + 'static,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            loop {
                let mut marker = [0u8; 4];
                if socket.read_exact(&mut marker).is_err() {
                    break;
                }
                let (_, len) = parse_fragment_marker(marker);
                let mut call = vec![0u8; len];
                if socket.read_exact(&mut call).is_err() {
                    break;
                }

                let mut r = XdrReader::new(&call);
                let xid = r.get_u32().unwrap();
                let header: Vec<u32> = (0..9).map(|_| r.get_u32().unwrap()).collect();
                let results = handler(header[4], &mut r);
                if socket.write_all(&reply_record(xid, &results)).is_err() {
                    break;
                }
            }
        });
        port
    }

    fn core_service() -> u16 {
        serve_rpc(|procedure, r| {
            let mut w = XdrWriter::new();
            match procedure {
                10 => {
                    w.put_i32(0).put_i32(7).put_u32(0).put_u32(0);
                }
                11 => {
                    for _ in 0..4 {
                        r.get_u32().unwrap();
                    }
                    let size = r.get_opaque().unwrap().len() as u32;
                    w.put_i32(0).put_u32(size);
                }
                12 => {
                    w.put_i32(0).put_i32(reason::END).put_opaque(b"1\n");
                }
                _ => {
                    w.put_i32(0);
                }
            }
            w
        })
    }

    #[test]
    fn test_connect_resolves_core_port_through_portmapper() {
        let core_port = core_service();
        let mapper_port = serve_rpc(move |procedure, _| {
            assert_eq!(procedure, Procedure::GetPort.id());
            let mut w = XdrWriter::new();
            w.put_u32(u32::from(core_port));
            w
        });
        let timeout = Duration::from_secs(1);

        let mut client = RpcClient::connect_via("127.0.0.1", None, mapper_port, timeout).unwrap();
        assert_eq!(client.create_link("inst0").unwrap().id, 7);

        client.write(b"*OPC?\n", timeout).unwrap();
        assert_eq!(client.read(StreamTermination::Terminator, timeout).unwrap(), b"1\n");
        client.close();
        assert!(client.link().is_none());
    }

    #[test]
    fn test_unregistered_core_service_is_rejected() {
        let mapper_port = serve_rpc(|_, _| {
            let mut w = XdrWriter::new();
            w.put_u32(0);
            w
        });

        let err = RpcClient::connect_via("127.0.0.1", None, mapper_port, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_discovery_collects_answering_hosts() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = responder.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buffer = [0u8; 512];
            let (n, from) = responder.recv_from(&mut buffer).unwrap();
            let xid = XdrReader::new(&buffer[..n]).get_u32().unwrap();

            let mut port = XdrWriter::new();
            port.put_u32(1024);
            let record = reply_record(xid, &port);
            // Twice, to check that a host is listed once
            responder.send_to(&record[4..], from).unwrap();
            responder.send_to(&record[4..], from).unwrap();
        });

        let found = RpcClient::discover_at(target, Duration::from_millis(300)).unwrap();
        assert_eq!(found, vec![DeviceDescriptor::vxi11("127.0.0.1")]);
    }
}
