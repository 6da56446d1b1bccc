//! ONC RPC / VXI-11 wire encoding.
//!
//! Every integer on the wire is a big-endian 32-bit word. Parameter blocks
//! are written and read with explicit cursors rather than struct layouts.

pub mod program {
    pub const PORTMAPPER: u32 = 100_000;
    pub const PORTMAPPER_VERSION: u32 = 2;
    pub const DEVICE_CORE: u32 = 0x0006_07AF;
    pub const DEVICE_CORE_VERSION: u32 = 1;
}

pub mod port {
    pub const PORTMAPPER: u16 = 111;
}

pub mod ip_protocol {
    pub const TCP: u32 = 6;
    pub const UDP: u32 = 17;
}

pub const RPC_VERSION: u32 = 2;
pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;
pub const REPLY_ACCEPTED: u32 = 0;
pub const ACCEPT_SUCCESS: u32 = 0;

const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Flags of `device_write`, `device_read` and `device_clear`.
pub mod flags {
    pub const WAIT_LOCK: i32 = 0x01;
    pub const END: i32 = 0x08;
    pub const TERM_CHAR_SET: i32 = 0x80;
}

/// Reason bits of a `device_read` reply.
pub mod reason {
    pub const REQUEST_COUNT: i32 = 0x01;
    pub const TERM_CHAR: i32 = 0x02;
    pub const END: i32 = 0x04;
}

/// Convert a word between host and network order. Applying it twice is the
/// identity.
pub const fn network_order(value: u32) -> u32 {
    value.to_be()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    GetPort,
    CreateLink,
    DeviceWrite,
    DeviceRead,
    DeviceClear,
    DestroyLink,
}

impl Procedure {
    pub const fn id(self) -> u32 {
        match self {
            Self::GetPort => 3,
            Self::CreateLink => 10,
            Self::DeviceWrite => 11,
            Self::DeviceRead => 12,
            Self::DeviceClear => 15,
            Self::DestroyLink => 23,
        }
    }

    /// Program and version the procedure belongs to.
    pub const fn program(self) -> (u32, u32) {
        match self {
            Self::GetPort => (program::PORTMAPPER, program::PORTMAPPER_VERSION),
            _ => (program::DEVICE_CORE, program::DEVICE_CORE_VERSION),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf
            .extend_from_slice(&network_order(value).to_ne_bytes());
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.put_u32(value as u32)
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u32(u32::from(value))
    }

    /// Variable length opaque data: length word, bytes, zero pad to 4.
    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_opaque(value.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("RPC message truncated: needed {needed} bytes at offset {offset}, {available} available")]
pub struct Truncated {
    pub needed: usize,
    pub offset: usize,
    pub available: usize,
}

impl From<Truncated> for crate::transport::TransportError {
    fn from(e: Truncated) -> Self {
        Self::Protocol(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct XdrReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(Truncated {
                needed: n,
                offset: self.pos,
                available: self.data.len().saturating_sub(self.pos),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u32(&mut self) -> Result<u32, Truncated> {
        let b = self.take(4)?;
        Ok(network_order(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])))
    }

    pub fn get_i32(&mut self) -> Result<i32, Truncated> {
        self.get_u32().map(|v| v as i32)
    }

    pub fn get_opaque(&mut self) -> Result<&'a [u8], Truncated> {
        let len = self.get_u32()? as usize;
        let data = self.take(len)?;
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// The ten words that open every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub procedure: Procedure,
}

impl CallHeader {
    pub fn encode(&self, writer: &mut XdrWriter) {
        let (program, version) = self.procedure.program();
        writer
            .put_u32(self.xid)
            .put_u32(MSG_CALL)
            .put_u32(RPC_VERSION)
            .put_u32(program)
            .put_u32(version)
            .put_u32(self.procedure.id())
            // credential flavor + length, verifier flavor + length
            .put_u32(0)
            .put_u32(0)
            .put_u32(0)
            .put_u32(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub msg_type: u32,
    pub reply_state: u32,
    pub accept_state: u32,
}

impl ReplyHeader {
    /// Decode the reply header, leaving `reader` at the procedure results.
    pub fn decode(reader: &mut XdrReader<'_>) -> Result<Self, Truncated> {
        let xid = reader.get_u32()?;
        let msg_type = reader.get_u32()?;
        let reply_state = reader.get_u32()?;
        if msg_type != MSG_REPLY || reply_state != REPLY_ACCEPTED {
            return Ok(Self {
                xid,
                msg_type,
                reply_state,
                accept_state: u32::MAX,
            });
        }

        let _verifier_flavor = reader.get_u32()?;
        let _verifier_body = reader.get_opaque()?;
        let accept_state = reader.get_u32()?;
        Ok(Self {
            xid,
            msg_type,
            reply_state,
            accept_state,
        })
    }

    /// `None` when this header is a successful answer to call `xid`,
    /// otherwise a description of what is wrong with it.
    pub fn diagnose(&self, xid: u32) -> Option<String> {
        if self.xid != xid {
            return Some(format!(
                "reply id {} does not match call id {}",
                self.xid, xid
            ));
        }
        if self.msg_type != MSG_REPLY {
            return Some(format!("message type {} is not a reply", self.msg_type));
        }
        if self.reply_state != REPLY_ACCEPTED {
            return Some(format!("call was denied (reply state {})", self.reply_state));
        }
        if self.accept_state != ACCEPT_SUCCESS {
            return Some(format!(
                "call was not executed (accept state {})",
                self.accept_state
            ));
        }
        None
    }
}

/// Record marking word for a single-fragment record of `len` bytes.
pub fn fragment_marker(len: usize) -> [u8; 4] {
    network_order(LAST_FRAGMENT | (len as u32 & !LAST_FRAGMENT)).to_ne_bytes()
}

/// Split a record marking word into (last fragment, length).
pub fn parse_fragment_marker(bytes: [u8; 4]) -> (bool, usize) {
    let word = network_order(u32::from_ne_bytes(bytes));
    (word & LAST_FRAGMENT != 0, (word & !LAST_FRAGMENT) as usize)
}

/// Device error code for an instrument-side I/O timeout
pub const DEVICE_IO_TIMEOUT: i32 = 15;

pub fn device_error_text(code: i32) -> &'static str {
    match code {
        0 => "no error",
        1 => "syntax error",
        3 => "device not accessible",
        4 => "invalid link identifier",
        5 => "parameter error",
        6 => "channel not established",
        8 => "operation not supported",
        9 => "out of resources",
        11 => "device locked by another link",
        12 => "no lock held by this link",
        15 => "I/O timeout",
        17 => "I/O error",
        21 => "invalid address",
        23 => "abort",
        29 => "channel already established",
        _ => "unknown error",
    }
}
