//! USBTMC message framing on top of a [`BulkPipe`].

use crate::bulk_transport::BulkPipe;
use crate::transport::{ScpiTransport, StreamTermination, TransportError};
use std::time::Duration;

pub const HEADER_LEN: usize = 12;

pub mod msg_id {
    pub const DEV_DEP_MSG_OUT: u8 = 1;
    pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
    /// Responses to a REQUEST_DEV_DEP_MSG_IN reuse its id
    pub const DEV_DEP_MSG_IN: u8 = 2;
}

const ATTR_END_OF_MESSAGE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkHeader {
    pub msg_id: u8,
    pub tag: u8,
    pub transfer_size: u32,
    pub end_of_message: bool,
}

impl BulkHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.msg_id;
        header[1] = self.tag;
        header[2] = !self.tag;
        header[4..8].copy_from_slice(&self.transfer_size.to_le_bytes());
        if self.end_of_message {
            header[8] = ATTR_END_OF_MESSAGE;
        }
        header
    }

    /// Decode a response header, rejecting anything that does not answer the
    /// request tagged `expected_tag` or that announces more than `max_size`
    /// bytes.
    pub fn decode_response(
        bytes: &[u8],
        expected_tag: u8,
        max_size: usize,
    ) -> Result<Self, TransportError> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::protocol(format!(
                "bulk IN header truncated to {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != msg_id::DEV_DEP_MSG_IN {
            return Err(TransportError::protocol(format!(
                "unexpected bulk IN message id {}",
                bytes[0]
            )));
        }
        if bytes[1] != expected_tag || bytes[2] != !expected_tag {
            return Err(TransportError::protocol(format!(
                "bulk IN tag {}/{:#04x} does not match request tag {}",
                bytes[1], bytes[2], expected_tag
            )));
        }

        let transfer_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if transfer_size as usize > max_size {
            return Err(TransportError::protocol(format!(
                "bulk IN announces {transfer_size} bytes but only {max_size} were requested"
            )));
        }

        Ok(Self {
            msg_id: bytes[0],
            tag: bytes[1],
            transfer_size,
            end_of_message: bytes[8] & ATTR_END_OF_MESSAGE != 0,
        })
    }
}

/// bTag values, 1..=255. Zero is never produced.
#[derive(Debug, Clone)]
pub struct TagSequence {
    last: u8,
}

impl TagSequence {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next_tag(&mut self) -> u8 {
        self.last = self.last.wrapping_add(1).max(1);
        self.last
    }
}

impl Default for TagSequence {
    fn default() -> Self {
        Self::new()
    }
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

pub struct BulkTmcLink<P: BulkPipe> {
    pipe: P,
    tags: TagSequence,
    max_transfer: usize,
}

impl<P: BulkPipe> BulkTmcLink<P> {
    pub fn new(pipe: P, max_transfer: usize) -> Self {
        Self {
            pipe,
            tags: TagSequence::new(),
            max_transfer,
        }
    }

    pub fn write_message(&mut self, payload: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let tag = self.tags.next_tag();
        let header = BulkHeader {
            msg_id: msg_id::DEV_DEP_MSG_OUT,
            tag,
            transfer_size: u32::try_from(payload.len())
                .map_err(|_| TransportError::protocol("message too long for one bulk transfer"))?,
            end_of_message: true,
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + padded_len(payload.len()));
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        frame.resize(HEADER_LEN + padded_len(payload.len()), 0);

        log::debug!("USBTMC OUT tag {} ({} bytes)", tag, payload.len());
        self.pipe.send(&frame, timeout)
    }

    /// Read one logical message, requesting further transfers until the
    /// device sets end-of-message.
    pub fn read_message(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut message = Vec::new();
        let mut buffer = vec![0u8; HEADER_LEN + padded_len(self.max_transfer)];

        loop {
            let tag = self.tags.next_tag();
            let request = BulkHeader {
                msg_id: msg_id::REQUEST_DEV_DEP_MSG_IN,
                tag,
                transfer_size: u32::try_from(self.max_transfer).unwrap_or(u32::MAX),
                end_of_message: false,
            };
            self.pipe.send(&request.encode(), timeout)?;

            let mut received = self.pipe.receive(&mut buffer, timeout)?;
            let header = BulkHeader::decode_response(&buffer[..received], tag, self.max_transfer)?;
            let wanted = HEADER_LEN + header.transfer_size as usize;

            // Large transfers arrive over several bulk reads
            while received < wanted {
                let n = self.pipe.receive(&mut buffer[received..], timeout)?;
                if n == 0 {
                    return Err(TransportError::protocol(format!(
                        "bulk IN ended after {} of {} bytes",
                        received - HEADER_LEN,
                        header.transfer_size
                    )));
                }
                received += n;
            }

            message.extend_from_slice(&buffer[HEADER_LEN..wanted]);
            log::debug!(
                "USBTMC IN tag {} ({} bytes, eom={})",
                tag,
                header.transfer_size,
                header.end_of_message
            );

            if header.end_of_message {
                return Ok(message);
            }
        }
    }
}

impl<P: BulkPipe> ScpiTransport for BulkTmcLink<P> {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.write_message(data, timeout)
    }

    fn read(
        &mut self,
        _termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.read_message(timeout)
    }

    fn cancel_pending(&mut self) {
        self.pipe.cancel_pending();
    }

    fn close(&mut self) {
        self.pipe.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Pipe that answers each REQUEST_DEV_DEP_MSG_IN with the next scripted
    /// chunk, echoing the request's tag unless told otherwise.
    struct ScriptedPipe {
        chunks: VecDeque<(Vec<u8>, bool)>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        pending: VecDeque<u8>,
        tag_offset: u8,
    }

    impl ScriptedPipe {
        fn new(chunks: Vec<(Vec<u8>, bool)>) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    chunks: chunks.into(),
                    sent: Arc::clone(&sent),
                    pending: VecDeque::new(),
                    tag_offset: 0,
                },
                sent,
            )
        }
    }

    impl BulkPipe for ScriptedPipe {
        fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(data.to_vec());
            if data[0] == msg_id::REQUEST_DEV_DEP_MSG_IN {
                if let Some((payload, eom)) = self.chunks.pop_front() {
                    let header = BulkHeader {
                        msg_id: msg_id::DEV_DEP_MSG_IN,
                        tag: data[1].wrapping_add(self.tag_offset),
                        transfer_size: payload.len() as u32,
                        end_of_message: eom,
                    };
                    self.pending.extend(header.encode());
                    self.pending.extend(payload);
                    while self.pending.len() % 4 != 0 {
                        self.pending.push_back(0);
                    }
                }
            }
            Ok(())
        }

        fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
            if self.pending.is_empty() {
                return Err(TransportError::Timeout {
                    operation: "receiving",
                    timeout,
                });
            }
            // Deliver at most 64 bytes per call, like a full-speed bulk packet
            let n = buffer.len().min(self.pending.len()).min(64);
            for slot in buffer.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }

        fn cancel_pending(&mut self) {}

        fn close(&mut self) {}
    }

    #[test]
    fn test_tag_sequence_skips_zero() {
        let mut tags = TagSequence::new();
        let first: Vec<u8> = (0..255).map(|_| tags.next_tag()).collect();
        assert_eq!(first[0], 1);
        assert_eq!(first[254], 255);
        assert_eq!(tags.next_tag(), 1);
    }

    #[test]
    fn test_tag_complement_for_all_tags() {
        for tag in 1..=255u8 {
            let header = BulkHeader {
                msg_id: msg_id::DEV_DEP_MSG_OUT,
                tag,
                transfer_size: 0,
                end_of_message: true,
            }
            .encode();
            assert_eq!(header[2], !tag & 0xFF);
        }
    }

    #[test]
    fn test_out_header_layout_and_padding() {
        let (pipe, sent) = ScriptedPipe::new(vec![]);
        let mut link = BulkTmcLink::new(pipe, 1024);
        link.write_message(b"*IDN?\n", Duration::from_secs(1)).unwrap();

        let frame = sent.lock().unwrap()[0].clone();
        assert_eq!(frame.len(), HEADER_LEN + 8);
        assert_eq!(&frame[..4], &[1, 1, 0xFE, 0]);
        assert_eq!(&frame[4..8], &6u32.to_le_bytes());
        assert_eq!(frame[8], 0x01);
        assert_eq!(&frame[12..18], b"*IDN?\n");
        assert_eq!(&frame[18..], &[0, 0]);
    }

    #[test]
    fn test_multi_transfer_message_is_concatenated() {
        let first: Vec<u8> = (0..100u8).collect();
        let second = b"tail\n".to_vec();
        let (pipe, sent) = ScriptedPipe::new(vec![(first.clone(), false), (second.clone(), true)]);
        let mut link = BulkTmcLink::new(pipe, 1024);

        let message = link.read_message(Duration::from_secs(1)).unwrap();

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(message, expected);

        // One REQUEST_DEV_DEP_MSG_IN per transfer, each with a fresh tag
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][1], 1);
        assert_eq!(sent[1][1], 2);
        assert_eq!(&sent[0][4..8], &1024u32.to_le_bytes());
    }

    #[test]
    fn test_mismatched_tag_is_rejected() {
        let (mut pipe, _) = ScriptedPipe::new(vec![(b"1\n".to_vec(), true)]);
        pipe.tag_offset = 1;
        let mut link = BulkTmcLink::new(pipe, 1024);

        let err = link.read_message(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_oversized_response_is_rejected() {
        let header = BulkHeader {
            msg_id: msg_id::DEV_DEP_MSG_IN,
            tag: 7,
            transfer_size: 2048,
            end_of_message: true,
        }
        .encode();
        assert!(BulkHeader::decode_response(&header, 7, 1024).is_err());
        assert!(BulkHeader::decode_response(&header, 7, 4096).is_ok());
    }
}
