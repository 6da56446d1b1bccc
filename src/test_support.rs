//! Scripted instrument for unit tests.

use crate::transport::{ScpiTransport, StreamTermination, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Option<Vec<u8>> + Send>;

/// Answers each written command through a closure. Commands without a reply
/// leave nothing to read, so a following read times out.
pub struct MockInstrument {
    responder: Responder,
    pending: VecDeque<Vec<u8>>,
    log: Arc<Mutex<Vec<String>>>,
    cancels: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockInstrument {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every command written so far, without the line feed.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    pub fn cancel_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.cancels)
    }

    pub fn close_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl ScpiTransport for MockInstrument {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let command = String::from_utf8_lossy(data).trim_end().to_string();
        if let Some(reply) = (self.responder)(&command) {
            self.pending.push_back(reply);
        }
        self.log.lock().unwrap().push(command);
        Ok(())
    }

    fn read(
        &mut self,
        _termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.pending.pop_front().ok_or(TransportError::Timeout {
            operation: "reading from mock",
            timeout,
        })
    }

    fn cancel_pending(&mut self) {
        self.pending.clear();
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wrap `payload` in a `#9` definite-length block with a trailing line feed.
pub fn ieee_block(payload: &[u8]) -> Vec<u8> {
    let mut block = format!("#9{:09}", payload.len()).into_bytes();
    block.extend_from_slice(payload);
    block.push(b'\n');
    block
}
