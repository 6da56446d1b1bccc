//! Blocking, length-bounded bulk transfers with explicit timeouts.
//!
//! Two pipe implementations exist: [`UsbBulkPipe`] talks to a USBTMC
//! interface through `rusb`, and [`ThreadedBulkPipe`] turns any blocking
//! `Read + Write` device node into a pipe with bounded waits by running the
//! I/O on a worker thread. [`DeviceNodeLink`] carries SCPI over such a node.

use crate::transport::{DeviceDescriptor, ScpiTransport, StreamTermination, TransportError};
use rusb::UsbContext;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

pub mod usbtmc {
    /// USB interface class for test and measurement devices
    pub const CLASS_CODE: u8 = 0xFE;
    /// USBTMC subclass
    pub const SUBCLASS_CODE: u8 = 0x03;
}

/// A bulk endpoint pair that moves whole buffers with a deadline.
pub trait BulkPipe: Send {
    /// Send all of `data`. Any operation still outstanding on the pipe is
    /// cancelled first.
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Receive at most `buffer.len()` bytes, returning how many arrived.
    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    fn cancel_pending(&mut self);

    fn close(&mut self);
}

impl<P: BulkPipe + ?Sized> BulkPipe for Box<P> {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).send(data, timeout)
    }

    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).receive(buffer, timeout)
    }

    fn cancel_pending(&mut self) {
        (**self).cancel_pending();
    }

    fn close(&mut self) {
        (**self).close();
    }
}

struct TmcInterface {
    number: u8,
    setting: u8,
    bulk_in: u8,
    bulk_out: u8,
}

fn find_tmc_interface<T: rusb::UsbContext>(device: &rusb::Device<T>) -> Option<TmcInterface> {
    let config = device.active_config_descriptor().ok()?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != usbtmc::CLASS_CODE
                || descriptor.sub_class_code() != usbtmc::SUBCLASS_CODE
            {
                continue;
            }

            let mut bulk_in = None;
            let mut bulk_out = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != rusb::TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    rusb::Direction::In => bulk_in = bulk_in.or(Some(endpoint.address())),
                    rusb::Direction::Out => bulk_out = bulk_out.or(Some(endpoint.address())),
                }
            }

            if let (Some(bulk_in), Some(bulk_out)) = (bulk_in, bulk_out) {
                return Some(TmcInterface {
                    number: descriptor.interface_number(),
                    setting: descriptor.setting_number(),
                    bulk_in,
                    bulk_out,
                });
            }
        }
    }

    None
}

fn product_name<T: rusb::UsbContext>(device: &rusb::Device<T>) -> String {
    let Ok(descriptor) = device.device_descriptor() else {
        return "USBTMC device".to_string();
    };

    device
        .open()
        .and_then(|handle| handle.read_product_string_ascii(&descriptor))
        .unwrap_or_else(|_| {
            format!(
                "{:04x}:{:04x}",
                descriptor.vendor_id(),
                descriptor.product_id()
            )
        })
}

fn parse_usb_path(path: &str) -> Option<(u8, u8)> {
    let mut parts = path.strip_prefix("usb:")?.split(':');
    let bus = parts.next()?.parse().ok()?;
    let address = parts.next()?.parse().ok()?;
    Some((bus, address))
}

/// A fresh libusb session. Fails instead of panicking when the host has no
/// usable USB stack.
fn usb_context() -> Result<rusb::Context, TransportError> {
    rusb::Context::new().map_err(|e| {
        log::debug!("libusb is unavailable: {}", e);
        TransportError::Usb(e)
    })
}

/// List every attached device exposing a USBTMC interface.
pub fn enumerate_usbtmc() -> Result<Vec<DeviceDescriptor>, TransportError> {
    let context = usb_context()?;
    let mut devices = Vec::new();

    for device in context.devices()?.iter() {
        if find_tmc_interface(&device).is_none() {
            continue;
        }
        devices.push(DeviceDescriptor::usb(
            product_name(&device),
            device.bus_number(),
            device.address(),
        ));
    }

    log::debug!("Found {} USBTMC device(s)", devices.len());
    Ok(devices)
}

pub struct UsbBulkPipe {
    handle: rusb::DeviceHandle<rusb::Context>,
    path: String,
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
    stalled: bool,
    closed: bool,
}

impl UsbBulkPipe {
    pub fn open(descriptor: &DeviceDescriptor) -> Result<Self, TransportError> {
        let path = descriptor.path.clone();
        let (bus, address) = parse_usb_path(&path).ok_or_else(|| TransportError::Open {
            path: path.clone(),
            reason: "expected a path of the form usb:<bus>:<address>".to_string(),
        })?;

        let device = usb_context()?
            .devices()?
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or_else(|| TransportError::NotPresent { path: path.clone() })?;

        let tmc = find_tmc_interface(&device).ok_or_else(|| TransportError::Open {
            path: path.clone(),
            reason: "device has no USBTMC interface".to_string(),
        })?;

        let handle = device.open().map_err(|e| match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => {
                TransportError::NotPresent { path: path.clone() }
            }
            other => TransportError::Open {
                path: path.clone(),
                reason: other.to_string(),
            },
        })?;

        // Not supported on every platform
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .claim_interface(tmc.number)
            .map_err(|e| TransportError::Open {
                path: path.clone(),
                reason: format!("cannot claim interface {}: {e}", tmc.number),
            })?;
        if tmc.setting != 0 {
            handle.set_alternate_setting(tmc.number, tmc.setting)?;
        }

        log::debug!(
            "Opened USBTMC device {} (interface {}, in 0x{:02x}, out 0x{:02x})",
            path,
            tmc.number,
            tmc.bulk_in,
            tmc.bulk_out
        );

        Ok(Self {
            handle,
            path,
            interface: tmc.number,
            bulk_in: tmc.bulk_in,
            bulk_out: tmc.bulk_out,
            stalled: false,
            closed: false,
        })
    }

    fn classify(&mut self, error: rusb::Error, operation: &'static str, timeout: Duration) -> TransportError {
        match error {
            rusb::Error::Timeout => {
                self.stalled = true;
                TransportError::Timeout { operation, timeout }
            }
            rusb::Error::NoDevice => TransportError::Unavailable {
                path: self.path.clone(),
                reason: "device disappeared".to_string(),
            },
            other => TransportError::Usb(other),
        }
    }
}

impl BulkPipe for UsbBulkPipe {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        self.cancel_pending();

        let written = self
            .handle
            .write_bulk(self.bulk_out, data, timeout)
            .map_err(|e| self.classify(e, "sending on the bulk OUT endpoint", timeout))?;

        if written != data.len() {
            return Err(TransportError::ShortTransfer {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }

        self.handle
            .read_bulk(self.bulk_in, buffer, timeout)
            .map_err(|e| self.classify(e, "receiving on the bulk IN endpoint", timeout))
    }

    fn cancel_pending(&mut self) {
        if !self.stalled {
            return;
        }
        log::debug!("Clearing bulk endpoints of {} after a timed out transfer", self.path);
        let _ = self.handle.clear_halt(self.bulk_out);
        let _ = self.handle.clear_halt(self.bulk_in);
        self.stalled = false;
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.handle.release_interface(self.interface);
        self.closed = true;
    }
}

impl Drop for UsbBulkPipe {
    fn drop(&mut self) {
        self.close();
    }
}

enum Job {
    Write(Vec<u8>),
    Read(usize),
}

enum Completion {
    Written(std::io::Result<usize>),
    Read(std::io::Result<Vec<u8>>),
}

/// Bulk pipe over a blocking device node.
///
/// Each operation is handed to a worker thread and awaited with a deadline.
/// When the deadline passes the operation is abandoned: its completion, if
/// it ever arrives, carries a stale generation number and is dropped.
pub struct ThreadedBulkPipe {
    path: String,
    jobs: Option<Sender<(u64, Job)>>,
    completions: Receiver<(u64, Completion)>,
    generation: u64,
}

impl ThreadedBulkPipe {
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TransportError::NotPresent {
                    path: path.to_string(),
                },
                _ => TransportError::Open {
                    path: path.to_string(),
                    reason: e.to_string(),
                },
            })?;

        Ok(Self::spawn(path, file))
    }

    /// Wrap an already opened device.
    pub fn spawn<D>(path: impl Into<String>, mut device: D) -> Self
    where
        D: Read + Write + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<(u64, Job)>();
        let (done_tx, done_rx) = mpsc::channel();

        thread::spawn(move || {
            for (generation, job) in job_rx {
                let completion = match job {
                    Job::Write(data) => Completion::Written(device.write(&data)),
                    Job::Read(capacity) => {
                        let mut buffer = vec![0u8; capacity];
                        Completion::Read(device.read(&mut buffer).map(|n| {
                            buffer.truncate(n);
                            buffer
                        }))
                    }
                };
                if done_tx.send((generation, completion)).is_err() {
                    break;
                }
            }
        });

        Self {
            path: path.into(),
            jobs: Some(job_tx),
            completions: done_rx,
            generation: 0,
        }
    }

    fn submit(
        &mut self,
        job: Job,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<Completion, TransportError> {
        let jobs = self.jobs.as_ref().ok_or(TransportError::NotConnected)?;

        self.generation += 1;
        let generation = self.generation;
        jobs.send((generation, job))
            .map_err(|_| TransportError::Unavailable {
                path: self.path.clone(),
                reason: "I/O worker stopped".to_string(),
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok((g, completion)) if g == generation => return Ok(completion),
                Ok((g, _)) => {
                    log::debug!("Discarding late completion of cancelled operation {}", g);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.cancel_pending();
                    return Err(TransportError::Timeout { operation, timeout });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Unavailable {
                        path: self.path.clone(),
                        reason: "I/O worker stopped".to_string(),
                    });
                }
            }
        }
    }

    /// A device node whose instrument went away (unplugged, or the host
    /// resumed from sleep) is unavailable rather than a plain I/O failure.
    fn classify(&self, error: std::io::Error) -> TransportError {
        match error.raw_os_error() {
            Some(code) if DEVICE_GONE_ERRNOS.contains(&code) => TransportError::Unavailable {
                path: self.path.clone(),
                reason: error.to_string(),
            },
            _ => TransportError::Io(error),
        }
    }
}

/// ENXIO, ENODEV and ESHUTDOWN
const DEVICE_GONE_ERRNOS: [i32; 3] = [6, 19, 108];

impl BulkPipe for ThreadedBulkPipe {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.cancel_pending();

        match self.submit(Job::Write(data.to_vec()), "writing to the device", timeout)? {
            Completion::Written(Ok(n)) if n == data.len() => Ok(()),
            Completion::Written(Ok(n)) => Err(TransportError::ShortTransfer {
                expected: data.len(),
                actual: n,
            }),
            Completion::Written(Err(e)) => Err(self.classify(e)),
            Completion::Read(_) => Err(TransportError::protocol("write completed as a read")),
        }
    }

    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self.submit(Job::Read(buffer.len()), "reading from the device", timeout)? {
            Completion::Read(Ok(data)) => {
                buffer[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Completion::Read(Err(e)) => Err(self.classify(e)),
            Completion::Written(_) => Err(TransportError::protocol("read completed as a write")),
        }
    }

    fn cancel_pending(&mut self) {
        // Anything already queued belongs to an abandoned operation
        self.generation += 1;
        while self.completions.try_recv().is_ok() {}
    }

    fn close(&mut self) {
        // Dropping the sender lets the worker exit once its current call returns
        self.jobs = None;
    }
}

impl Drop for ThreadedBulkPipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// SCPI over a kernel USBTMC character device such as `/dev/usbtmc0`.
///
/// The kernel driver adds and strips the bulk headers itself, so messages
/// pass through untouched. A read that fills the whole buffer means the
/// driver holds more of the same message.
pub struct DeviceNodeLink<P: BulkPipe> {
    pipe: P,
    max_transfer: usize,
}

impl<P: BulkPipe> DeviceNodeLink<P> {
    pub fn new(pipe: P, max_transfer: usize) -> Self {
        Self {
            pipe,
            max_transfer: max_transfer.max(1),
        }
    }
}

impl<P: BulkPipe> ScpiTransport for DeviceNodeLink<P> {
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.pipe.send(data, timeout)
    }

    fn read(
        &mut self,
        _termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut response = Vec::new();
        let mut buffer = vec![0u8; self.max_transfer];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    operation: "reading from the device",
                    timeout,
                });
            }
            let n = self.pipe.receive(&mut buffer, remaining)?;
            response.extend_from_slice(&buffer[..n]);
            if n < buffer.len() {
                return Ok(response);
            }
        }
    }

    fn cancel_pending(&mut self) {
        self.pipe.cancel_pending();
    }

    fn close(&mut self) {
        self.pipe.close();
    }
}
