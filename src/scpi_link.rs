use crate::bulk_frame::BulkTmcLink;
use crate::bulk_transport::{DeviceNodeLink, ThreadedBulkPipe, UsbBulkPipe};
use crate::raw_socket::{self, RawSocketTransport};
use crate::rpc_client::RpcClient;
use crate::transport::{
    DeviceDescriptor, ScpiTransport, StreamTermination, TransportError, TransportKind,
};
use std::thread;
use std::time::{Duration, Instant};

/// How an instrument signals that an overlapped command has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcSupport {
    /// Poll this query (normally `*OPC?`) until it answers `1`
    Query(&'static str),
    /// The instrument cannot answer `*OPC?`; wait this long instead
    ReplacementDelay(Duration),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub command_timeout: Duration,
    pub data_timeout: Duration,
    pub opc_poll_interval: Duration,
    pub opc: OpcSupport,
    pub usb_max_transfer: usize,
    pub vxi11_device_name: String,
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            data_timeout: Duration::from_secs(10),
            opc_poll_interval: Duration::from_millis(200),
            opc: OpcSupport::Query("*OPC?"),
            usb_max_transfer: 1024 * 1024,
            vxi11_device_name: "inst0".to_string(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl LinkConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    pub fn with_opc_poll_interval(mut self, interval: Duration) -> Self {
        self.opc_poll_interval = interval;
        self
    }

    pub fn with_opc(mut self, opc: OpcSupport) -> Self {
        self.opc = opc;
        self
    }

    pub fn with_vxi11_device_name(mut self, name: impl Into<String>) -> Self {
        self.vxi11_device_name = name.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScpiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Cannot interpret reply '{response}' to '{command}' as {expected}")]
    Parse {
        command: String,
        response: String,
        expected: &'static str,
    },
}

impl ScpiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }
}

/// Text of an ASCII reply: everything before the first line feed.
fn first_line(response: &[u8]) -> String {
    let line = response
        .iter()
        .position(|&b| b == b'\n')
        .map_or(response, |end| &response[..end]);
    String::from_utf8_lossy(line).trim().to_string()
}

/// One SCPI conversation with one instrument, whatever carries it.
pub struct ScpiLink {
    transport: Option<Box<dyn ScpiTransport>>,
    config: LinkConfig,
}

impl ScpiLink {
    #[tracing::instrument(skip(config), fields(device = %descriptor))]
    pub fn connect(descriptor: &DeviceDescriptor, config: LinkConfig) -> Result<Self, ScpiError> {
        let transport: Box<dyn ScpiTransport> = match descriptor.kind {
            TransportKind::UsbTmc if descriptor.path.starts_with("usb:") => Box::new(
                BulkTmcLink::new(UsbBulkPipe::open(descriptor)?, config.usb_max_transfer),
            ),
            // Kernel device nodes frame the messages themselves
            TransportKind::UsbTmc => Box::new(DeviceNodeLink::new(
                ThreadedBulkPipe::open(&descriptor.path)?,
                config.usb_max_transfer,
            )),
            TransportKind::RawTcp => {
                let (host, port) = descriptor.host_and_port();
                Box::new(RawSocketTransport::connect(
                    host,
                    port.unwrap_or(raw_socket::DEFAULT_PORT),
                    config.connect_timeout,
                )?)
            }
            TransportKind::Vxi11 => {
                let (host, port) = descriptor.host_and_port();
                let mut client = RpcClient::connect(host, port, config.connect_timeout)?;
                client.create_link(&config.vxi11_device_name)?;
                Box::new(client)
            }
        };

        log::debug!("Connected to {}", descriptor);
        Ok(Self::from_transport(transport, config))
    }

    pub fn from_transport(transport: Box<dyn ScpiTransport>, config: LinkConfig) -> Self {
        Self {
            transport: Some(transport),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn set_opc_support(&mut self, opc: OpcSupport) {
        self.config.opc = opc;
    }

    fn transport(&mut self) -> Result<&mut Box<dyn ScpiTransport>, TransportError> {
        self.transport.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Send a command that produces no reply.
    pub fn send_command(&mut self, command: &str) -> Result<(), ScpiError> {
        let timeout = self.config.command_timeout;
        log::debug!("> {}", command);
        let line = format!("{command}\n");
        self.transport()?.write(line.as_bytes(), timeout)?;
        Ok(())
    }

    fn exchange(
        &mut self,
        command: &str,
        termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, ScpiError> {
        log::debug!("> {}", command);
        let line = format!("{command}\n");
        let transport = self.transport()?;

        let result = transport
            .write(line.as_bytes(), timeout)
            .and_then(|()| transport.read(termination, timeout));
        if let Err(e) = &result {
            if e.is_timeout() {
                transport.cancel_pending();
            }
        }
        Ok(result?)
    }

    pub fn send_string(&mut self, command: &str, timeout: Duration) -> Result<String, ScpiError> {
        let response = self.exchange(command, StreamTermination::Terminator, timeout)?;
        let text = first_line(&response);
        log::debug!("< {}", text);
        Ok(text)
    }

    pub fn send_double(&mut self, command: &str, timeout: Duration) -> Result<f64, ScpiError> {
        let text = self.send_string(command, timeout)?;
        text.parse().map_err(|_| ScpiError::Parse {
            command: command.to_string(),
            response: text,
            expected: "a number",
        })
    }

    pub fn send_bool(&mut self, command: &str, timeout: Duration) -> Result<bool, ScpiError> {
        let text = self.send_string(command, timeout)?;
        match text.to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            _ => Err(ScpiError::Parse {
                command: command.to_string(),
                response: text,
                expected: "a boolean",
            }),
        }
    }

    /// Send a query whose reply is binary. Over raw TCP the caller must pick
    /// the termination strategy that matches the payload.
    pub fn send_bytes(
        &mut self,
        command: &str,
        termination: StreamTermination,
        timeout: Duration,
    ) -> Result<Vec<u8>, ScpiError> {
        let response = self.exchange(command, termination, timeout)?;
        log::debug!("< {} bytes", response.len());
        Ok(response)
    }

    /// Send `command` and wait until the instrument has finished executing
    /// it.
    pub fn send_opc_command(&mut self, command: &str, timeout: Duration) -> Result<(), ScpiError> {
        let deadline = Instant::now() + timeout;
        self.send_command(command)?;

        match self.config.opc {
            OpcSupport::ReplacementDelay(delay) => {
                log::debug!("No *OPC? support, waiting {:?} after '{}'", delay, command);
                thread::sleep(delay);
                Ok(())
            }
            OpcSupport::Query(query) => {
                let interval = self.config.opc_poll_interval;
                let mut polls = 0u32;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.cancel_pending();
                        return Err(TransportError::Timeout {
                            operation: "waiting for operation complete",
                            timeout,
                        }
                        .into());
                    }

                    polls += 1;
                    if self.send_string(query, remaining)? == "1" {
                        log::debug!("'{}' complete after {} poll(s)", command, polls);
                        return Ok(());
                    }
                    thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
                }
            }
        }
    }

    pub fn cancel_pending(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.cancel_pending();
        }
    }

    /// Release the transport. Calling this more than once is harmless.
    pub fn dispose(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            log::debug!("SCPI link closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }
}

impl Drop for ScpiLink {
    fn drop(&mut self) {
        self.dispose();
    }
}
