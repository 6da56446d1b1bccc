use crate::block_transfer::TransferProgress;
use crate::capture::Capture;
use crate::capture_engine::{CaptureEngine, CaptureError, CaptureRequest};
use crate::command_table::{Command, CommandError, ScopeSeries, SeriesProfile};
use crate::scpi_link::{LinkConfig, ScpiError, ScpiLink};
use crate::transport::DeviceDescriptor;
use std::fmt;
use std::sync::atomic::AtomicBool;

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error(transparent)]
    Scpi(#[from] ScpiError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Unexpected identification '{reply}'")]
    BadIdentity { reply: String },

    #[error("{manufacturer} {model} is not a supported oscilloscope")]
    UnsupportedModel { manufacturer: String, model: String },
}

/// Common to every SCPI instrument, so it is sent before the series is known.
const IDENTIFY_QUERY: &str = "*IDN?";

/// Fields of an `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentIdentity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl InstrumentIdentity {
    pub fn parse(reply: &str) -> Option<Self> {
        let mut fields = reply.trim().splitn(4, ',').map(str::trim);
        let manufacturer = fields.next().filter(|f| !f.is_empty())?;
        let model = fields.next().filter(|f| !f.is_empty())?;
        Some(Self {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            serial: fields.next().unwrap_or_default().to_string(),
            firmware: fields.next().unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.manufacturer, self.model, self.serial)
    }
}

/// Acquisition state as reported by the trigger status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Waiting,
    Triggered,
    Auto,
    Stopped,
}

impl RunState {
    pub fn from_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_uppercase().as_str() {
            "RUN" => Some(Self::Running),
            "WAIT" => Some(Self::Waiting),
            "TD" | "T'D" => Some(Self::Triggered),
            "AUTO" => Some(Self::Auto),
            "STOP" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// An identified oscilloscope on an open link.
pub struct Oscilloscope {
    link: ScpiLink,
    identity: InstrumentIdentity,
    profile: &'static SeriesProfile,
}

impl Oscilloscope {
    /// Connect to a scope and identify it
    #[tracing::instrument(skip(config), fields(device = %descriptor))]
    pub fn open(descriptor: &DeviceDescriptor, config: LinkConfig) -> Result<Self, ScopeError> {
        let link = ScpiLink::connect(descriptor, config)?;
        Self::from_link(link)
    }

    /// Identify the instrument behind an already open link
    pub fn from_link(mut link: ScpiLink) -> Result<Self, ScopeError> {
        let timeout = link.config().command_timeout;
        let reply = link.send_string(IDENTIFY_QUERY, timeout)?;
        let identity = InstrumentIdentity::parse(&reply).ok_or(ScopeError::BadIdentity { reply })?;
        log::debug!("Instrument: {}, firmware {}", identity, identity.firmware);

        let series = ScopeSeries::from_model(&identity.model).ok_or_else(|| {
            ScopeError::UnsupportedModel {
                manufacturer: identity.manufacturer.clone(),
                model: identity.model.clone(),
            }
        })?;
        let profile = series.profile();
        link.set_opc_support(profile.opc_support());
        log::debug!("Using the {} command set", series);

        Ok(Self {
            link,
            identity,
            profile,
        })
    }

    pub fn identity(&self) -> &InstrumentIdentity {
        &self.identity
    }

    pub fn series(&self) -> ScopeSeries {
        self.profile.series
    }

    pub fn profile(&self) -> &'static SeriesProfile {
        self.profile
    }

    pub fn link(&self) -> &ScpiLink {
        &self.link
    }

    fn send_opc(&mut self, command: Command) -> Result<(), ScopeError> {
        let command = self.profile.command(command, None)?;
        let timeout = self.link.config().command_timeout;
        self.link.send_opc_command(&command, timeout)?;
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), ScopeError> {
        self.send_opc(Command::Run)
    }

    pub fn stop(&mut self) -> Result<(), ScopeError> {
        self.send_opc(Command::Stop)
    }

    pub fn single(&mut self) -> Result<(), ScopeError> {
        self.send_opc(Command::Single)
    }

    pub fn run_state(&mut self) -> Result<RunState, ScopeError> {
        let command = self.profile.command(Command::TriggerStatus, None)?;
        let timeout = self.link.config().command_timeout;
        let status = self.link.send_string(&command, timeout)?;
        RunState::from_status(&status).ok_or_else(|| {
            ScpiError::Parse {
                command,
                response: status,
                expected: "a trigger status",
            }
            .into()
        })
    }

    /// See [`CaptureEngine::capture`].
    pub fn capture(
        &mut self,
        request: &CaptureRequest,
        abort: &AtomicBool,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<Option<Capture>, CaptureError> {
        CaptureEngine::new(&mut self.link, self.profile).capture(request, abort, progress)
    }

    /// Oldest entry of the instrument error queue, if the series has one and
    /// it can be read.
    pub fn last_error(&mut self) -> Option<String> {
        let command = self.profile.command(Command::LastError, None).ok()?;
        let timeout = self.link.config().command_timeout;
        match self.link.send_string(&command, timeout) {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::debug!("Could not read the instrument error queue: {}", e);
                None
            }
        }
    }

    pub fn close(mut self) {
        self.link.dispose();
    }
}
