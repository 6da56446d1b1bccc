//! Per-series SCPI vocabulary and instrument constants.
//!
//! Every series maps logical [`Command`]s to template strings. Templates
//! may take one number, written `{n}`, for a channel or pod. A command
//! missing from a table is not supported by that series.

use crate::scpi_link::OpcSupport;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    OperationComplete,
    LastError,
    Run,
    Stop,
    Single,
    TriggerStatus,
    ChannelScale,
    ChannelOffset,
    MathDisplayed,
    WaveformSourceChannel,
    WaveformSourceDigital,
    WaveformSourcePod,
    WaveformModeNormal,
    WaveformModeRaw,
    WaveformFormatByte,
    WaveformStart,
    WaveformStop,
    WaveformData,
    WaveformPreamble,
    SampleRate,
    TimebaseScale,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeSeries {
    Ds1000e,
    Ds1000z,
    Mso5000,
}

impl ScopeSeries {
    /// Recognise the series from the model field of `*IDN?`.
    pub fn from_model(model: &str) -> Option<Self> {
        let model = model.trim().to_ascii_uppercase();
        // Variant suffixes such as "-S" or "-E" do not change the command set
        let model = model.split('-').next().unwrap_or_default();
        let digits: String = model
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();

        if model.starts_with("MSO5") {
            return Some(Self::Mso5000);
        }
        if (model.starts_with("DS1") || model.starts_with("MSO1")) && model.ends_with('Z') {
            return Some(Self::Ds1000z);
        }
        if model.starts_with("DS1") && digits.len() == 4 && (model.ends_with('E') || model.ends_with('D')) {
            return Some(Self::Ds1000e);
        }
        None
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ds1000e => "DS1000E",
            Self::Ds1000z => "DS1000Z",
            Self::Mso5000 => "MSO5000",
        }
    }

    pub fn profile(self) -> &'static SeriesProfile {
        match self {
            Self::Ds1000e => &DS1000E,
            Self::Ds1000z => &DS1000Z,
            Self::Mso5000 => &MSO5000,
        }
    }
}

impl fmt::Display for ScopeSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How raw 8-bit samples become volts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogFormula {
    /// Older firmware: derived from the channel's vertical scale and offset
    ScaleOffset,
    /// Origin, reference and increment taken from the waveform preamble
    Preamble,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("'{command}' is not supported by the {series} series")]
    Unsupported {
        command: Command,
        series: ScopeSeries,
    },

    #[error("Cannot format '{command}': {reason}")]
    Format { command: Command, reason: String },
}

#[derive(Debug, Clone)]
pub struct SeriesProfile {
    pub series: ScopeSeries,
    commands: &'static [(Command, &'static str)],
    /// Wait after an overlapped command when the table has no
    /// `OperationComplete` query
    pub opc_replacement_delay: Duration,
    /// Largest number of samples one `:WAV:DATA?` may return
    pub max_block_bytes: usize,
    pub horizontal_divisions: f64,
    pub analog_formula: AnalogFormula,
    pub analog_channels: u8,
    pub digital_channels: u8,
    /// Samples shown on screen, used when the series has no preamble query
    pub screen_points: usize,
    /// Bytes of `#N<digits>` in front of every binary block
    pub block_header_len: usize,
}

impl SeriesProfile {
    pub fn template(&self, command: Command) -> Option<&'static str> {
        self.commands
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, template)| *template)
    }

    pub fn supports(&self, command: Command) -> bool {
        self.template(command).is_some()
    }

    /// Resolve `command` to the string this series expects, substituting
    /// `arg` for the channel/pod placeholder.
    pub fn command(&self, command: Command, arg: Option<u32>) -> Result<String, CommandError> {
        let template = self.template(command).ok_or(CommandError::Unsupported {
            command,
            series: self.series,
        })?;

        if !template.contains('{') {
            return Ok(template.to_string());
        }

        let arg = arg.ok_or_else(|| CommandError::Format {
            command,
            reason: "a channel or pod number is required".to_string(),
        })?;
        let mut vars = HashMap::new();
        vars.insert("n".to_string(), arg.to_string());

        strfmt::strfmt(template, &vars).map_err(|e| CommandError::Format {
            command,
            reason: e.to_string(),
        })
    }

    /// How this series reports completion of an overlapped command.
    pub fn opc_support(&self) -> OpcSupport {
        match self.template(Command::OperationComplete) {
            Some(query) => OpcSupport::Query(query),
            None => OpcSupport::ReplacementDelay(self.opc_replacement_delay),
        }
    }

    pub fn digital_pods(&self) -> u8 {
        self.digital_channels.div_ceil(8)
    }

    /// Copy of this profile with a different per-block sample limit, for
    /// firmware that accepts larger or smaller windows.
    pub fn with_max_block_bytes(&self, limit: usize) -> Self {
        Self {
            max_block_bytes: limit.max(1),
            ..self.clone()
        }
    }
}

static DS1000E: SeriesProfile = SeriesProfile {
    series: ScopeSeries::Ds1000e,
    commands: &[
        (Command::Run, ":RUN"),
        (Command::Stop, ":STOP"),
        (Command::TriggerStatus, ":TRIG:STAT?"),
        (Command::ChannelScale, ":CHAN{n}:SCAL?"),
        (Command::ChannelOffset, ":CHAN{n}:OFFS?"),
        (Command::MathDisplayed, ":MATH:DISP?"),
        (Command::WaveformModeNormal, ":WAV:POIN:MODE NOR"),
        (Command::WaveformModeRaw, ":WAV:POIN:MODE RAW"),
        (Command::WaveformData, ":WAV:DATA? CHAN{n}"),
        (Command::SampleRate, ":ACQ:SAMP? CHAN1"),
        (Command::TimebaseScale, ":TIM:SCAL?"),
    ],
    opc_replacement_delay: Duration::from_millis(500),
    max_block_bytes: 1_048_576,
    horizontal_divisions: 12.0,
    analog_formula: AnalogFormula::ScaleOffset,
    analog_channels: 2,
    digital_channels: 0,
    screen_points: 600,
    block_header_len: 10,
};

static DS1000Z: SeriesProfile = SeriesProfile {
    series: ScopeSeries::Ds1000z,
    commands: &[
        (Command::OperationComplete, "*OPC?"),
        (Command::LastError, ":SYST:ERR?"),
        (Command::Run, ":RUN"),
        (Command::Stop, ":STOP"),
        (Command::Single, ":SING"),
        (Command::TriggerStatus, ":TRIG:STAT?"),
        (Command::ChannelScale, ":CHAN{n}:SCAL?"),
        (Command::ChannelOffset, ":CHAN{n}:OFFS?"),
        (Command::MathDisplayed, ":MATH:DISP?"),
        (Command::WaveformSourceChannel, ":WAV:SOUR CHAN{n}"),
        (Command::WaveformSourceDigital, ":WAV:SOUR D{n}"),
        (Command::WaveformModeNormal, ":WAV:MODE NORM"),
        (Command::WaveformModeRaw, ":WAV:MODE RAW"),
        (Command::WaveformFormatByte, ":WAV:FORM BYTE"),
        (Command::WaveformStart, ":WAV:STAR {n}"),
        (Command::WaveformStop, ":WAV:STOP {n}"),
        (Command::WaveformData, ":WAV:DATA?"),
        (Command::WaveformPreamble, ":WAV:PRE?"),
        (Command::SampleRate, ":ACQ:SRAT?"),
        (Command::TimebaseScale, ":TIM:SCAL?"),
    ],
    opc_replacement_delay: Duration::ZERO,
    max_block_bytes: 250_000,
    horizontal_divisions: 12.0,
    analog_formula: AnalogFormula::Preamble,
    analog_channels: 4,
    digital_channels: 16,
    screen_points: 1200,
    block_header_len: 11,
};

static MSO5000: SeriesProfile = SeriesProfile {
    series: ScopeSeries::Mso5000,
    commands: &[
        (Command::OperationComplete, "*OPC?"),
        (Command::LastError, ":SYST:ERR?"),
        (Command::Run, ":RUN"),
        (Command::Stop, ":STOP"),
        (Command::Single, ":SING"),
        (Command::TriggerStatus, ":TRIG:STAT?"),
        (Command::ChannelScale, ":CHAN{n}:SCAL?"),
        (Command::ChannelOffset, ":CHAN{n}:OFFS?"),
        (Command::MathDisplayed, ":MATH1:DISP?"),
        (Command::WaveformSourceChannel, ":WAV:SOUR CHAN{n}"),
        (Command::WaveformSourceDigital, ":WAV:SOUR D{n}"),
        (Command::WaveformSourcePod, ":WAV:SOUR POD{n}"),
        (Command::WaveformModeNormal, ":WAV:MODE NORM"),
        (Command::WaveformModeRaw, ":WAV:MODE RAW"),
        (Command::WaveformFormatByte, ":WAV:FORM BYTE"),
        (Command::WaveformStart, ":WAV:STAR {n}"),
        (Command::WaveformStop, ":WAV:STOP {n}"),
        (Command::WaveformData, ":WAV:DATA?"),
        (Command::WaveformPreamble, ":WAV:PRE?"),
        (Command::SampleRate, ":ACQ:SRAT?"),
        (Command::TimebaseScale, ":TIM:SCAL?"),
    ],
    opc_replacement_delay: Duration::ZERO,
    max_block_bytes: 250_000,
    horizontal_divisions: 10.0,
    analog_formula: AnalogFormula::Preamble,
    analog_channels: 4,
    digital_channels: 16,
    screen_points: 1000,
    block_header_len: 11,
};
