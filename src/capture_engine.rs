//! Turns a capture request into SCPI exchanges and a finished [`Capture`].

use crate::block_transfer::{read_block, read_memory_chunked, BlockError, TransferProgress};
use crate::capture::{Capture, Channel};
use crate::command_table::{AnalogFormula, Command, CommandError, SeriesProfile};
use crate::preamble::{
    normalize_digital, seconds_to_ps, to_volts, unpack_pod, Preamble, PreambleError,
    VerticalSetting,
};
use crate::scpi_link::{ScpiError, ScpiLink};
use crate::transport::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Durations closer than this fraction count as the same value.
const DURATION_TOLERANCE: f64 = 1e-3;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Scpi(#[from] ScpiError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Malformed waveform block: {0}")]
    Block(#[from] BlockError),

    #[error(transparent)]
    Preamble(#[from] PreambleError),

    #[error("Instrument sent an empty block for the window starting at sample {first}")]
    EmptyBlock { first: usize },

    #[error("Acquisition must be stopped for this capture (trigger status '{status}'); stop the scope first")]
    NotStopped { status: String },

    #[error("Raw memory cannot be read while a math channel is shown; turn math off first")]
    MathChannelActive,

    #[error("No waveform data available for {channel}")]
    NoWaveformData { channel: String },

    #[error("Invalid capture request: {0}")]
    InvalidRequest(String),
}

impl CaptureError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Scpi(e) => e.is_timeout(),
            Self::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformSource {
    /// What the display shows, one source at a time
    Screen,
    /// The full acquisition memory, read in windows; digital inputs by pod
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// 1-based analog channel numbers
    pub analog_channels: Vec<u8>,
    /// 0-based digital channel numbers
    pub digital_channels: Vec<u8>,
    pub source: WaveformSource,
}

impl CaptureRequest {
    pub fn screen(analog_channels: &[u8]) -> Self {
        Self {
            analog_channels: analog_channels.to_vec(),
            digital_channels: Vec::new(),
            source: WaveformSource::Screen,
        }
    }

    pub fn memory(analog_channels: &[u8]) -> Self {
        Self {
            source: WaveformSource::Memory,
            ..Self::screen(analog_channels)
        }
    }

    pub fn with_digital(mut self, digital_channels: &[u8]) -> Self {
        self.digital_channels = digital_channels.to_vec();
        self
    }

    pub fn channel_count(&self) -> usize {
        self.analog_channels.len() + self.digital_channels.len()
    }
}

/// Every total duration the instrument reported during one capture.
#[derive(Debug, Default)]
struct DurationReport {
    values: Vec<(String, f64)>,
}

impl DurationReport {
    fn record(&mut self, origin: impl Into<String>, seconds: f64) {
        self.values.push((origin.into(), seconds));
    }

    fn distinct(&self) -> Vec<f64> {
        let mut distinct: Vec<f64> = Vec::new();
        for &(_, value) in &self.values {
            let known = distinct
                .iter()
                .any(|d| (d - value).abs() <= DURATION_TOLERANCE * d.abs().max(value.abs()));
            if !known {
                distinct.push(value);
            }
        }
        distinct
    }

    /// A warning when the instrument contradicted itself.
    fn conflict(&self) -> Option<String> {
        if self.distinct().len() < 2 {
            return None;
        }
        let listed: Vec<String> = self
            .values
            .iter()
            .map(|(origin, value)| format!("{origin} {value:e} s"))
            .collect();
        Some(format!(
            "Instrument reports differing capture durations ({}); using the timebase value",
            listed.join(", ")
        ))
    }
}

/// Runs one capture against an open link. Holds no state of its own beyond
/// the link and the series it talks to.
pub struct CaptureEngine<'a> {
    link: &'a mut ScpiLink,
    profile: &'a SeriesProfile,
}

impl<'a> CaptureEngine<'a> {
    pub fn new(link: &'a mut ScpiLink, profile: &'a SeriesProfile) -> Self {
        Self { link, profile }
    }

    /// Transfer every requested channel. Returns `Ok(None)` if `abort` was
    /// raised before the transfer finished.
    #[tracing::instrument(skip_all, fields(series = %self.profile.series, source = ?request.source))]
    pub fn capture(
        &mut self,
        request: &CaptureRequest,
        abort: &AtomicBool,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<Option<Capture>, CaptureError> {
        let result = self.run(request, abort, progress);
        if let Err(e) = &result {
            self.report_instrument_error(e);
        }
        result
    }

    fn run(
        &mut self,
        request: &CaptureRequest,
        abort: &AtomicBool,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<Option<Capture>, CaptureError> {
        self.validate(request)?;
        self.check_preconditions(request)?;
        self.configure(request.source)?;

        let timebase = self.query_double(Command::TimebaseScale, None)?;
        let global_duration = timebase * self.profile.horizontal_divisions;
        let mut durations = DurationReport::default();
        durations.record("timebase", global_duration);
        log::debug!("Timebase {:e} s/div, {:e} s on screen", timebase, global_duration);

        let mut channels = Vec::with_capacity(request.channel_count());
        for &number in &request.analog_channels {
            if abort.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match self.capture_analog(number, request.source, global_duration, abort, progress, &mut durations)? {
                Some(channel) => channels.push(channel),
                None => return Ok(None),
            }
        }

        match self.capture_digital(request, abort, progress, &mut durations)? {
            Some(digital) => channels.extend(digital),
            None => return Ok(None),
        }

        let total_samples = channels.iter().map(Channel::len).max().unwrap_or(0);
        if total_samples == 0 {
            return Err(CaptureError::NoWaveformData {
                channel: "any requested channel".to_string(),
            });
        }

        let mut capture = Capture::new(
            seconds_to_ps(global_duration / total_samples as f64),
            total_samples,
        );
        if let Some(warning) = durations.conflict() {
            log::warn!("{}", warning);
            capture.warnings.push(warning);
        }
        for channel in channels {
            capture.push(channel);
        }

        log::info!(
            "Captured {} channel(s), {} samples at {} ps",
            capture.channels.len(),
            capture.total_samples,
            capture.sample_interval_ps
        );
        Ok(Some(capture))
    }

    fn validate(&self, request: &CaptureRequest) -> Result<(), CaptureError> {
        if request.channel_count() == 0 {
            return Err(CaptureError::InvalidRequest("no channels requested".to_string()));
        }

        let series = self.profile.series;
        if let Some(ch) = request
            .analog_channels
            .iter()
            .find(|&&ch| ch == 0 || ch > self.profile.analog_channels)
        {
            return Err(CaptureError::InvalidRequest(format!(
                "{series} has no analog channel {ch}"
            )));
        }
        if let Some(d) = request
            .digital_channels
            .iter()
            .find(|&&d| d >= self.profile.digital_channels)
        {
            return Err(CaptureError::InvalidRequest(format!(
                "{series} has no digital channel D{d}"
            )));
        }

        let has_duplicates = |channels: &[u8]| {
            channels
                .iter()
                .enumerate()
                .any(|(i, ch)| channels[..i].contains(ch))
        };
        if has_duplicates(&request.analog_channels) || has_duplicates(&request.digital_channels) {
            return Err(CaptureError::InvalidRequest(
                "a channel is requested twice".to_string(),
            ));
        }
        Ok(())
    }

    fn check_preconditions(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        let memory = request.source == WaveformSource::Memory;

        if request.channel_count() > 1 || memory {
            let status = self.query_string(Command::TriggerStatus)?;
            if !status.eq_ignore_ascii_case("STOP") {
                return Err(CaptureError::NotStopped { status });
            }
        }

        if memory {
            let command = self.profile.command(Command::MathDisplayed, None)?;
            let timeout = self.link.config().command_timeout;
            if self.link.send_bool(&command, timeout)? {
                return Err(CaptureError::MathChannelActive);
            }
        }
        Ok(())
    }

    fn configure(&mut self, source: WaveformSource) -> Result<(), CaptureError> {
        if self.profile.supports(Command::WaveformFormatByte) {
            self.send(Command::WaveformFormatByte, None)?;
        }
        let mode = match source {
            WaveformSource::Screen => Command::WaveformModeNormal,
            WaveformSource::Memory => Command::WaveformModeRaw,
        };
        self.send(mode, None)
    }

    fn capture_analog(
        &mut self,
        number: u8,
        source: WaveformSource,
        global_duration: f64,
        abort: &AtomicBool,
        progress: &mut dyn FnMut(&TransferProgress),
        durations: &mut DurationReport,
    ) -> Result<Option<Channel>, CaptureError> {
        let name = format!("CHAN{number}");
        let arg = u32::from(number);

        let (preamble, vertical) = match self.profile.analog_formula {
            AnalogFormula::Preamble => {
                self.send(Command::WaveformSourceChannel, Some(arg))?;
                let preamble = self.wait_for_preamble(&name)?;
                durations.record(format!("{name} preamble"), preamble.derived_duration());
                (preamble, VerticalSetting::default())
            }
            AnalogFormula::ScaleOffset => {
                let vertical = VerticalSetting {
                    scale: self.query_double(Command::ChannelScale, Some(arg))?,
                    offset: self.query_double(Command::ChannelOffset, Some(arg))?,
                };
                let sample_rate = self.query_double(Command::SampleRate, Some(arg))?;
                let points = match source {
                    WaveformSource::Screen => self.profile.screen_points,
                    WaveformSource::Memory => {
                        let estimate = (sample_rate * global_duration).round() as usize;
                        estimate.clamp(1, self.profile.max_block_bytes)
                    }
                };
                let preamble = Preamble::synthesized(points, sample_rate);
                if source == WaveformSource::Memory {
                    durations.record(format!("{name} sample rate"), preamble.derived_duration());
                }
                (preamble, vertical)
            }
        };

        let Some(raw) = self.transfer(arg, preamble.points, source, abort, progress)? else {
            return Ok(None);
        };
        let volts = to_volts(&raw, self.profile.analog_formula, &preamble, vertical);
        Ok(Some(Channel::analog(name, volts)))
    }

    fn capture_digital(
        &mut self,
        request: &CaptureRequest,
        abort: &AtomicBool,
        progress: &mut dyn FnMut(&TransferProgress),
        durations: &mut DurationReport,
    ) -> Result<Option<Vec<Channel>>, CaptureError> {
        let requested = &request.digital_channels;
        if requested.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let memory = request.source == WaveformSource::Memory;
        let by_pod = memory && self.profile.supports(Command::WaveformSourcePod);
        if memory && !by_pod {
            log::info!(
                "{} cannot transfer pods, reading digital channels one at a time",
                self.profile.series
            );
        }

        let mut channels = Vec::with_capacity(requested.len());
        if by_pod {
            let mut pods: Vec<u8> = requested.iter().map(|d| d / 8 + 1).collect();
            pods.sort_unstable();
            pods.dedup();

            for pod in pods {
                if abort.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let label = format!("POD{pod}");
                self.send(Command::WaveformSourcePod, Some(u32::from(pod)))?;
                let preamble = self.wait_for_preamble(&label)?;
                durations.record(format!("{label} preamble"), preamble.derived_duration());

                let Some(raw) = self.transfer(u32::from(pod), preamble.points, request.source, abort, progress)? else {
                    return Ok(None);
                };
                let bits = unpack_pod(&raw);
                for &d in requested.iter().filter(|&&d| d / 8 + 1 == pod) {
                    channels.push(Channel::digital(format!("D{d}"), bits[usize::from(d % 8)].clone()));
                }
            }
        } else {
            for &d in requested {
                if abort.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let name = format!("D{d}");
                self.send(Command::WaveformSourceDigital, Some(u32::from(d)))?;
                let preamble = self.wait_for_preamble(&name)?;
                durations.record(format!("{name} preamble"), preamble.derived_duration());

                let Some(raw) = self.transfer(u32::from(d), preamble.points, request.source, abort, progress)? else {
                    return Ok(None);
                };
                channels.push(Channel::digital(name, normalize_digital(&raw)));
            }
        }

        // Pods come back grouped; restore the requested order
        channels.sort_by_key(|c| {
            requested
                .iter()
                .position(|d| c.name == format!("D{d}"))
                .unwrap_or(usize::MAX)
        });
        Ok(Some(channels))
    }

    /// Read `points` samples of the current source, windowed when the
    /// series supports it and the data does not fit one block.
    fn transfer(
        &mut self,
        arg: u32,
        points: usize,
        source: WaveformSource,
        abort: &AtomicBool,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<Option<Vec<u8>>, CaptureError> {
        let windowed = self.profile.supports(Command::WaveformStart)
            && (source == WaveformSource::Memory || points > self.profile.max_block_bytes);
        if windowed {
            return read_memory_chunked(self.link, self.profile, points, abort, progress);
        }

        let command = self.profile.command(Command::WaveformData, Some(arg))?;
        let data = read_block(self.link, self.profile, &command, points)?;
        if data.is_empty() {
            return Err(CaptureError::EmptyBlock { first: 1 });
        }
        if abort.load(Ordering::Relaxed) {
            return Ok(None);
        }
        progress(&TransferProgress {
            transferred: data.len(),
            total: data.len(),
        });
        Ok(Some(data))
    }

    /// Poll the preamble until the instrument reports samples for `channel`,
    /// giving up after the data timeout.
    fn wait_for_preamble(&mut self, channel: &str) -> Result<Preamble, CaptureError> {
        let command = self.profile.command(Command::WaveformPreamble, None)?;
        let config = self.link.config();
        let timeout = config.command_timeout;
        let interval = config.opc_poll_interval;
        let deadline = Instant::now() + config.data_timeout;

        loop {
            let preamble = Preamble::parse(&self.link.send_string(&command, timeout)?)?;
            if preamble.is_ready() {
                log::debug!(
                    "{}: {} points, {:e} s apart",
                    channel,
                    preamble.points,
                    preamble.x_increment
                );
                return Ok(preamble);
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::NoWaveformData {
                    channel: channel.to_string(),
                });
            }
            log::debug!("{} has no samples yet", channel);
            thread::sleep(interval.min(Duration::from_secs(1)));
        }
    }

    /// Ask the instrument what went wrong. Never changes the original error.
    fn report_instrument_error(&mut self, error: &CaptureError) {
        if !self.profile.supports(Command::LastError) || !self.link.is_open() {
            return;
        }
        match self.query_string(Command::LastError) {
            Ok(reply) => log::error!("Capture failed ({}); instrument reports '{}'", error, reply),
            Err(e) => log::debug!("Could not read the instrument error queue: {}", e),
        }
    }

    fn send(&mut self, command: Command, arg: Option<u32>) -> Result<(), CaptureError> {
        let command = self.profile.command(command, arg)?;
        self.link.send_command(&command)?;
        Ok(())
    }

    fn query_string(&mut self, command: Command) -> Result<String, CaptureError> {
        let command = self.profile.command(command, None)?;
        let timeout = self.link.config().command_timeout;
        Ok(self.link.send_string(&command, timeout)?)
    }

    fn query_double(&mut self, command: Command, arg: Option<u32>) -> Result<f64, CaptureError> {
        let command = self.profile.command(command, arg)?;
        let timeout = self.link.config().command_timeout;
        Ok(self.link.send_double(&command, timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_table::ScopeSeries;
    use crate::scpi_link::LinkConfig;
    use crate::test_support::{ieee_block, MockInstrument};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Answers like a stopped DS1000Z/MSO5000 holding `sources` in memory.
    struct FakeScope {
        status: &'static str,
        math: bool,
        timebase: f64,
        x_increment: f64,
        sources: HashMap<String, Vec<u8>>,
        abort_on_data: Option<Arc<AtomicBool>>,
    }

    impl FakeScope {
        fn new() -> Self {
            Self {
                status: "STOP",
                math: false,
                timebase: 1e-4,
                x_increment: 1e-6,
                sources: HashMap::new(),
                abort_on_data: None,
            }
        }

        fn with_source(mut self, name: &str, data: Vec<u8>) -> Self {
            self.sources.insert(name.to_string(), data);
            self
        }

        fn into_mock(self) -> MockInstrument {
            let mut source = String::new();
            let mut window: Option<(usize, usize)> = None;

            MockInstrument::new(move |cmd| {
                let reply = |text: String| Some(format!("{text}\n").into_bytes());

                if let Some(s) = cmd.strip_prefix(":WAV:SOUR ") {
                    source = s.to_string();
                    window = None;
                    return None;
                }
                if let Some(n) = cmd.strip_prefix(":WAV:STAR ") {
                    let n: usize = n.parse().unwrap();
                    window = Some((n, window.map_or(n, |w| w.1)));
                    return None;
                }
                if let Some(n) = cmd.strip_prefix(":WAV:STOP ") {
                    let n: usize = n.parse().unwrap();
                    window = Some((window.map_or(1, |w| w.0), n));
                    return None;
                }

                let data = self.sources.get(&source).cloned().unwrap_or_default();
                match cmd {
                    ":TRIG:STAT?" => reply(self.status.to_string()),
                    ":MATH:DISP?" | ":MATH1:DISP?" => reply(if self.math { "1" } else { "0" }.to_string()),
                    ":TIM:SCAL?" => reply(format!("{:e}", self.timebase)),
                    ":SYST:ERR?" => reply("-113,\"Undefined header\"".to_string()),
                    ":WAV:PRE?" => reply(format!(
                        "0,0,{},1,{:e},0,0,4.000000e-02,-100,127",
                        data.len(),
                        self.x_increment
                    )),
                    ":WAV:DATA?" => {
                        if let Some(flag) = &self.abort_on_data {
                            flag.store(true, Ordering::SeqCst);
                        }
                        let block = match window {
                            Some((first, last)) => data[first - 1..last].to_vec(),
                            None => data,
                        };
                        Some(ieee_block(&block))
                    }
                    _ => None,
                }
            })
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig::default()
            .with_opc_poll_interval(Duration::from_millis(5))
            .with_data_timeout(Duration::from_millis(50))
    }

    fn run_capture(
        mock: MockInstrument,
        profile: &SeriesProfile,
        request: &CaptureRequest,
    ) -> (Result<Option<Capture>, CaptureError>, Arc<Mutex<Vec<String>>>) {
        let log = mock.log();
        let mut link = ScpiLink::from_transport(Box::new(mock), fast_config());
        let abort = AtomicBool::new(false);
        let result = CaptureEngine::new(&mut link, profile).capture(request, &abort, &mut |_| {});
        (result, log)
    }

    fn sent(log: &Arc<Mutex<Vec<String>>>, command: &str) -> usize {
        log.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    #[test]
    fn test_single_channel_screen_capture() {
        let mut scope = FakeScope::new().with_source("CHAN1", vec![127; 1200]);
        scope.status = "RUN";
        let (result, log) = run_capture(
            scope.into_mock(),
            ScopeSeries::Ds1000z.profile(),
            &CaptureRequest::screen(&[1]),
        );

        let capture = result.unwrap().unwrap();
        assert_eq!(capture.total_samples, 1200);
        assert_eq!(capture.sample_interval_ps, 1_000_000);
        assert!(capture.warnings.is_empty());
        let volts = capture.channel("CHAN1").unwrap().analog.as_ref().unwrap();
        assert!(volts.iter().all(|v| (v - 4.0).abs() < 1e-5));

        assert_eq!(sent(&log, ":TRIG:STAT?"), 0);
        assert_eq!(sent(&log, ":WAV:FORM BYTE"), 1);
        assert_eq!(sent(&log, ":WAV:MODE NORM"), 1);
        assert_eq!(sent(&log, ":WAV:SOUR CHAN1"), 1);
        assert!(!log.lock().unwrap().iter().any(|c| c.starts_with(":WAV:STAR")));
    }

    #[test]
    fn test_multi_channel_capture_requires_stop() {
        let mut scope = FakeScope::new()
            .with_source("CHAN1", vec![0; 10])
            .with_source("CHAN2", vec![0; 10]);
        scope.status = "TD";
        let (result, log) = run_capture(
            scope.into_mock(),
            ScopeSeries::Ds1000z.profile(),
            &CaptureRequest::screen(&[1, 2]),
        );

        assert!(matches!(result, Err(CaptureError::NotStopped { ref status }) if status == "TD"));
        assert_eq!(sent(&log, ":WAV:DATA?"), 0);
        // Failure is followed by a look at the error queue
        assert_eq!(sent(&log, ":SYST:ERR?"), 1);
    }

    #[test]
    fn test_memory_capture_rejects_math_channel() {
        let mut scope = FakeScope::new().with_source("CHAN1", vec![0; 10]);
        scope.math = true;
        let (result, log) = run_capture(
            scope.into_mock(),
            ScopeSeries::Mso5000.profile(),
            &CaptureRequest::memory(&[1]),
        );

        assert!(matches!(result, Err(CaptureError::MathChannelActive)));
        assert_eq!(sent(&log, ":MATH1:DISP?"), 1);
        assert_eq!(sent(&log, ":WAV:MODE RAW"), 0);
    }

    #[test]
    fn test_contradicting_durations_produce_warning() {
        let mut scope = FakeScope::new().with_source("CHAN1", vec![100; 1200]);
        scope.x_increment = 2e-6;
        let (result, _) = run_capture(
            scope.into_mock(),
            ScopeSeries::Ds1000z.profile(),
            &CaptureRequest::screen(&[1]),
        );

        let capture = result.unwrap().unwrap();
        assert_eq!(capture.warnings.len(), 1);
        assert!(capture.warnings[0].contains("timebase"));
        // Spacing follows the timebase, not the preamble
        assert_eq!(capture.sample_interval_ps, 1_000_000);
    }

    #[test]
    fn test_memory_digital_capture_reads_whole_pods() {
        let scope = FakeScope::new()
            .with_source("POD1", vec![0b0000_1001, 0b0000_0001])
            .with_source("POD2", vec![0b0000_0010, 0]);
        let (result, log) = run_capture(
            scope.into_mock(),
            ScopeSeries::Mso5000.profile(),
            &CaptureRequest::memory(&[]).with_digital(&[9, 0, 3]),
        );

        let capture = result.unwrap().unwrap();
        let names: Vec<&str> = capture.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["D9", "D0", "D3"]);
        assert_eq!(capture.channel("D0").unwrap().digital.as_deref(), Some(&[1, 1][..]));
        assert_eq!(capture.channel("D3").unwrap().digital.as_deref(), Some(&[1, 0][..]));
        assert_eq!(capture.channel("D9").unwrap().digital.as_deref(), Some(&[1, 0][..]));

        assert_eq!(sent(&log, ":WAV:SOUR POD1"), 1);
        assert_eq!(sent(&log, ":WAV:SOUR POD2"), 1);
        assert_eq!(sent(&log, ":WAV:SOUR D0"), 0);
        assert_eq!(sent(&log, ":WAV:DATA?"), 2);
    }

    #[test]
    fn test_screen_digital_capture_reads_single_channels() {
        let scope = FakeScope::new()
            .with_source("D2", vec![0, 1, 1, 0])
            .with_source("D5", vec![1, 1, 0, 0]);
        let (result, log) = run_capture(
            scope.into_mock(),
            ScopeSeries::Mso5000.profile(),
            &CaptureRequest::screen(&[]).with_digital(&[2, 5]),
        );

        let capture = result.unwrap().unwrap();
        assert_eq!(capture.channel("D2").unwrap().digital.as_deref(), Some(&[0, 1, 1, 0][..]));
        assert_eq!(capture.channel("D5").unwrap().digital.as_deref(), Some(&[1, 1, 0, 0][..]));
        assert_eq!(sent(&log, ":WAV:SOUR POD1"), 0);
    }

    #[test]
    fn test_empty_preamble_times_out_as_no_data() {
        let (result, log) = run_capture(
            FakeScope::new().into_mock(),
            ScopeSeries::Ds1000z.profile(),
            &CaptureRequest::screen(&[3]),
        );

        assert!(matches!(result, Err(CaptureError::NoWaveformData { ref channel }) if channel == "CHAN3"));
        assert!(sent(&log, ":WAV:PRE?") > 1);
        assert_eq!(sent(&log, ":WAV:DATA?"), 0);
    }

    #[test]
    fn test_abort_during_memory_capture() {
        let abort = Arc::new(AtomicBool::new(false));
        let mut scope = FakeScope::new().with_source("CHAN1", vec![0; 1000]);
        scope.abort_on_data = Some(Arc::clone(&abort));
        let mock = scope.into_mock();
        let log = mock.log();
        let mut link = ScpiLink::from_transport(Box::new(mock), fast_config());
        let profile = ScopeSeries::Ds1000z.profile().with_max_block_bytes(400);

        let result = CaptureEngine::new(&mut link, &profile)
            .capture(&CaptureRequest::memory(&[1]), &abort, &mut |_| {})
            .unwrap();

        assert!(result.is_none());
        assert_eq!(sent(&log, ":WAV:DATA?"), 1);
    }

    #[test]
    fn test_memory_capture_in_windows() {
        let memory: Vec<u8> = (0..1000u32).map(|i| (i % 200) as u8).collect();
        let mock = FakeScope::new().with_source("CHAN1", memory).into_mock();
        let log = mock.log();
        let mut link = ScpiLink::from_transport(Box::new(mock), fast_config());
        let profile = ScopeSeries::Ds1000z.profile().with_max_block_bytes(400);
        let abort = AtomicBool::new(false);
        let mut reports = 0;

        let capture = CaptureEngine::new(&mut link, &profile)
            .capture(&CaptureRequest::memory(&[1]), &abort, &mut |_| reports += 1)
            .unwrap()
            .unwrap();

        assert_eq!(capture.total_samples, 1000);
        assert_eq!(sent(&log, ":WAV:DATA?"), 3);
        assert_eq!(sent(&log, ":WAV:STAR 801"), 1);
        assert_eq!(sent(&log, ":WAV:MODE RAW"), 1);
        assert!(reports >= 1);
        let volts = capture.channel("CHAN1").unwrap().analog.as_ref().unwrap();
        // Sample 999 is raw 199: (199 + 100 - 127) * 0.04
        assert!((volts[999] - 6.88).abs() < 1e-4);
    }

    #[test]
    fn test_legacy_series_uses_scale_and_offset() {
        let mock = MockInstrument::new(|cmd| match cmd {
            ":CHAN1:SCAL?" => Some(b"1.000e+00\n".to_vec()),
            ":CHAN1:OFFS?" => Some(b"0.000e+00\n".to_vec()),
            ":ACQ:SAMP? CHAN1" => Some(b"2.000000e+08\n".to_vec()),
            ":TIM:SCAL?" => Some(b"5.000e-07\n".to_vec()),
            ":WAV:DATA? CHAN1" => Some(ieee_block(&[125; 600])),
            _ => None,
        });
        let (result, log) = run_capture(mock, ScopeSeries::Ds1000e.profile(), &CaptureRequest::screen(&[1]));

        let capture = result.unwrap().unwrap();
        assert_eq!(capture.total_samples, 600);
        assert_eq!(capture.sample_interval_ps, 10_000);
        let volts = capture.channel("CHAN1").unwrap().analog.as_ref().unwrap();
        assert!(volts.iter().all(|v| v.abs() < 1e-5));

        let log = log.lock().unwrap();
        assert!(!log.iter().any(|c| c.starts_with(":WAV:SOUR") || c.starts_with(":WAV:FORM")));
        assert!(log.contains(&":WAV:POIN:MODE NOR".to_string()));
    }

    #[test]
    fn test_invalid_requests() {
        let profile = ScopeSeries::Ds1000z.profile();
        for request in [
            CaptureRequest::screen(&[]),
            CaptureRequest::screen(&[5]),
            CaptureRequest::screen(&[0]),
            CaptureRequest::screen(&[1, 1]),
            CaptureRequest::screen(&[]).with_digital(&[16]),
        ] {
            let (result, log) = run_capture(FakeScope::new().into_mock(), profile, &request);
            assert!(matches!(result, Err(CaptureError::InvalidRequest(_))), "{request:?}");
            assert_eq!(sent(&log, ":TRIG:STAT?"), 0);
        }

        let (result, _) = run_capture(
            FakeScope::new().into_mock(),
            ScopeSeries::Ds1000e.profile(),
            &CaptureRequest::screen(&[]).with_digital(&[0]),
        );
        assert!(matches!(result, Err(CaptureError::InvalidRequest(_))));
    }
}
