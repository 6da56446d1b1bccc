//! Definite-length binary blocks and windowed memory reads.

use crate::capture_engine::CaptureError;
use crate::command_table::{Command, SeriesProfile};
use crate::scpi_link::ScpiLink;
use crate::transport::StreamTermination;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Minimum spacing between two progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(333);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block does not start with '#' (found {found:?})")]
    MissingMarker { found: Option<u8> },

    #[error("Invalid block digit count {0:?}")]
    BadDigitCount(Option<u8>),

    #[error("Invalid block length field '{0}'")]
    BadLength(String),

    #[error("Block declares {declared} bytes but only {available} arrived")]
    Incomplete { declared: usize, available: usize },
}

/// Payload of a `#N<len><payload>` block. Anything after the payload, such as
/// the line feed or a pad byte, is ignored.
pub fn strip_block_header(raw: &[u8]) -> Result<&[u8], BlockError> {
    match raw.first() {
        Some(b'#') => {}
        found => return Err(BlockError::MissingMarker { found: found.copied() }),
    }

    let digit = raw.get(1).copied();
    let digits = match digit {
        Some(d @ b'1'..=b'9') => usize::from(d - b'0'),
        _ => return Err(BlockError::BadDigitCount(digit)),
    };

    let start = 2 + digits;
    let field = raw.get(2..start).ok_or(BlockError::Incomplete {
        declared: digits,
        available: raw.len().saturating_sub(2),
    })?;
    let text = String::from_utf8_lossy(field);
    let declared: usize = text
        .parse()
        .map_err(|_| BlockError::BadLength(text.to_string()))?;

    raw.get(start..start + declared).ok_or(BlockError::Incomplete {
        declared,
        available: raw.len() - start,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: usize,
    pub total: usize,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f64 / self.total as f64
        }
    }
}

/// Forwards progress at most once per interval, plus the final report.
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns whether `progress` was passed on to `sink`.
    pub fn report(
        &mut self,
        progress: TransferProgress,
        sink: &mut dyn FnMut(&TransferProgress),
    ) -> bool {
        let now = Instant::now();
        let due = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        let finished = progress.transferred >= progress.total;

        if due || finished {
            self.last = Some(now);
            sink(&progress);
            true
        } else {
            false
        }
    }
}

/// Query `command` and return the payload of the binary block it answers
/// with. `expected` samples size the minimum read over raw TCP.
pub fn read_block(
    link: &mut ScpiLink,
    profile: &SeriesProfile,
    command: &str,
    expected: usize,
) -> Result<Vec<u8>, CaptureError> {
    let timeout = link.config().data_timeout;
    let termination = StreamTermination::MinimumSize(profile.block_header_len + expected);
    let raw = link.send_bytes(command, termination, timeout)?;
    let payload = strip_block_header(&raw)?;

    if payload.len() != expected {
        log::warn!(
            "'{}' declared {} bytes, {} were requested",
            command,
            payload.len(),
            expected
        );
    }
    Ok(payload.to_vec())
}

/// Read `total` samples of the current waveform source, one
/// `max_block_bytes` window at a time. Returns `Ok(None)` when `abort` was
/// raised between two blocks.
pub fn read_memory_chunked(
    link: &mut ScpiLink,
    profile: &SeriesProfile,
    total: usize,
    abort: &AtomicBool,
    progress: &mut dyn FnMut(&TransferProgress),
) -> Result<Option<Vec<u8>>, CaptureError> {
    let data_command = profile.command(Command::WaveformData, None)?;
    // Resolve both window commands before touching the instrument
    profile.command(Command::WaveformStart, Some(1))?;
    profile.command(Command::WaveformStop, Some(1))?;

    let limit = profile.max_block_bytes.max(1);
    let mut data = Vec::with_capacity(total);
    let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);

    while data.len() < total {
        let first = data.len() + 1;
        let last = (data.len() + limit).min(total);
        log::debug!("Reading samples {}..={} of {}", first, last, total);

        link.send_command(&profile.command(Command::WaveformStart, Some(window_index(first)?))?)?;
        link.send_command(&profile.command(Command::WaveformStop, Some(window_index(last)?))?)?;

        let block = read_block(link, profile, &data_command, last - first + 1)?;
        if block.is_empty() {
            return Err(CaptureError::EmptyBlock { first });
        }
        data.extend_from_slice(&block);

        if abort.load(Ordering::Relaxed) {
            log::info!("Transfer aborted after {} of {} samples", data.len(), total);
            return Ok(None);
        }

        throttle.report(
            TransferProgress {
                transferred: data.len().min(total),
                total,
            },
            progress,
        );
    }

    data.truncate(total);
    Ok(Some(data))
}

fn window_index(index: usize) -> Result<u32, CaptureError> {
    u32::try_from(index)
        .map_err(|_| CaptureError::InvalidRequest(format!("sample index {index} is out of range")))
}
