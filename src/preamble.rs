//! Waveform preamble and raw sample conversion.

use crate::command_table::AnalogFormula;

/// Reply to `:WAV:PRE?`: ten comma separated fields describing the samples
/// that `:WAV:DATA?` returns for the current source.
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    pub format: i32,
    pub kind: i32,
    pub points: usize,
    pub averages: u32,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Malformed preamble '{text}': {reason}")]
pub struct PreambleError {
    pub text: String,
    pub reason: String,
}

impl Preamble {
    pub const FIELD_COUNT: usize = 10;

    pub fn parse(text: &str) -> Result<Self, PreambleError> {
        let fields: Vec<&str> = text.trim().split(',').map(str::trim).collect();
        let error = |reason: String| PreambleError {
            text: text.trim().to_string(),
            reason,
        };

        if fields.len() != Self::FIELD_COUNT {
            return Err(error(format!(
                "expected {} fields, got {}",
                Self::FIELD_COUNT,
                fields.len()
            )));
        }

        let number = |index: usize| -> Result<f64, PreambleError> {
            fields[index]
                .parse::<f64>()
                .map_err(|_| error(format!("field {} ('{}') is not a number", index + 1, fields[index])))
        };
        // Integral fields are sometimes sent in exponent notation
        let integer = |index: usize| -> Result<i64, PreambleError> {
            let value = number(index)?;
            if value.fract() != 0.0 || value < 0.0 || value > f64::from(u32::MAX) {
                return Err(error(format!("field {} ('{}') is not a count", index + 1, fields[index])));
            }
            Ok(value as i64)
        };

        Ok(Self {
            format: integer(0)? as i32,
            kind: integer(1)? as i32,
            points: integer(2)? as usize,
            averages: integer(3)? as u32,
            x_increment: number(4)?,
            x_origin: number(5)?,
            x_reference: number(6)?,
            y_increment: number(7)?,
            y_origin: number(8)?,
            y_reference: number(9)?,
        })
    }

    /// Preamble for series that cannot report one: byte samples spaced by
    /// the acquisition sample rate.
    pub fn synthesized(points: usize, sample_rate: f64) -> Self {
        Self {
            format: 0,
            kind: 0,
            points,
            averages: 1,
            x_increment: if sample_rate > 0.0 { sample_rate.recip() } else { 0.0 },
            x_origin: 0.0,
            x_reference: 0.0,
            y_increment: 0.0,
            y_origin: 0.0,
            y_reference: 0.0,
        }
    }

    /// Zero points means the instrument has no waveform for this source yet.
    pub fn is_ready(&self) -> bool {
        self.points > 0
    }

    /// Total time covered by the samples, in seconds.
    pub fn derived_duration(&self) -> f64 {
        self.points as f64 * self.x_increment
    }

    pub fn sample_interval_ps(&self) -> u64 {
        seconds_to_ps(self.x_increment)
    }
}

pub fn seconds_to_ps(seconds: f64) -> u64 {
    (seconds * 1e12).round().max(0.0) as u64
}

/// Vertical settings of an analog channel, needed by [`AnalogFormula::ScaleOffset`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VerticalSetting {
    pub scale: f64,
    pub offset: f64,
}

/// Convert 8-bit samples to volts.
pub fn to_volts(
    raw: &[u8],
    formula: AnalogFormula,
    preamble: &Preamble,
    vertical: VerticalSetting,
) -> Vec<f32> {
    match formula {
        AnalogFormula::Preamble => {
            let shift = preamble.y_origin + preamble.y_reference;
            raw.iter()
                .map(|&b| ((f64::from(b) - shift) * preamble.y_increment) as f32)
                .collect()
        }
        AnalogFormula::ScaleOffset => {
            let per_count = vertical.scale / 25.0;
            let shift = vertical.offset + vertical.scale * 4.6;
            raw.iter()
                .map(|&b| ((240.0 - f64::from(b)) * per_count - shift) as f32)
                .collect()
        }
    }
}

/// Any non-zero byte of a single digital channel is a logic high.
pub fn normalize_digital(raw: &[u8]) -> Vec<u8> {
    raw.iter().map(|&b| u8::from(b != 0)).collect()
}

/// Split packed pod bytes into eight 0/1 channels; bit 0 is the lowest
/// channel of the pod.
pub fn unpack_pod(raw: &[u8]) -> [Vec<u8>; 8] {
    std::array::from_fn(|bit| raw.iter().map(|&b| (b >> bit) & 1).collect())
}
