use polars::prelude::*;

pub const TIME_COLUMN_NAME: &str = "time";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

/// Samples of one analog or digital input.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    /// Volts
    pub analog: Option<Vec<f32>>,
    /// One byte per sample, 0 or 1
    pub digital: Option<Vec<u8>>,
}

impl Channel {
    pub fn analog(name: impl Into<String>, samples: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            analog: Some(samples),
            digital: None,
        }
    }

    pub fn digital(name: impl Into<String>, samples: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            analog: None,
            digital: Some(samples),
        }
    }

    pub fn len(&self) -> usize {
        let analog = self.analog.as_ref().map_or(0, Vec::len);
        let digital = self.digital.as_ref().map_or(0, Vec::len);
        analog.max(digital)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_column(&self, rows: usize) -> Column {
        if let Some(samples) = &self.analog {
            let values: Vec<Option<f32>> = samples
                .iter()
                .copied()
                .map(Some)
                .chain(std::iter::repeat(None))
                .take(rows)
                .collect();
            Series::new(self.name.as_str().into(), values).into()
        } else {
            let samples = self.digital.as_deref().unwrap_or_default();
            let values: Vec<Option<bool>> = samples
                .iter()
                .map(|&b| Some(b != 0))
                .chain(std::iter::repeat(None))
                .take(rows)
                .collect();
            Series::new(self.name.as_str().into(), values).into()
        }
    }
}

/// A complete multi-channel acquisition, handed over once every channel
/// has been transferred.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Capture {
    pub channels: Vec<Channel>,
    pub sample_interval_ps: u64,
    pub total_samples: usize,
    /// Non-fatal inconsistencies the instrument reported
    pub warnings: Vec<String>,
}

impl Capture {
    pub fn new(sample_interval_ps: u64, total_samples: usize) -> Self {
        Self {
            sample_interval_ps,
            total_samples,
            ..Self::default()
        }
    }

    pub fn push(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.total_samples as f64 * self.sample_interval_ps as f64 * 1e-12
    }

    /// One row per sample: a `time` column in seconds followed by one column
    /// per channel. Channels shorter than the longest are padded with nulls.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let rows = self.channels.iter().map(Channel::len).max().unwrap_or(0);
        let columns: Vec<Column> = self.channels.iter().map(|c| c.to_column(rows)).collect();
        let interval_s = self.sample_interval_ps as f64 * 1e-12;

        let selection: Vec<Expr> = std::iter::once(col(TIME_COLUMN_NAME))
            .chain(self.channels.iter().map(|c| col(c.name.as_str())))
            .collect();

        DataFrame::new(columns)?
            .lazy()
            .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
            .with_columns([(col(ROW_INDEX_COLUMN_NAME).cast(DataType::Float64) * lit(interval_s))
                .alias(TIME_COLUMN_NAME)])
            .select(selection)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_channel_capture() -> Capture {
        let mut capture = Capture::new(1_000_000, 4);
        capture.push(Channel::analog("CHAN1", vec![0.0, 0.5, 1.0, 1.5]));
        capture.push(Channel::digital("D0", vec![0, 1, 1]));
        capture
    }

    #[test]
    fn test_channel_lookup_and_duration() {
        let capture = two_channel_capture();
        assert_eq!(capture.channel("D0").map(Channel::len), Some(3));
        assert!(capture.channel("CHAN2").is_none());
        assert!((capture.duration_seconds() - 4e-6).abs() < 1e-15);
    }

    #[test]
    fn test_dataframe_layout() {
        let df = two_channel_capture().to_dataframe().unwrap();

        assert_eq!(df.height(), 4);
        let names: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
        assert_eq!(names, ["time", "CHAN1", "D0"]);

        let time = df.column("time").unwrap().f64().unwrap();
        assert_eq!(time.get(0), Some(0.0));
        assert!((time.get(3).unwrap() - 3e-6).abs() < 1e-15);

        let d0 = df.column("D0").unwrap().bool().unwrap();
        assert_eq!(d0.get(1), Some(true));
        assert_eq!(d0.get(3), None);

        let ch1 = df.column("CHAN1").unwrap().f32().unwrap();
        assert_eq!(ch1.get(3), Some(1.5));
    }

    #[test]
    fn test_empty_capture_dataframe() {
        let df = Capture::new(1000, 0).to_dataframe().unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.width(), 1);
    }
}
