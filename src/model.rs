use std::fmt;

use chrono::{DateTime, Utc};
use error_stack::{Report, bail};
use serde::{Deserialize, Serialize};

use crate::error::ChartError;

/// Bar size of a candle series.
///
/// String representations match the config file format (e.g. `"1m"`, `"1d"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
    Week1,
    Month1,
}

impl Frequency {
    /// Parse a config-format string into a `Frequency`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::Min1),
            "5m" => Some(Self::Min5),
            "15m" => Some(Self::Min15),
            "30m" => Some(Self::Min30),
            "1h" => Some(Self::Hour1),
            "4h" => Some(Self::Hour4),
            "1d" => Some(Self::Day1),
            "1w" => Some(Self::Week1),
            "1M" => Some(Self::Month1),
            _ => None,
        }
    }

    /// Return the config-format string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    /// Minute and hour bars belong to a single trading session.
    pub fn is_intraday(self) -> bool {
        matches!(
            self,
            Self::Min1 | Self::Min5 | Self::Min15 | Self::Min30 | Self::Hour1 | Self::Hour4
        )
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OHLCV sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Display precision for study values, derived from the series' decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalFormat {
    decimals: u32,
}

impl DecimalFormat {
    pub fn new(decimals: u32) -> Self {
        Self { decimals }
    }

    pub fn decimals(self) -> u32 {
        self.decimals
    }

    /// Format pattern in the `0.00` style used by chart legends.
    pub fn pattern(self) -> String {
        if self.decimals == 0 {
            "0".into()
        } else {
            format!("0.{}", "0".repeat(self.decimals as usize))
        }
    }

    pub fn format(self, value: f64) -> String {
        format!("{value:.prec$}", prec = self.decimals as usize)
    }

    pub fn round(self, value: f64) -> f64 {
        let scale = 10f64.powi(self.decimals as i32);
        (value * scale).round() / scale
    }
}

impl Default for DecimalFormat {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Chronologically ordered candles plus the metadata of the request that
/// produced them.
///
/// Indices before [`CandleSet::start_time_index`] exist only to seed study
/// warm-up periods.
#[derive(Debug, Clone)]
pub struct CandleSet {
    candles: Vec<Candle>,
    decimals: u32,
    frequency: Frequency,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    prepend_candles: usize,
}

impl CandleSet {
    pub fn new(candles: Vec<Candle>, decimals: u32, frequency: Frequency) -> Self {
        Self {
            candles,
            decimals,
            frequency,
            start_time: None,
            end_time: None,
            prepend_candles: 0,
        }
    }

    pub fn with_window(
        mut self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn with_prepend(mut self, prepend_candles: usize) -> Self {
        self.prepend_candles = prepend_candles;
        self
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    pub fn decimal_format(&self) -> DecimalFormat {
        DecimalFormat::new(self.decimals)
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn prepend_candles(&self) -> usize {
        self.prepend_candles
    }

    /// First index whose timestamp falls inside the requested window.
    pub fn start_time_index(&self) -> usize {
        match self.start_time {
            Some(start) => self.candles.partition_point(|c| c.timestamp < start),
            None => 0,
        }
    }

    /// Append one trailing candle from a live tick.
    pub fn push(&mut self, candle: Candle) -> Result<(), Report<ChartError>> {
        if self
            .candles
            .last()
            .is_some_and(|last| candle.timestamp <= last.timestamp)
        {
            bail!(ChartError::OutOfOrderTick);
        }
        self.candles.push(candle);
        Ok(())
    }

    /// Replace the trailing candle with a newer revision of the same bar.
    pub fn revise_last(&mut self, candle: Candle) -> Result<(), Report<ChartError>> {
        match self.candles.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => {
                *last = candle;
                Ok(())
            }
            _ => Err(Report::new(ChartError::OutOfOrderTick)
                .attach(format!("revision timestamp: {}", candle.timestamp))),
        }
    }
}
