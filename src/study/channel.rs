//! Rolling highest/lowest studies over a trailing window that includes the
//! current candle.

use error_stack::Report;

use crate::error::StudyError;
use crate::model::{Candle, CandleSet};
use crate::study::{
    Recalc, Study, StudyKind, StudyLine, StudyState, backfill, fall_back, validate_periods,
};

/// Recent closing high (primary line) and closing low (band) over the window.
pub struct RecentHighLow {
    state: StudyState,
    lows: Vec<f64>,
}

impl RecentHighLow {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
            lows: Vec::new(),
        })
    }
}

impl Study for RecentHighLow {
    fn kind(&self) -> StudyKind {
        StudyKind::RecentHighLow
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
        self.lows.clear();
        Ok(())
    }

    fn first_valid_index(&self) -> usize {
        self.state.periods() - 1
    }

    fn prepend_candles_needed(&self) -> usize {
        self.state.periods() - 1
    }

    fn tooltip(&self) -> String {
        format!(
            "Highest and lowest close of the last {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        if let Err(report) = self.state.ensure_len(set, self.required_candles()) {
            self.lows.clear();
            return Err(report);
        }
        let periods = self.state.periods();
        let candles = set.candles();
        let mut highs = vec![0.0; candles.len()];
        let mut lows = vec![0.0; candles.len()];
        for i in periods - 1..candles.len() {
            highs[i] = highest(candles, i, periods, close);
            lows[i] = lowest(candles, i, periods, close);
        }
        backfill(&mut highs, periods - 1);
        backfill(&mut lows, periods - 1);
        self.lows = lows;
        Ok(self.state.publish(set, highs))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let periods = self.state.periods();
        let candles = set.candles();
        self.lows.resize(candles.len(), 0.0);
        let highs = self.state.buffer_mut();
        for i in from..candles.len() {
            highs[i] = highest(candles, i, periods, close);
            self.lows[i] = lowest(candles, i, periods, close);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        recent_high_at(index, set, self.state.periods())
    }

    fn bands(&self) -> Vec<StudyLine> {
        if self.state.values().is_none() {
            return Vec::new();
        }
        vec![StudyLine {
            name: "low",
            values: self.lows.clone(),
        }]
    }
}

/// Donchian-style price channel: highest high and lowest low of the window,
/// with the midline as the primary line.
pub struct PriceChannel {
    state: StudyState,
    upper: Vec<f64>,
    lower: Vec<f64>,
}

impl PriceChannel {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
            upper: Vec::new(),
            lower: Vec::new(),
        })
    }
}

impl Study for PriceChannel {
    fn kind(&self) -> StudyKind {
        StudyKind::PriceChannel
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
        self.upper.clear();
        self.lower.clear();
        Ok(())
    }

    fn first_valid_index(&self) -> usize {
        self.state.periods() - 1
    }

    fn prepend_candles_needed(&self) -> usize {
        self.state.periods() - 1
    }

    fn tooltip(&self) -> String {
        format!(
            "Price channel of the highest high and lowest low over {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        if let Err(report) = self.state.ensure_len(set, self.required_candles()) {
            self.upper.clear();
            self.lower.clear();
            return Err(report);
        }
        let periods = self.state.periods();
        let candles = set.candles();
        let mut upper = vec![0.0; candles.len()];
        let mut lower = vec![0.0; candles.len()];
        let mut middle = vec![0.0; candles.len()];
        for i in periods - 1..candles.len() {
            (upper[i], lower[i], middle[i]) = channel_at(candles, i, periods);
        }
        backfill(&mut upper, periods - 1);
        backfill(&mut lower, periods - 1);
        backfill(&mut middle, periods - 1);
        self.upper = upper;
        self.lower = lower;
        Ok(self.state.publish(set, middle))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let periods = self.state.periods();
        let candles = set.candles();
        self.upper.resize(candles.len(), 0.0);
        self.lower.resize(candles.len(), 0.0);
        let middle = self.state.buffer_mut();
        for i in from..candles.len() {
            (self.upper[i], self.lower[i], middle[i]) = channel_at(candles, i, periods);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        price_channel_mid_at(index, set, self.state.periods())
    }

    fn bands(&self) -> Vec<StudyLine> {
        if self.state.values().is_none() {
            return Vec::new();
        }
        vec![
            StudyLine {
                name: "upper",
                values: self.upper.clone(),
            },
            StudyLine {
                name: "lower",
                values: self.lower.clone(),
            },
        ]
    }
}

fn close(candle: &Candle) -> f64 {
    candle.close
}

fn high(candle: &Candle) -> f64 {
    candle.high
}

fn low(candle: &Candle) -> f64 {
    candle.low
}

fn window(candles: &[Candle], i: usize, periods: usize) -> &[Candle] {
    &candles[i + 1 - periods..=i]
}

fn highest(candles: &[Candle], i: usize, periods: usize, price: fn(&Candle) -> f64) -> f64 {
    window(candles, i, periods)
        .iter()
        .map(price)
        .fold(f64::NEG_INFINITY, f64::max)
}

fn lowest(candles: &[Candle], i: usize, periods: usize, price: fn(&Candle) -> f64) -> f64 {
    window(candles, i, periods)
        .iter()
        .map(price)
        .fold(f64::INFINITY, f64::min)
}

/// (upper, lower, middle) of the channel ending at `i`.
fn channel_at(candles: &[Candle], i: usize, periods: usize) -> (f64, f64, f64) {
    let upper = highest(candles, i, periods, high);
    let lower = lowest(candles, i, periods, low);
    (upper, lower, (upper + lower) / 2.0)
}

/// Highest close of the window ending at `index`; `0.0` when the window does not fit.
pub fn recent_high_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index >= set.len() || index + 1 < periods {
        return 0.0;
    }
    set.decimal_format()
        .round(highest(set.candles(), index, periods, close))
}

/// Channel midline at `index`; `0.0` when the window does not fit.
pub fn price_channel_mid_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index >= set.len() || index + 1 < periods {
        return 0.0;
    }
    let (_, _, middle) = channel_at(set.candles(), index, periods);
    set.decimal_format().round(middle)
}
