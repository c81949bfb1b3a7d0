use error_stack::Report;

use crate::error::StudyError;
use crate::model::{Candle, CandleSet};
use crate::study::{
    Recalc, Study, StudyKind, StudyState, backfill, fall_back, validate_periods, wilder_seed,
    wilder_step,
};

/// Average True Range using Wilder's smoothing.
///
/// The seed at index `periods` is the mean of `TR[1..=periods]`; `TR[0]` has
/// no prior close and is left out of the seed. Indices before the seed repeat it.
pub struct Atr {
    state: StudyState,
}

impl Atr {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
        })
    }
}

impl Study for Atr {
    fn kind(&self) -> StudyKind {
        StudyKind::Atr
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
        Ok(())
    }

    fn first_valid_index(&self) -> usize {
        self.state.periods()
    }

    fn prepend_candles_needed(&self) -> usize {
        self.state.periods() - 1
    }

    fn tooltip(&self) -> String {
        format!(
            "Average True Range: Wilder-smoothed true range over {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        self.state.ensure_len(set, self.required_candles())?;
        let values = series(set.candles(), self.state.periods());
        Ok(self.state.publish(set, values))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let periods = self.state.periods();
        let candles = set.candles();
        let values = self.state.buffer_mut();
        for i in from..candles.len() {
            values[i] = wilder_step(values[i - 1], true_range(candles, i), periods);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        value_at(index, set, self.state.periods())
    }
}

/// True range of candle `i`, including any gap from the prior close.
pub fn true_range(candles: &[Candle], i: usize) -> f64 {
    let candle = &candles[i];
    if i == 0 {
        return (candle.high - candle.low).abs();
    }
    let prev_close = candles[i - 1].close;
    prev_close.max(candle.high) - prev_close.min(candle.low)
}

/// Full ATR series. Callers guarantee `candles.len() > periods`.
fn series(candles: &[Candle], periods: usize) -> Vec<f64> {
    let tr: Vec<f64> = (0..candles.len()).map(|i| true_range(candles, i)).collect();
    let mut values = vec![0.0; candles.len()];
    values[periods] = wilder_seed(&tr[1..=periods]);
    for i in periods + 1..candles.len() {
        values[i] = wilder_step(values[i - 1], tr[i], periods);
    }
    backfill(&mut values, periods);
    values
}

/// ATR at `index` computed from scratch, rounded to the set's display precision.
///
/// Returns `0.0` for a zero window, an index inside the warm-up region, or an
/// index past the end of the series.
pub fn value_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index < periods || index >= set.len() {
        return 0.0;
    }
    let values = series(&set.candles()[..=index], periods);
    set.decimal_format().round(values[index])
}
