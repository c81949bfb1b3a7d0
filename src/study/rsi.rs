use error_stack::Report;

use crate::error::StudyError;
use crate::model::{Candle, CandleSet};
use crate::study::{
    Recalc, Study, StudyKind, StudyState, backfill, fall_back, validate_periods, wilder_seed,
    wilder_step,
};

/// RSI (Relative Strength Index) using Wilder's smoothing of average gains and losses.
pub struct Rsi {
    state: StudyState,
    avg_gain: Vec<f64>,
    avg_loss: Vec<f64>,
}

impl Rsi {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
            avg_gain: Vec::new(),
            avg_loss: Vec::new(),
        })
    }
}

impl Study for Rsi {
    fn kind(&self) -> StudyKind {
        StudyKind::Rsi
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
        self.avg_gain.clear();
        self.avg_loss.clear();
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
            "Relative Strength Index: Wilder-smoothed gains versus losses over {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        if let Err(report) = self.state.ensure_len(set, self.required_candles()) {
            self.avg_gain.clear();
            self.avg_loss.clear();
            return Err(report);
        }
        let series = series(set.candles(), self.state.periods());
        self.avg_gain = series.avg_gain;
        self.avg_loss = series.avg_loss;
        Ok(self.state.publish(set, series.values))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let periods = self.state.periods();
        let candles = set.candles();
        self.avg_gain.resize(candles.len(), 0.0);
        self.avg_loss.resize(candles.len(), 0.0);
        let values = self.state.buffer_mut();
        for i in from..candles.len() {
            let (gain, loss) = gain_loss(candles, i);
            self.avg_gain[i] = wilder_step(self.avg_gain[i - 1], gain, periods);
            self.avg_loss[i] = wilder_step(self.avg_loss[i - 1], loss, periods);
            values[i] = rsi_value(self.avg_gain[i], self.avg_loss[i]);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        value_at(index, set, self.state.periods())
    }
}

struct RsiSeries {
    values: Vec<f64>,
    avg_gain: Vec<f64>,
    avg_loss: Vec<f64>,
}

/// Close-to-close gain and loss at `i` (both non-negative). Requires `i >= 1`.
fn gain_loss(candles: &[Candle], i: usize) -> (f64, f64) {
    let delta = candles[i].close - candles[i - 1].close;
    (delta.max(0.0), (-delta).max(0.0))
}

/// A flat window (no gains, no losses) reads as a neutral 50 rather than 100.
fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Full RSI series. Callers guarantee `candles.len() > periods`.
fn series(candles: &[Candle], periods: usize) -> RsiSeries {
    let len = candles.len();
    let (gains, losses): (Vec<f64>, Vec<f64>) =
        (1..=periods).map(|i| gain_loss(candles, i)).unzip();

    let mut avg_gain = vec![0.0; len];
    let mut avg_loss = vec![0.0; len];
    let mut values = vec![0.0; len];
    avg_gain[periods] = wilder_seed(&gains);
    avg_loss[periods] = wilder_seed(&losses);
    values[periods] = rsi_value(avg_gain[periods], avg_loss[periods]);

    for i in periods + 1..len {
        let (gain, loss) = gain_loss(candles, i);
        avg_gain[i] = wilder_step(avg_gain[i - 1], gain, periods);
        avg_loss[i] = wilder_step(avg_loss[i - 1], loss, periods);
        values[i] = rsi_value(avg_gain[i], avg_loss[i]);
    }
    backfill(&mut values, periods);

    RsiSeries {
        values,
        avg_gain,
        avg_loss,
    }
}

/// RSI at `index` from scratch; `0.0` inside the warm-up region or out of range.
pub fn value_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index >= set.len() || index < periods {
        return 0.0;
    }
    let series = series(&set.candles()[..=index], periods);
    set.decimal_format().round(series.values[index])
}
