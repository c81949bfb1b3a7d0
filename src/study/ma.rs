use error_stack::Report;

use crate::error::StudyError;
use crate::model::{Candle, CandleSet};
use crate::study::{Recalc, Study, StudyKind, StudyState, backfill, fall_back, validate_periods};

/// Simple Moving Average of closes.
pub struct Sma {
    state: StudyState,
}

impl Sma {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
        })
    }
}

impl Study for Sma {
    fn kind(&self) -> StudyKind {
        StudyKind::Sma
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
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
            "Simple Moving Average of the close over {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        self.state.ensure_len(set, self.required_candles())?;
        let values = sma_series(set.candles(), self.state.periods());
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
            values[i] = window_mean(candles, i, periods);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        sma_at(index, set, self.state.periods())
    }
}

/// Exponential Moving Average of closes, seeded with the SMA of the first window.
pub struct Ema {
    state: StudyState,
}

impl Ema {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
        })
    }
}

impl Study for Ema {
    fn kind(&self) -> StudyKind {
        StudyKind::Ema
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
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
            "Exponential Moving Average of the close over {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        self.state.ensure_len(set, self.required_candles())?;
        let values = ema_series(set.candles(), self.state.periods());
        Ok(self.state.publish(set, values))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let k = smoothing(self.state.periods());
        let candles = set.candles();
        let values = self.state.buffer_mut();
        for i in from..candles.len() {
            values[i] = ema_step(values[i - 1], candles[i].close, k);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        ema_at(index, set, self.state.periods())
    }
}

/// Mean close of the `periods` candles ending at `i`.
fn window_mean(candles: &[Candle], i: usize, periods: usize) -> f64 {
    candles[i + 1 - periods..=i]
        .iter()
        .map(|c| c.close)
        .sum::<f64>()
        / periods as f64
}

fn smoothing(periods: usize) -> f64 {
    2.0 / (periods as f64 + 1.0)
}

fn ema_step(previous: f64, close: f64, k: f64) -> f64 {
    close * k + previous * (1.0 - k)
}

fn sma_series(candles: &[Candle], periods: usize) -> Vec<f64> {
    let mut values = vec![0.0; candles.len()];
    for i in periods - 1..candles.len() {
        values[i] = window_mean(candles, i, periods);
    }
    backfill(&mut values, periods - 1);
    values
}

fn ema_series(candles: &[Candle], periods: usize) -> Vec<f64> {
    let k = smoothing(periods);
    let mut values = vec![0.0; candles.len()];
    values[periods - 1] = window_mean(candles, periods - 1, periods);
    for i in periods..candles.len() {
        values[i] = ema_step(values[i - 1], candles[i].close, k);
    }
    backfill(&mut values, periods - 1);
    values
}

/// SMA at `index` from scratch; `0.0` when the window does not fit.
pub fn sma_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index >= set.len() || index + 1 < periods {
        return 0.0;
    }
    set.decimal_format()
        .round(window_mean(set.candles(), index, periods))
}

/// EMA at `index` from scratch; `0.0` when the window does not fit.
pub fn ema_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index >= set.len() || index + 1 < periods {
        return 0.0;
    }
    let values = ema_series(&set.candles()[..=index], periods);
    set.decimal_format().round(values[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::set_from_closes;

    #[test]
    fn sma_period_zero_invalid() {
        assert!(Sma::new(0).is_err());
    }

    #[test]
    fn sma_known_values_with_backfill() {
        let set = set_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut sma = Sma::new(3).unwrap();
        let values = sma.calculate(&set).unwrap();
        // (1+2+3)/3 = 2.0, (2+3+4)/3 = 3.0, (3+4+5)/3 = 4.0
        assert_eq!(values.len(), 5);
        assert!((values[0] - 2.0).abs() < 1e-9);
        assert!((values[1] - 2.0).abs() < 1e-9);
        assert!((values[2] - 2.0).abs() < 1e-9);
        assert!((values[3] - 3.0).abs() < 1e-9);
        assert!((values[4] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn sma_insufficient_data() {
        let mut sma = Sma::new(5).unwrap();
        assert!(sma.calculate(&set_from_closes(&[1.0; 4])).is_err());
        assert!(sma.values().is_none());
    }

    #[test]
    fn sma_exact_window_is_enough() {
        let mut sma = Sma::new(4).unwrap();
        let values = sma.calculate(&set_from_closes(&[2.0, 4.0, 6.0, 8.0])).unwrap();
        for v in values {
            assert!((v - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ema_period_zero_invalid() {
        assert!(Ema::new(0).is_err());
    }

    #[test]
    fn ema_flat_prices() {
        let mut ema = Ema::new(3).unwrap();
        let values = ema.calculate(&set_from_closes(&[10.0; 6])).unwrap();
        for v in values {
            assert!((v - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ema_seed_equals_sma_then_smooths() {
        let mut ema = Ema::new(3).unwrap();
        let values = ema.calculate(&set_from_closes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        // seed = (1+2+3)/3 = 2.0, k = 0.5 -> 4*0.5 + 2*0.5 = 3.0
        assert!((values[0] - 2.0).abs() < 1e-9);
        assert!((values[2] - 2.0).abs() < 1e-9);
        assert!((values[3] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn point_values_before_window_are_neutral() {
        let set = set_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(sma_at(1, &set, 3), 0.0);
        assert_eq!(ema_at(1, &set, 3), 0.0);
        assert_eq!(sma_at(2, &set, 0), 0.0);
        assert!((sma_at(3, &set, 3) - 3.0).abs() < 1e-9);
        assert!((ema_at(3, &set, 3) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn point_values_past_end_are_neutral() {
        let set = set_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(sma_at(4, &set, 3), 0.0);
        assert_eq!(sma_at(usize::MAX, &set, 3), 0.0);
        assert_eq!(ema_at(usize::MAX, &set, 3), 0.0);
        assert_eq!(sma_at(usize::MAX, &set, usize::MAX), 0.0);
    }

    #[test]
    fn descriptions() {
        assert_eq!(Sma::new(20).unwrap().description(), "SMA(20)");
        assert_eq!(Ema::new(9).unwrap().description(), "EMA(9)");
        assert_eq!(Ema::new(9).unwrap().prepend_candles_needed(), 8);
    }
}
