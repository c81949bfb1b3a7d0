use error_stack::Report;

use crate::error::StudyError;
use crate::model::{Candle, CandleSet};
use crate::study::atr::true_range;
use crate::study::{
    Recalc, Study, StudyKind, StudyLine, StudyState, backfill, fall_back, validate_periods,
    wilder_seed, wilder_step,
};

/// Average Directional Index.
///
/// True range and directional movement are summed with Wilder's running-sum
/// smoothing from index `periods`; DX is then averaged into ADX from index
/// `2 * periods - 1`.
pub struct Adx {
    state: StudyState,
    smoothed: Vec<Smoothed>,
    plus_di: Vec<f64>,
    minus_di: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Smoothed {
    tr: f64,
    plus_dm: f64,
    minus_dm: f64,
}

impl Adx {
    pub fn new(periods: usize) -> Result<Self, Report<StudyError>> {
        Ok(Self {
            state: StudyState::new(validate_periods(periods)?),
            smoothed: Vec::new(),
            plus_di: Vec::new(),
            minus_di: Vec::new(),
        })
    }

    fn clear_series(&mut self) {
        self.smoothed.clear();
        self.plus_di.clear();
        self.minus_di.clear();
    }
}

impl Study for Adx {
    fn kind(&self) -> StudyKind {
        StudyKind::Adx
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(validate_periods(periods)?);
        self.clear_series();
        Ok(())
    }

    fn first_valid_index(&self) -> usize {
        first_adx_index(self.state.periods())
    }

    fn prepend_candles_needed(&self) -> usize {
        first_adx_index(self.state.periods()) - 1
    }

    fn tooltip(&self) -> String {
        format!(
            "Average Directional Index: trend strength from smoothed +DI/-DI over {} periods",
            self.state.periods()
        )
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        if let Err(report) = self.state.ensure_len(set, self.required_candles()) {
            self.clear_series();
            return Err(report);
        }
        let series = series(set.candles(), self.state.periods());
        self.smoothed = series.smoothed;
        self.plus_di = series.plus_di;
        self.minus_di = series.minus_di;
        Ok(self.state.publish(set, series.adx))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let periods = self.state.periods();
        let candles = set.candles();
        self.smoothed.resize(candles.len(), Smoothed::default());
        self.plus_di.resize(candles.len(), 0.0);
        self.minus_di.resize(candles.len(), 0.0);
        let values = self.state.buffer_mut();
        for i in from..candles.len() {
            let smoothed = smooth_step(self.smoothed[i - 1], candles, i, periods);
            let (plus_di, minus_di, dx) = directional_index(smoothed);
            self.smoothed[i] = smoothed;
            self.plus_di[i] = plus_di;
            self.minus_di[i] = minus_di;
            values[i] = wilder_step(values[i - 1], dx, periods);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        value_at(index, set, self.state.periods())
    }

    fn bands(&self) -> Vec<StudyLine> {
        if self.state.values().is_none() {
            return Vec::new();
        }
        vec![
            StudyLine {
                name: "+DI",
                values: self.plus_di.clone(),
            },
            StudyLine {
                name: "-DI",
                values: self.minus_di.clone(),
            },
        ]
    }
}

struct AdxSeries {
    adx: Vec<f64>,
    smoothed: Vec<Smoothed>,
    plus_di: Vec<f64>,
    minus_di: Vec<f64>,
}

/// DX needs `periods` smoothed values before it can be averaged. Requires `periods >= 1`.
fn first_adx_index(periods: usize) -> usize {
    periods.saturating_mul(2) - 1
}

/// Wilder's +DM / -DM at `i`. Requires `i >= 1`.
fn directional_movement(candles: &[Candle], i: usize) -> (f64, f64) {
    let up_move = candles[i].high - candles[i - 1].high;
    let down_move = candles[i - 1].low - candles[i].low;
    let plus_dm = if up_move > down_move && up_move > 0.0 {
        up_move
    } else {
        0.0
    };
    let minus_dm = if down_move > up_move && down_move > 0.0 {
        down_move
    } else {
        0.0
    };
    (plus_dm, minus_dm)
}

fn running_sum_step(previous: f64, sample: f64, periods: usize) -> f64 {
    previous - previous / periods as f64 + sample
}

fn smooth_step(previous: Smoothed, candles: &[Candle], i: usize, periods: usize) -> Smoothed {
    let (plus_dm, minus_dm) = directional_movement(candles, i);
    Smoothed {
        tr: running_sum_step(previous.tr, true_range(candles, i), periods),
        plus_dm: running_sum_step(previous.plus_dm, plus_dm, periods),
        minus_dm: running_sum_step(previous.minus_dm, minus_dm, periods),
    }
}

/// (+DI, -DI, DX) from smoothed sums.
fn directional_index(smoothed: Smoothed) -> (f64, f64, f64) {
    if smoothed.tr == 0.0 {
        return (0.0, 0.0, 0.0);
    }
    let plus_di = 100.0 * smoothed.plus_dm / smoothed.tr;
    let minus_di = 100.0 * smoothed.minus_dm / smoothed.tr;
    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0
    } else {
        100.0 * (plus_di - minus_di).abs() / di_sum
    };
    (plus_di, minus_di, dx)
}

/// Full ADX series. Callers guarantee `candles.len() >= 2 * periods`.
fn series(candles: &[Candle], periods: usize) -> AdxSeries {
    let len = candles.len();
    let first_adx = first_adx_index(periods);

    let mut smoothed = vec![Smoothed::default(); len];
    let mut seed = Smoothed::default();
    for i in 1..=periods {
        let (plus_dm, minus_dm) = directional_movement(candles, i);
        seed.tr += true_range(candles, i);
        seed.plus_dm += plus_dm;
        seed.minus_dm += minus_dm;
    }
    smoothed[periods] = seed;
    for i in periods + 1..len {
        smoothed[i] = smooth_step(smoothed[i - 1], candles, i, periods);
    }

    let mut plus_di = vec![0.0; len];
    let mut minus_di = vec![0.0; len];
    let mut dx = vec![0.0; len];
    for i in periods..len {
        (plus_di[i], minus_di[i], dx[i]) = directional_index(smoothed[i]);
    }

    let mut adx = vec![0.0; len];
    adx[first_adx] = wilder_seed(&dx[periods..=first_adx]);
    for i in first_adx + 1..len {
        adx[i] = wilder_step(adx[i - 1], dx[i], periods);
    }
    backfill(&mut adx, first_adx);
    backfill(&mut plus_di, periods);
    backfill(&mut minus_di, periods);

    AdxSeries {
        adx,
        smoothed,
        plus_di,
        minus_di,
    }
}

/// ADX at `index` from scratch; `0.0` inside the warm-up region or out of range.
pub fn value_at(index: usize, set: &CandleSet, periods: usize) -> f64 {
    if periods == 0 || index >= set.len() || index < first_adx_index(periods) {
        return 0.0;
    }
    let series = series(&set.candles()[..=index], periods);
    set.decimal_format().round(series.adx[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{candle_at, random_set};
    use crate::model::Frequency;

    fn trending_up(len: usize) -> CandleSet {
        let candles = (0..len)
            .map(|d| {
                let base = 100.0 + d as f64 * 2.0;
                candle_at(d as i64, base, base + 1.0, base - 1.0, base + 0.5, 1.0)
            })
            .collect();
        CandleSet::new(candles, 2, Frequency::Day1)
    }

    #[test]
    fn adx_period_zero_invalid() {
        assert!(Adx::new(0).is_err());
    }

    #[test]
    fn adx_requires_two_windows() {
        let mut adx = Adx::new(5).unwrap();
        assert_eq!(adx.required_candles(), 10);
        assert_eq!(adx.prepend_candles_needed(), 8);
        assert!(adx.calculate(&random_set(9, 3)).is_err());
        assert!(adx.calculate(&random_set(10, 3)).is_ok());
    }

    #[test]
    fn steady_uptrend_is_strong_trend() {
        let mut adx = Adx::new(5).unwrap();
        let values = adx.calculate(&trending_up(30)).unwrap();
        // Only +DM is ever positive, so DX is 100 everywhere
        for v in values {
            assert!((v - 100.0).abs() < 1e-9);
        }
        let bands = adx.bands();
        assert_eq!(bands.len(), 2);
        assert!(bands[0].values.iter().all(|v| *v > 0.0));
        assert!(bands[1].values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn adx_bounded() {
        let mut adx = Adx::new(7).unwrap();
        for v in adx.calculate(&random_set(90, 57)).unwrap() {
            assert!((0.0..=100.0).contains(v));
        }
    }

    #[test]
    fn directional_movement_picks_dominant_side() {
        let candles = vec![
            candle_at(0, 10.0, 12.0, 9.0, 11.0, 1.0),
            candle_at(1, 11.0, 14.0, 8.5, 12.0, 1.0),
            candle_at(2, 12.0, 13.0, 6.0, 7.0, 1.0),
        ];
        assert_eq!(directional_movement(&candles, 1), (2.0, 0.0));
        assert_eq!(directional_movement(&candles, 2), (0.0, 2.5));
    }
}
