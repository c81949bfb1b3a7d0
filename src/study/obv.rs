use error_stack::Report;

use crate::error::StudyError;
use crate::model::{Candle, CandleSet};
use crate::study::{Recalc, Study, StudyKind, StudyState, fall_back};

/// On-Balance Volume: running sum of volume signed by the close-to-close direction.
///
/// Has no window and no warm-up; the first value is zero.
pub struct Obv {
    state: StudyState,
}

impl Obv {
    pub fn new() -> Self {
        Self {
            state: StudyState::new(0),
        }
    }
}

impl Default for Obv {
    fn default() -> Self {
        Self::new()
    }
}

impl Study for Obv {
    fn kind(&self) -> StudyKind {
        StudyKind::Obv
    }

    fn state(&self) -> &StudyState {
        &self.state
    }

    /// OBV has no window; the call only discards computed output.
    fn set_periods(&mut self, _periods: usize) -> Result<(), Report<StudyError>> {
        self.state.reset(0);
        Ok(())
    }

    fn first_valid_index(&self) -> usize {
        0
    }

    fn prepend_candles_needed(&self) -> usize {
        0
    }

    fn description(&self) -> String {
        "OBV".into()
    }

    fn tooltip(&self) -> String {
        "On-Balance Volume: cumulative volume signed by close direction".into()
    }

    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>> {
        self.state.ensure_len(set, self.required_candles())?;
        let values = series(set.candles());
        Ok(self.state.publish(set, values))
    }

    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>> {
        let from = match self.state.begin_tail(set.len(), self.first_valid_index()) {
            Ok(from) => from,
            Err(reason) => return fall_back(self, set, reason),
        };
        let candles = set.candles();
        let values = self.state.buffer_mut();
        for i in from..candles.len() {
            values[i] = values[i - 1] + signed_volume(candles, i);
        }
        self.state.finish_tail(set);
        Ok(Recalc::Tail { from })
    }

    fn value_at(&self, index: usize, set: &CandleSet) -> f64 {
        value_at(index, set)
    }
}

fn signed_volume(candles: &[Candle], i: usize) -> f64 {
    let (close, prev_close) = (candles[i].close, candles[i - 1].close);
    if close > prev_close {
        candles[i].volume
    } else if close < prev_close {
        -candles[i].volume
    } else {
        0.0
    }
}

fn series(candles: &[Candle]) -> Vec<f64> {
    let mut values = vec![0.0; candles.len()];
    for i in 1..candles.len() {
        values[i] = values[i - 1] + signed_volume(candles, i);
    }
    values
}

/// OBV at `index` from scratch; `0.0` past the end of the series.
pub fn value_at(index: usize, set: &CandleSet) -> f64 {
    if index >= set.len() {
        return 0.0;
    }
    let values = series(&set.candles()[..=index]);
    set.decimal_format().round(values[index])
}
