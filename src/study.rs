pub mod adx;
pub mod atr;
pub mod channel;
pub mod ma;
pub mod obv;
pub mod rsi;

use std::fmt;

use chrono::{DateTime, Utc};
use error_stack::{Report, bail};
use tracing::debug;

use crate::error::StudyError;
use crate::model::{CandleSet, DecimalFormat};

use self::adx::Adx;
use self::atr::Atr;
use self::channel::{PriceChannel, RecentHighLow};
use self::ma::{Ema, Sma};
use self::obv::Obv;
use self::rsi::Rsi;

/// Upper bound on a study window; keeps warm-up index arithmetic in range.
pub const MAX_PERIODS: usize = 100_000;

/// Indicator variants a chart can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StudyKind {
    Atr,
    Sma,
    Ema,
    Rsi,
    Adx,
    Obv,
    RecentHighLow,
    PriceChannel,
}

impl StudyKind {
    pub const ALL: [StudyKind; 8] = [
        Self::Atr,
        Self::Sma,
        Self::Ema,
        Self::Rsi,
        Self::Adx,
        Self::Obv,
        Self::RecentHighLow,
        Self::PriceChannel,
    ];

    /// Parse a config-format string (e.g. `"atr"`, `"price_channel"`).
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "atr" => Some(Self::Atr),
            "sma" => Some(Self::Sma),
            "ema" => Some(Self::Ema),
            "rsi" => Some(Self::Rsi),
            "adx" => Some(Self::Adx),
            "obv" => Some(Self::Obv),
            "recent_high_low" => Some(Self::RecentHighLow),
            "price_channel" => Some(Self::PriceChannel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Atr => "atr",
            Self::Sma => "sma",
            Self::Ema => "ema",
            Self::Rsi => "rsi",
            Self::Adx => "adx",
            Self::Obv => "obv",
            Self::RecentHighLow => "recent_high_low",
            Self::PriceChannel => "price_channel",
        }
    }

    /// Short legend label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Atr => "ATR",
            Self::Sma => "SMA",
            Self::Ema => "EMA",
            Self::Rsi => "RSI",
            Self::Adx => "ADX",
            Self::Obv => "OBV",
            Self::RecentHighLow => "HighLow",
            Self::PriceChannel => "PriceChannel",
        }
    }

    /// Window length used when the caller does not configure one.
    pub fn default_periods(self) -> usize {
        match self {
            Self::Atr | Self::Rsi | Self::Adx => 14,
            Self::Sma | Self::Ema | Self::RecentHighLow | Self::PriceChannel => 20,
            Self::Obv => 0,
        }
    }
}

impl fmt::Display for StudyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output buffer of a study.
///
/// "Not computed yet" and "not enough candles" are distinct from a computed
/// series, so a legitimately zero value is never mistaken for missing data.
#[derive(Debug, Clone, PartialEq)]
pub enum StudyOutput {
    NotComputed,
    InsufficientData { required: usize, available: usize },
    Computed(Vec<f64>),
}

impl StudyOutput {
    pub fn values(&self) -> Option<&[f64]> {
        match self {
            Self::Computed(values) => Some(values),
            _ => None,
        }
    }
}

/// A secondary line drawn alongside the primary values (channel bands, DI lines).
#[derive(Debug, Clone, PartialEq)]
pub struct StudyLine {
    pub name: &'static str,
    pub values: Vec<f64>,
}

/// Which recompute path an update took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recalc {
    Full,
    Tail { from: usize },
}

/// Bookkeeping shared by every study: configured window, output buffer and
/// what the buffer was last computed with.
#[derive(Debug, Clone)]
pub struct StudyState {
    periods: usize,
    output: StudyOutput,
    periods_last_calculated: Option<usize>,
    decimal_format: DecimalFormat,
    time_last_calculated: Option<DateTime<Utc>>,
}

impl StudyState {
    pub fn new(periods: usize) -> Self {
        Self {
            periods,
            output: StudyOutput::NotComputed,
            periods_last_calculated: None,
            decimal_format: DecimalFormat::default(),
            time_last_calculated: None,
        }
    }

    pub fn periods(&self) -> usize {
        self.periods
    }

    pub fn output(&self) -> &StudyOutput {
        &self.output
    }

    pub fn values(&self) -> Option<&[f64]> {
        self.output.values()
    }

    pub fn periods_last_calculated(&self) -> Option<usize> {
        self.periods_last_calculated
    }

    pub fn decimal_format(&self) -> DecimalFormat {
        self.decimal_format
    }

    pub fn time_last_calculated(&self) -> Option<DateTime<Utc>> {
        self.time_last_calculated
    }

    /// Drop everything computed so far and adopt a new window length.
    pub(crate) fn reset(&mut self, periods: usize) {
        *self = Self::new(periods);
    }

    fn stamp(&mut self, set: &CandleSet) {
        self.periods_last_calculated = Some(self.periods);
        self.decimal_format = set.decimal_format();
        self.time_last_calculated = Some(Utc::now());
    }

    /// Record an insufficient-data result when the series is shorter than `required`.
    pub(crate) fn ensure_len(
        &mut self,
        set: &CandleSet,
        required: usize,
    ) -> Result<(), Report<StudyError>> {
        if set.len() < required {
            self.output = StudyOutput::InsufficientData {
                required,
                available: set.len(),
            };
            self.stamp(set);
            bail!(StudyError::InsufficientData {
                required,
                available: set.len(),
            });
        }
        Ok(())
    }

    /// Install a freshly computed full series.
    pub(crate) fn publish(&mut self, set: &CandleSet, values: Vec<f64>) -> &[f64] {
        debug_assert_eq!(values.len(), set.len());
        self.output = StudyOutput::Computed(values);
        self.stamp(set);
        self.output.values().unwrap_or_default()
    }

    /// Check whether the tail fast path applies for a series of `len` candles
    /// and, if so, grow the buffer to `len` and return the first index to
    /// recompute.
    ///
    /// The previously-last slot is always recomputed because a live bar may
    /// have been revised since it was last seen.
    pub(crate) fn begin_tail(&mut self, len: usize, first_valid: usize) -> Result<usize, &'static str> {
        if self.periods_last_calculated != Some(self.periods) {
            return Err("periods changed since last calculation");
        }
        let StudyOutput::Computed(values) = &mut self.output else {
            return Err("no computed values");
        };
        let previous = values.len();
        if len != previous && len != previous + 1 {
            return Err("series changed by more than one candle");
        }
        let from = previous.saturating_sub(1);
        if previous == 0 || from <= first_valid {
            return Err("tail overlaps the seed index");
        }
        values.resize(len, 0.0);
        Ok(from)
    }

    /// Buffer being rewritten by a tail update. Empty unless `begin_tail` succeeded.
    pub(crate) fn buffer_mut(&mut self) -> &mut [f64] {
        match &mut self.output {
            StudyOutput::Computed(values) => values.as_mut_slice(),
            _ => &mut [],
        }
    }

    pub(crate) fn finish_tail(&mut self, set: &CandleSet) {
        self.stamp(set);
    }
}

/// Technical-analysis study attached to a chart.
///
/// Values are index-aligned with the candle set they were computed from.
pub trait Study: Send + Sync {
    fn kind(&self) -> StudyKind;

    fn state(&self) -> &StudyState;

    /// Change the window length. Discards any computed output.
    fn set_periods(&mut self, periods: usize) -> Result<(), Report<StudyError>>;

    /// Index of the first value backed by a full window; earlier indices are backfilled.
    fn first_valid_index(&self) -> usize;

    /// Extra leading candles the data source should supply before the first
    /// visible index so the first on-screen value is converged.
    fn prepend_candles_needed(&self) -> usize;

    fn tooltip(&self) -> String;

    /// Recompute the whole series.
    fn calculate(&mut self, set: &CandleSet) -> Result<&[f64], Report<StudyError>>;

    /// Bring the output up to date after one candle was appended or the last
    /// candle was revised, falling back to [`Study::calculate`] when the tail
    /// recurrence is not applicable.
    fn update(&mut self, set: &CandleSet) -> Result<Recalc, Report<StudyError>>;

    /// Stateless value at `index` using this study's window length.
    fn value_at(&self, index: usize, set: &CandleSet) -> f64;

    fn bands(&self) -> Vec<StudyLine> {
        Vec::new()
    }

    fn periods(&self) -> usize {
        self.state().periods()
    }

    fn required_candles(&self) -> usize {
        self.first_valid_index() + 1
    }

    fn description(&self) -> String {
        format!("{}({})", self.kind().label(), self.periods())
    }

    fn output(&self) -> &StudyOutput {
        self.state().output()
    }

    fn values(&self) -> Option<&[f64]> {
        self.state().values()
    }
}

/// Build a study of `kind`, using its default window when `periods` is `None`.
pub fn build_study(
    kind: StudyKind,
    periods: Option<usize>,
) -> Result<Box<dyn Study>, Report<StudyError>> {
    let periods = periods.unwrap_or(kind.default_periods());
    let study: Box<dyn Study> = match kind {
        StudyKind::Atr => Box::new(Atr::new(periods)?),
        StudyKind::Sma => Box::new(Sma::new(periods)?),
        StudyKind::Ema => Box::new(Ema::new(periods)?),
        StudyKind::Rsi => Box::new(Rsi::new(periods)?),
        StudyKind::Adx => Box::new(Adx::new(periods)?),
        StudyKind::Obv => Box::new(Obv::new()),
        StudyKind::RecentHighLow => Box::new(RecentHighLow::new(periods)?),
        StudyKind::PriceChannel => Box::new(PriceChannel::new(periods)?),
    };
    Ok(study)
}

pub(crate) fn validate_periods(periods: usize) -> Result<usize, Report<StudyError>> {
    if periods == 0 {
        bail!(StudyError::InvalidParameter {
            name: "periods must be > 0".into(),
        });
    }
    if periods > MAX_PERIODS {
        bail!(StudyError::InvalidParameter {
            name: format!("periods {periods} exceeds {MAX_PERIODS}"),
        });
    }
    Ok(periods)
}

/// Run a full recompute in place of a tail update.
pub(crate) fn fall_back<S: Study + ?Sized>(
    study: &mut S,
    set: &CandleSet,
    reason: &'static str,
) -> Result<Recalc, Report<StudyError>> {
    debug!(
        study = %study.description(),
        candles = set.len(),
        reason,
        "tail update not applicable, recalculating"
    );
    study.calculate(set)?;
    Ok(Recalc::Full)
}

/// Fill the warm-up region with the first valid value.
pub(crate) fn backfill(values: &mut [f64], first_valid: usize) {
    if let Some(&seed) = values.get(first_valid) {
        values[..first_valid].fill(seed);
    }
}

/// Simple average seeding a Wilder-smoothed series.
pub(crate) fn wilder_seed(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Wilder's smoothing: an EMA with factor `1 / periods`.
pub(crate) fn wilder_step(previous: f64, sample: f64, periods: usize) -> f64 {
    (previous * (periods - 1) as f64 + sample) / periods as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{random_set, random_walk};
    use crate::model::{CandleSet, Frequency};

    fn all_studies(periods: usize) -> Vec<Box<dyn Study>> {
        StudyKind::ALL
            .iter()
            .map(|&kind| build_study(kind, Some(periods)).unwrap())
            .collect()
    }

    #[test]
    fn kind_round_trip() {
        for kind in StudyKind::ALL {
            assert_eq!(StudyKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(StudyKind::from_str("macd"), None);
    }

    #[test]
    fn zero_periods_rejected() {
        for kind in StudyKind::ALL {
            if kind == StudyKind::Obv {
                continue;
            }
            assert!(build_study(kind, Some(0)).is_err(), "{kind}");
        }
    }

    #[test]
    fn oversized_periods_rejected() {
        for kind in StudyKind::ALL {
            if kind == StudyKind::Obv {
                continue;
            }
            assert!(build_study(kind, Some(MAX_PERIODS)).is_ok(), "{kind}");
            assert!(build_study(kind, Some(MAX_PERIODS + 1)).is_err(), "{kind}");
        }
        let mut study = build_study(StudyKind::Adx, Some(3)).unwrap();
        assert!(study.set_periods(usize::MAX).is_err());
    }

    #[test]
    fn huge_window_point_value_is_neutral() {
        let set = random_set(30, 5);
        assert_eq!(adx::value_at(20, &set, usize::MAX), 0.0);
        assert_eq!(atr::value_at(20, &set, usize::MAX), 0.0);
        assert_eq!(rsi::value_at(20, &set, usize::MAX), 0.0);
        assert_eq!(ma::ema_at(20, &set, usize::MAX), 0.0);
        assert_eq!(channel::price_channel_mid_at(20, &set, usize::MAX), 0.0);
    }

    #[test]
    fn small_windows_at_the_minimum_length() {
        for periods in 1..=4 {
            for kind in StudyKind::ALL {
                let mut study = build_study(kind, Some(periods)).unwrap();
                let required = study.required_candles();
                let first_valid = study.first_valid_index();
                let candles = random_walk(required + 2, 53 + periods as u64);
                let sets: Vec<CandleSet> = (required..=required + 2)
                    .map(|n| CandleSet::new(candles[..n].to_vec(), 4, Frequency::Day1))
                    .collect();
                let label = format!("{} at {required} candles", study.description());

                let values = study.calculate(&sets[0]).unwrap().to_vec();
                assert_eq!(values.len(), required, "{label}");
                for v in &values[..first_valid] {
                    assert_eq!(*v, values[first_valid], "{label}");
                }

                // The seed index cannot be recomputed from its predecessor
                assert_eq!(study.update(&sets[1]).unwrap(), Recalc::Full, "{label}");
                assert_eq!(
                    study.update(&sets[2]).unwrap(),
                    Recalc::Tail { from: required },
                    "{label}"
                );
                let tail = study.values().unwrap().to_vec();
                let tail_bands = study.bands();

                let mut full = build_study(kind, Some(periods)).unwrap();
                full.calculate(&sets[2]).unwrap();
                assert_eq!(tail.len(), required + 2, "{label}");
                assert_eq!(tail, full.values().unwrap(), "{label}");
                assert_eq!(tail_bands, full.bands(), "{label}");
            }
        }
    }

    #[test]
    fn full_recompute_matches_candle_count() {
        let set = random_set(60, 7);
        for mut study in all_studies(10) {
            let values = study.calculate(&set).unwrap();
            assert_eq!(values.len(), set.len(), "{}", study.description());
            let state = study.state();
            assert_eq!(state.periods_last_calculated(), Some(study.periods()));
            assert!(state.time_last_calculated().is_some());
            assert_eq!(state.decimal_format().decimals(), 4);
        }
    }

    #[test]
    fn full_recompute_is_idempotent() {
        let set = random_set(50, 11);
        for mut study in all_studies(7) {
            let first = study.calculate(&set).unwrap().to_vec();
            let second = study.calculate(&set).unwrap().to_vec();
            assert_eq!(first, second, "{}", study.description());
        }
    }

    #[test]
    fn warm_up_is_backfilled_with_first_valid_value() {
        let set = random_set(60, 3);
        for mut study in all_studies(9) {
            let first_valid = study.first_valid_index();
            let values = study.calculate(&set).unwrap().to_vec();
            for (i, v) in values[..first_valid].iter().enumerate() {
                assert_eq!(*v, values[first_valid], "{} index {i}", study.description());
            }
        }
    }

    #[test]
    fn tail_update_matches_full_recompute() {
        let candles = random_walk(61, 19);
        let before = CandleSet::new(candles[..60].to_vec(), 4, Frequency::Day1);
        let after = CandleSet::new(candles.clone(), 4, Frequency::Day1);

        for mut study in all_studies(8) {
            study.calculate(&before).unwrap();
            let recalc = study.update(&after).unwrap();
            assert_eq!(recalc, Recalc::Tail { from: 59 }, "{}", study.description());
            let tail = study.values().unwrap().to_vec();
            let tail_bands = study.bands();

            study.calculate(&after).unwrap();
            assert_eq!(tail, study.values().unwrap(), "{}", study.description());
            assert_eq!(tail_bands, study.bands(), "{}", study.description());
        }
    }

    #[test]
    fn revised_last_candle_matches_full_recompute() {
        let candles = random_walk(40, 23);
        let mut set = CandleSet::new(candles.clone(), 4, Frequency::Day1);
        let mut revised = candles[39];
        revised.close += 3.0;
        revised.high = revised.high.max(revised.close);
        revised.volume += 250.0;

        for mut study in all_studies(6) {
            let mut live = set.clone();
            study.calculate(&live).unwrap();
            live.revise_last(revised).unwrap();
            assert_eq!(study.update(&live).unwrap(), Recalc::Tail { from: 39 });
            let tail = study.values().unwrap().to_vec();
            study.calculate(&live).unwrap();
            assert_eq!(tail, study.values().unwrap(), "{}", study.description());
        }
        set.revise_last(revised).unwrap();
        assert_eq!(set.last().map(|c| c.close), Some(revised.close));
    }

    #[test]
    fn changing_periods_forces_full_recompute() {
        let candles = random_walk(41, 5);
        let before = CandleSet::new(candles[..40].to_vec(), 4, Frequency::Day1);
        let after = CandleSet::new(candles, 4, Frequency::Day1);

        for mut study in all_studies(5) {
            if study.kind() == StudyKind::Obv {
                continue;
            }
            study.calculate(&before).unwrap();
            study.set_periods(6).unwrap();
            assert_eq!(study.output(), &StudyOutput::NotComputed);
            assert_eq!(study.update(&after).unwrap(), Recalc::Full);
            assert_eq!(study.values().unwrap().len(), after.len());
            assert_eq!(study.description(), format!("{}(6)", study.kind().label()));
        }
    }

    #[test]
    fn update_without_prior_calculation_is_full() {
        let set = random_set(30, 13);
        for mut study in all_studies(4) {
            assert_eq!(study.update(&set).unwrap(), Recalc::Full);
            assert_eq!(study.values().unwrap().len(), 30);
        }
    }

    #[test]
    fn jump_of_several_candles_is_full() {
        let candles = random_walk(45, 29);
        let before = CandleSet::new(candles[..40].to_vec(), 4, Frequency::Day1);
        let after = CandleSet::new(candles, 4, Frequency::Day1);
        for mut study in all_studies(5) {
            study.calculate(&before).unwrap();
            assert_eq!(study.update(&after).unwrap(), Recalc::Full);
        }
    }

    #[test]
    fn point_evaluator_matches_full_recompute() {
        let set = random_set(50, 31);
        let format = set.decimal_format();
        for mut study in all_studies(7) {
            let first_valid = study.first_valid_index();
            let values = study.calculate(&set).unwrap().to_vec();
            for x in first_valid..set.len() {
                assert_eq!(
                    study.value_at(x, &set),
                    format.round(values[x]),
                    "{} index {x}",
                    study.description()
                );
            }
        }
    }

    #[test]
    fn point_evaluator_returns_neutral_out_of_range() {
        let set = random_set(30, 37);
        for study in all_studies(5) {
            assert_eq!(study.value_at(30, &set), 0.0);
            assert_eq!(study.value_at(usize::MAX, &set), 0.0);
        }
    }

    #[test]
    fn insufficient_data_is_explicit() {
        let set = random_set(3, 41);
        for mut study in all_studies(14) {
            if study.kind() == StudyKind::Obv {
                continue;
            }
            let err = study.calculate(&set).unwrap_err();
            assert!(matches!(
                err.current_context(),
                StudyError::InsufficientData { available: 3, .. }
            ));
            assert!(matches!(
                study.output(),
                StudyOutput::InsufficientData { available: 3, .. }
            ));
            assert!(study.values().is_none());
            assert!(study.bands().is_empty());
            for x in 0..3 {
                assert_eq!(study.value_at(x, &set), 0.0);
            }
        }
    }

    #[test]
    fn short_series_update_stays_insufficient() {
        let candles = random_walk(5, 43);
        let before = CandleSet::new(candles[..4].to_vec(), 4, Frequency::Day1);
        let after = CandleSet::new(candles, 4, Frequency::Day1);
        let mut study = build_study(StudyKind::Atr, Some(14)).unwrap();
        assert!(study.calculate(&before).is_err());
        assert!(study.update(&after).is_err());
        assert_eq!(
            study.output(),
            &StudyOutput::InsufficientData {
                required: 15,
                available: 5
            }
        );
    }

    #[test]
    fn backfill_fills_prefix() {
        let mut values = vec![0.0, 0.0, 0.0, 4.0, 5.0];
        backfill(&mut values, 3);
        assert_eq!(values, vec![4.0, 4.0, 4.0, 4.0, 5.0]);
    }

    #[test]
    fn wilder_step_weights_previous_value() {
        assert!((wilder_step(10.0, 24.0, 14) - 11.0).abs() < 1e-12);
        assert!((wilder_seed(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-12);
    }
}
