use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChartError, StudyError};
use crate::model::{Candle, CandleSet, DecimalFormat};
use crate::study::{Study, StudyLine, StudyOutput};

pub type StudyId = Uuid;

/// Immutable view of a study's output, published after every recompute.
///
/// Readers hold the previous snapshot until the next one is published in full,
/// so a recompute is never observed half-way through.
#[derive(Debug, Clone)]
pub struct StudySnapshot {
    pub id: StudyId,
    pub description: String,
    pub tooltip: String,
    pub output: Arc<StudyOutput>,
    pub bands: Arc<Vec<StudyLine>>,
    pub decimal_format: DecimalFormat,
    pub calculated_at: Option<DateTime<Utc>>,
    /// First index inside the user-visible window.
    pub visible_from: usize,
}

impl StudySnapshot {
    fn capture(id: StudyId, study: &dyn Study, visible_from: usize) -> Self {
        let state = study.state();
        Self {
            id,
            description: study.description(),
            tooltip: study.tooltip(),
            output: Arc::new(state.output().clone()),
            bands: Arc::new(study.bands()),
            decimal_format: state.decimal_format(),
            calculated_at: state.time_last_calculated(),
            visible_from,
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.output.values().and_then(|v| v.last().copied())
    }

    /// One-line legend, e.g. `ATR(14) 1.25`.
    pub fn legend(&self) -> String {
        match self.output.as_ref() {
            StudyOutput::Computed(values) => match values.last() {
                Some(v) => format!("{} {}", self.description, self.decimal_format.format(*v)),
                None => format!("{} -", self.description),
            },
            StudyOutput::InsufficientData {
                required,
                available,
            } => format!(
                "{} (needs {required} candles, have {available})",
                self.description
            ),
            StudyOutput::NotComputed => format!("{} -", self.description),
        }
    }
}

/// How a live tick was applied to the candle set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Appended,
    Revised,
}

struct AttachedStudy {
    id: StudyId,
    study: Box<dyn Study>,
    publisher: watch::Sender<StudySnapshot>,
}

/// Owner of a candle set and the studies computed over it.
///
/// All recomputation happens synchronously on the caller; consumers read
/// published snapshots through the receivers handed out by [`Chart::attach`].
#[derive(Default)]
pub struct Chart {
    candles: Option<CandleSet>,
    studies: Vec<AttachedStudy>,
}

impl Chart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candles(&self) -> Option<&CandleSet> {
        self.candles.as_ref()
    }

    /// Attach a study, computing it right away when candles are loaded.
    pub fn attach(&mut self, mut study: Box<dyn Study>) -> (StudyId, watch::Receiver<StudySnapshot>) {
        let id = Uuid::new_v4();
        if let Some(set) = &self.candles {
            recalculate(study.as_mut(), set);
        }
        let visible_from = self.visible_from();
        let (publisher, receiver) =
            watch::channel(StudySnapshot::capture(id, study.as_ref(), visible_from));
        info!(study = %study.description(), %id, "study attached");
        self.studies.push(AttachedStudy {
            id,
            study,
            publisher,
        });
        (id, receiver)
    }

    /// Detach a study. Its receivers observe the channel closing.
    pub fn detach(&mut self, id: StudyId) -> Result<(), Report<ChartError>> {
        let position = self.position(id)?;
        let removed = self.studies.remove(position);
        info!(study = %removed.study.description(), %id, "study detached");
        Ok(())
    }

    pub fn studies(&self) -> impl Iterator<Item = (StudyId, &dyn Study)> {
        self.studies.iter().map(|s| (s.id, s.study.as_ref()))
    }

    /// Largest warm-up any attached study needs ahead of the visible window.
    pub fn required_prepend(&self) -> usize {
        self.studies
            .iter()
            .map(|s| s.study.prepend_candles_needed())
            .max()
            .unwrap_or(0)
    }

    /// Change a study's window and recompute it in full.
    pub fn set_periods(&mut self, id: StudyId, periods: usize) -> Result<(), Report<ChartError>> {
        let visible_from = self.visible_from();
        let position = self.position(id)?;
        let entry = &mut self.studies[position];
        entry
            .study
            .set_periods(periods)
            .change_context(ChartError::Study)?;
        if let Some(set) = &self.candles {
            recalculate(entry.study.as_mut(), set);
        }
        publish(entry, visible_from);
        Ok(())
    }

    /// Replace the candle set wholesale and recompute every study.
    pub fn reload(&mut self, set: CandleSet) {
        info!(
            candles = set.len(),
            frequency = %set.frequency(),
            intraday = set.frequency().is_intraday(),
            start = ?set.start_time(),
            end = ?set.end_time(),
            prepend = set.prepend_candles(),
            "candle set loaded"
        );
        let visible_from = set.start_time_index();
        for entry in &mut self.studies {
            recalculate(entry.study.as_mut(), &set);
            publish(entry, visible_from);
        }
        self.candles = Some(set);
    }

    /// Apply a live tick: a candle with the last bar's timestamp revises it,
    /// a newer one is appended. Studies take their tail-update path.
    pub fn apply_tick(&mut self, candle: Candle) -> Result<TickKind, Report<ChartError>> {
        let set = self.candles.as_mut().ok_or(ChartError::NoCandles)?;
        let kind = if set.last().is_some_and(|last| last.timestamp == candle.timestamp) {
            set.revise_last(candle)?;
            TickKind::Revised
        } else {
            set.push(candle)
                .attach_with(|| format!("tick timestamp: {}", candle.timestamp))?;
            TickKind::Appended
        };

        let visible_from = set.start_time_index();
        for entry in &mut self.studies {
            match entry.study.update(set) {
                Ok(recalc) => debug!(
                    study = %entry.study.description(),
                    recalc = ?recalc,
                    candles = set.len(),
                    "study updated"
                ),
                Err(report) => log_study_error(entry.study.as_ref(), &report),
            }
            publish(entry, visible_from);
        }
        Ok(kind)
    }

    /// Stateless value of a study at `index`, independent of its cached output.
    pub fn point_value(&self, id: StudyId, index: usize) -> Result<f64, Report<ChartError>> {
        let set = self.candles.as_ref().ok_or(ChartError::NoCandles)?;
        Ok(self.find(id)?.study.value_at(index, set))
    }

    fn visible_from(&self) -> usize {
        self.candles.as_ref().map_or(0, CandleSet::start_time_index)
    }

    fn position(&self, id: StudyId) -> Result<usize, Report<ChartError>> {
        self.studies
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| unknown_study(id))
    }

    fn find(&self, id: StudyId) -> Result<&AttachedStudy, Report<ChartError>> {
        self.studies
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| unknown_study(id))
    }
}

fn unknown_study(id: StudyId) -> Report<ChartError> {
    Report::new(ChartError::UnknownStudy { id: id.to_string() })
}

fn recalculate(study: &mut dyn Study, set: &CandleSet) {
    let result = study.calculate(set).map(<[f64]>::len);
    match result {
        Ok(values) => debug!(
            study = %study.description(),
            values,
            "study recalculated"
        ),
        Err(report) => log_study_error(study, &report),
    }
}

fn log_study_error(study: &dyn Study, report: &Report<StudyError>) {
    match report.current_context() {
        StudyError::InsufficientData {
            required,
            available,
        } => debug!(
            study = %study.description(),
            required,
            available,
            "not enough candles for study"
        ),
        StudyError::InvalidParameter { .. } => warn!(
            study = %study.description(),
            error = ?report,
            "study recompute failed"
        ),
    }
}

fn publish(entry: &AttachedStudy, visible_from: usize) {
    entry.publisher.send_replace(StudySnapshot::capture(
        entry.id,
        entry.study.as_ref(),
        visible_from,
    ));
}
