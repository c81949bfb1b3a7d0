pub mod terminal;

use crate::chart::StudySnapshot;

/// Consumer of published study snapshots, e.g. a chart legend.
pub trait LegendSink: Send + Sync {
    fn show(&self, snapshot: &StudySnapshot);
}
