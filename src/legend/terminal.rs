use crate::chart::StudySnapshot;
use crate::legend::LegendSink;

pub struct TerminalLegend;

impl LegendSink for TerminalLegend {
    fn show(&self, snapshot: &StudySnapshot) {
        tracing::info!(
            study = %snapshot.description,
            id = %snapshot.id,
            value = snapshot.last_value(),
            precision = %snapshot.decimal_format.pattern(),
            bands = snapshot.bands.len(),
            tooltip = %snapshot.tooltip,
            "{}",
            snapshot.legend(),
        );
    }
}
