pub mod file;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::model::{Candle, CandleSet};

/// Source of candles for a chart.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn CandleFeed`).
pub trait CandleFeed: Send + Sync {
    /// Load the initial series with at least `prepend` candles ahead of the
    /// visible window when the source has them.
    fn load(&self, prepend: usize) -> BoxFuture<'_, Result<CandleSet, Report<FeedError>>>;

    /// Stream live ticks into `tx` until the source is exhausted or `cancel` fires.
    fn subscribe(
        &self,
        tx: mpsc::Sender<Candle>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<FeedError>>>;
}
