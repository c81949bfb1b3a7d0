use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt, bail};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::feed::CandleFeed;
use crate::model::{Candle, CandleSet, Frequency};

/// Candle feed backed by a local JSON file.
///
/// The last `live_candles` candles of the requested window are held back from
/// [`CandleFeed::load`] and replayed by [`CandleFeed::subscribe`] at a fixed
/// tick rate.
pub struct FileFeed {
    path: PathBuf,
    decimals: u32,
    frequency: Frequency,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    live_candles: usize,
    intrabar_ticks: bool,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl FileFeed {
    pub fn from_config(config: &FeedConfig) -> Result<Self, Report<FeedError>> {
        let Some(frequency) = Frequency::from_str(&config.frequency) else {
            bail!(FeedError::Parse {
                reason: format!("unknown frequency \"{}\"", config.frequency),
            });
        };
        let rate = NonZeroU32::new(config.ticks_per_second).unwrap_or(nonzero!(5u32));
        Ok(Self {
            path: PathBuf::from(&config.path),
            decimals: config.decimals,
            frequency,
            start_time: config.start_time,
            end_time: config.end_time,
            live_candles: config.live_candles,
            intrabar_ticks: config.intrabar_ticks,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        })
    }

    async fn read_candles(&self) -> Result<Vec<Candle>, Report<FeedError>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .change_context(FeedError::ReadFile)
            .attach_with(|| format!("path: {}", self.path.display()))?;
        parse_candles(&content).attach_with(|| format!("path: {}", self.path.display()))
    }

    fn split(&self, candles: Vec<Candle>, prepend: usize) -> Split {
        split(
            candles,
            self.start_time,
            self.end_time,
            prepend,
            self.live_candles,
        )
    }
}

impl CandleFeed for FileFeed {
    fn load(&self, prepend: usize) -> BoxFuture<'_, Result<CandleSet, Report<FeedError>>> {
        Box::pin(async move {
            let candles = self.read_candles().await?;
            let split = self.split(candles, prepend);

            if self.start_time.is_some() && split.prepended < prepend {
                warn!(
                    requested = prepend,
                    available = split.prepended,
                    "fewer warm-up candles than requested"
                );
            }
            info!(
                path = %self.path.display(),
                candles = split.history.len(),
                prepend = split.prepended,
                live = split.live.len(),
                "candle file loaded"
            );

            Ok(CandleSet::new(split.history, self.decimals, self.frequency)
                .with_window(self.start_time, self.end_time)
                .with_prepend(split.prepended))
        })
    }

    fn subscribe(
        &self,
        tx: mpsc::Sender<Candle>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<FeedError>>> {
        Box::pin(async move {
            let candles = self.read_candles().await?;
            let live = self.split(candles, 0).live;
            info!(candles = live.len(), "replaying live candles");

            for candle in live {
                let ticks = if self.intrabar_ticks {
                    vec![forming(&candle), candle]
                } else {
                    vec![candle]
                };
                for tick in ticks {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("replay cancelled");
                            return Ok(());
                        }
                        _ = self.rate_limiter.until_ready() => {}
                    }
                    debug!(timestamp = %tick.timestamp, close = tick.close, "tick");
                    tx.send(tick).await.change_context(FeedError::Stream)?;
                }
            }

            info!("replay finished");
            Ok(())
        })
    }
}

struct Split {
    history: Vec<Candle>,
    live: Vec<Candle>,
    /// Candles actually available ahead of the first visible one.
    prepended: usize,
}

fn parse_candles(content: &str) -> Result<Vec<Candle>, Report<FeedError>> {
    let candles: Vec<Candle> =
        serde_json::from_str(content).change_context(FeedError::Parse {
            reason: "expected a JSON array of candles".into(),
        })?;
    if let Some(index) = candles
        .windows(2)
        .position(|w| w[1].timestamp <= w[0].timestamp)
    {
        bail!(FeedError::Unordered { index: index + 1 });
    }
    Ok(candles)
}

fn split(
    mut candles: Vec<Candle>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    prepend: usize,
    live_candles: usize,
) -> Split {
    if let Some(end) = end_time {
        let keep = candles.partition_point(|c| c.timestamp <= end);
        candles.truncate(keep);
    }
    let first_visible = start_time.map_or(0, |start| candles.partition_point(|c| c.timestamp < start));
    let begin = first_visible.saturating_sub(prepend);
    let mut history = candles.split_off(begin);
    let live = history.split_off(history.len().saturating_sub(live_candles));
    Split {
        history,
        live,
        prepended: first_visible - begin,
    }
}

/// Half-formed version of `candle`, as a live feed would report it mid-bar.
fn forming(candle: &Candle) -> Candle {
    let mid = (candle.open + candle.close) / 2.0;
    Candle {
        timestamp: candle.timestamp,
        open: candle.open,
        high: candle.open.max(mid),
        low: candle.open.min(mid),
        close: mid,
        volume: candle.volume / 2.0,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use super::*;
    use crate::model::test_support::random_walk;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn feed_config(path: &str) -> FeedConfig {
        FeedConfig {
            path: path.into(),
            decimals: 2,
            frequency: "1d".into(),
            start_time: Some(day(10)),
            end_time: Some(day(29)),
            live_candles: 3,
            ticks_per_second: 1000,
            intrabar_ticks: true,
        }
    }

    fn write_candles(candles: &[Candle]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("chart-studies-{}.json", Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(candles).unwrap()).unwrap();
        path
    }

    #[test]
    fn split_selects_prepend_window_and_live_tail() {
        let candles = random_walk(40, 9);
        let split = split(candles.clone(), Some(day(10)), Some(day(29)), 4, 3);
        assert_eq!(split.prepended, 4);
        assert_eq!(split.history.first().map(|c| c.timestamp), Some(day(6)));
        assert_eq!(split.history.len(), 24 - 3);
        assert_eq!(split.live.len(), 3);
        assert_eq!(split.live.last().map(|c| c.timestamp), Some(day(29)));
    }

    #[test]
    fn split_caps_prepend_at_available_history() {
        let candles = random_walk(20, 9);
        let split = split(candles, Some(day(2)), None, 10, 0);
        assert_eq!(split.prepended, 2);
        assert_eq!(split.history.len(), 20);
        assert!(split.live.is_empty());
    }

    #[test]
    fn unordered_candles_rejected() {
        let mut candles = random_walk(5, 1);
        candles.swap(2, 3);
        let json = serde_json::to_string(&candles).unwrap();
        let err = parse_candles(&json).unwrap_err();
        assert!(matches!(err.current_context(), FeedError::Unordered { index: 3 }));
    }

    #[test]
    fn prices_survive_a_file_round_trip_exactly() {
        let mut candles = random_walk(3, 12);
        candles[1].close = 102.66180000000001;
        candles[2].high = 0.1 + 0.2;
        let json = serde_json::to_string(&candles).unwrap();
        assert_eq!(parse_candles(&json).unwrap(), candles);
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(parse_candles("{\"not\": \"candles\"}").is_err());
    }

    #[test]
    fn forming_bar_stays_inside_final_bar() {
        for candle in random_walk(30, 4) {
            let partial = forming(&candle);
            assert_eq!(partial.timestamp, candle.timestamp);
            assert!(partial.high <= candle.high);
            assert!(partial.low >= candle.low);
            assert!(partial.volume < candle.volume);
        }
    }

    #[tokio::test]
    async fn load_and_replay_round_trip() {
        let candles = random_walk(40, 21);
        let path = write_candles(&candles);
        let feed = FileFeed::from_config(&feed_config(path.to_str().unwrap())).unwrap();

        let set = feed.load(5).await.unwrap();
        assert_eq!(set.prepend_candles(), 5);
        assert_eq!(set.start_time_index(), 5);
        assert_eq!(set.len(), 25 - 3);
        assert_eq!(set.decimals(), 2);

        let (tx, mut rx) = mpsc::channel(16);
        feed.subscribe(tx, CancellationToken::new()).await.unwrap();
        let mut ticks = Vec::new();
        while let Some(tick) = rx.recv().await {
            ticks.push(tick);
        }
        // Each live candle arrives as a forming bar and then the final bar
        assert_eq!(ticks.len(), 6);
        assert_eq!(ticks[1], candles[27]);
        assert_eq!(ticks[5], candles[29]);
        assert_eq!(ticks[4].timestamp, ticks[5].timestamp);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn cancelled_replay_stops_early() {
        let path = write_candles(&random_walk(40, 22));
        let feed = FileFeed::from_config(&feed_config(path.to_str().unwrap())).unwrap();
        // The limiter has burst capacity left, so both branches are ready every time
        for _ in 0..20 {
            let cancel = CancellationToken::new();
            cancel.cancel();
            let (tx, mut rx) = mpsc::channel(16);
            feed.subscribe(tx, cancel).await.unwrap();
            assert!(rx.recv().await.is_none());
        }
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let feed = FileFeed::from_config(&feed_config("/nonexistent/candles.json")).unwrap();
        let err = feed.load(0).await.unwrap_err();
        assert!(matches!(err.current_context(), FeedError::ReadFile));
    }
}
