mod chart;
mod config;
mod error;
mod feed;
mod legend;
mod model;
mod study;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chart::{Chart, StudySnapshot, TickKind};
use config::AppConfig;
use feed::CandleFeed;
use feed::file::FileFeed;
use legend::LegendSink;
use legend::terminal::TerminalLegend;
use model::{Candle, CandleSet};
use study::{StudyKind, build_study};

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("candle feed error")]
    Feed,
    #[display("chart error")]
    Chart,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "chart-studies", about = "Technical-analysis studies over a candle series")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "studies.toml")]
    config: String,

    /// Print every study's value at this candle index after the initial load
    #[arg(long)]
    query_index: Option<usize>,

    /// Skip replaying the withheld live candles
    #[arg(long)]
    no_replay: bool,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    // ── Studies ───────────────────────────────────────────────────────────────
    let mut chart = Chart::new();
    let legend: Arc<dyn LegendSink> = Arc::new(TerminalLegend);
    let mut legend_handles = Vec::new();

    for study_config in &config.studies {
        let Some(kind) = StudyKind::from_str(&study_config.kind) else {
            warn!(kind = %study_config.kind, "unknown study in config, skipping");
            continue;
        };
        let study = build_study(kind, study_config.periods)
            .change_context(AppError::Config)
            .attach_with(|| format!("study: {}", study_config.kind))?;
        let (_, receiver) = chart.attach(study);
        legend_handles.push(tokio::spawn(legend_loop(receiver, Arc::clone(&legend))));
    }

    // ── Initial load ──────────────────────────────────────────────────────────
    let feed: Arc<dyn CandleFeed> =
        Arc::new(FileFeed::from_config(&config.feed).change_context(AppError::Feed)?);

    let prepend = chart.required_prepend();
    let set = feed
        .load(prepend)
        .await
        .change_context(AppError::Feed)
        .attach_with(|| format!("feed: {}", config.feed.path))?;
    if set.is_empty() {
        warn!(path = %config.feed.path, "no candles in the requested window");
    }
    chart.reload(set);

    if let Some(index) = cli.query_index {
        query_point(&chart, index)?;
    }

    // ── Live replay ───────────────────────────────────────────────────────────
    if cli.no_replay {
        info!("live replay disabled");
    } else {
        replay(&mut chart, Arc::clone(&feed)).await?;
    }

    info!(
        candles = chart.candles().map_or(0, CandleSet::len),
        studies = chart.studies().count(),
        "chart closed"
    );

    // Dropping the chart closes every snapshot channel, ending the legend loops
    drop(chart);
    for handle in legend_handles {
        handle.await.change_context(AppError::Runtime)?;
    }

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn legend_loop(mut receiver: watch::Receiver<StudySnapshot>, legend: Arc<dyn LegendSink>) {
    let snapshot = receiver.borrow_and_update().clone();
    legend.show(&snapshot);
    while receiver.changed().await.is_ok() {
        let snapshot = receiver.borrow_and_update().clone();
        legend.show(&snapshot);
    }
}

/// Cursor-hover style query: stateless value of every study at `index`.
fn query_point(chart: &Chart, index: usize) -> Result<(), Report<AppError>> {
    let timestamp = chart
        .candles()
        .and_then(|set| set.candles().get(index))
        .map(|candle| candle.timestamp);

    for (id, study) in chart.studies() {
        let value = chart
            .point_value(id, index)
            .change_context(AppError::Chart)?;
        info!(
            study = %study.description(),
            index,
            timestamp = ?timestamp,
            value,
            "point value"
        );
    }
    Ok(())
}

async fn replay(chart: &mut Chart, feed: Arc<dyn CandleFeed>) -> Result<(), Report<AppError>> {
    let cancel = CancellationToken::new();
    let (tick_tx, mut tick_rx) = mpsc::channel::<Candle>(256);

    let feed_cancel = cancel.clone();
    let feed_handle = tokio::spawn(async move {
        if let Err(e) = feed.subscribe(tick_tx, feed_cancel).await {
            tracing::error!(error = ?e, "live replay failed");
        }
    });

    let mut appended = 0usize;
    let mut revised = 0usize;
    let mut rejected = 0usize;

    loop {
        tokio::select! {
            tick = tick_rx.recv() => {
                let Some(candle) = tick else { break };
                match chart.apply_tick(candle) {
                    Ok(TickKind::Appended) => appended += 1,
                    Ok(TickKind::Revised) => revised += 1,
                    Err(e) => {
                        rejected += 1;
                        warn!(error = ?e, "tick rejected");
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.change_context(AppError::Runtime)?;
                info!("ctrl+c received, stopping replay");
                cancel.cancel();
                break;
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), feed_handle).await;
    info!(appended, revised, rejected, "live replay stopped");
    Ok(())
}
