use std::path::Path;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::Frequency;
use crate::study::StudyKind;

const MAX_DECIMALS: u32 = 10;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_decimals() -> u32 {
    2
}

fn default_frequency() -> String {
    "1d".into()
}

fn default_ticks_per_second() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    pub feed: FeedConfig,
    #[serde(default)]
    pub studies: Vec<StudyConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedConfig {
    /// JSON file holding an array of candles in ascending time order.
    pub path: String,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default = "default_frequency")]
    pub frequency: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Trailing candles withheld from the initial load and replayed as live ticks.
    #[serde(default)]
    pub live_candles: usize,
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u32,
    /// Replay each live candle as a forming bar followed by its final revision.
    #[serde(default = "default_true")]
    pub intrabar_ticks: bool,
}

#[derive(Debug, Deserialize)]
pub struct StudyConfig {
    pub kind: String,
    pub periods: Option<usize>,
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_log_format(config)?;
    validate_feed(&config.feed)?;
    validate_studies(config)?;
    Ok(())
}

fn validation(field: String) -> Report<ConfigError> {
    Report::new(ConfigError::Validation { field })
}

fn validate_log_format(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    match config.general.log_format.as_str() {
        "text" | "json" => Ok(()),
        other => Err(validation(format!(
            "general.log_format \"{other}\" must be \"text\" or \"json\""
        ))),
    }
}

fn validate_feed(feed: &FeedConfig) -> Result<(), Report<ConfigError>> {
    if Frequency::from_str(&feed.frequency).is_none() {
        return Err(validation(format!(
            "feed.frequency: unknown frequency \"{}\"",
            feed.frequency
        )));
    }
    if feed.decimals > MAX_DECIMALS {
        return Err(validation(format!(
            "feed.decimals {} exceeds {MAX_DECIMALS}",
            feed.decimals
        )));
    }
    if feed.ticks_per_second == 0 {
        return Err(validation("feed.ticks_per_second must be > 0".into()));
    }
    if let (Some(start), Some(end)) = (feed.start_time, feed.end_time) {
        if start > end {
            return Err(validation(format!(
                "feed.start_time {start} is after feed.end_time {end}"
            )));
        }
    }
    Ok(())
}

fn validate_studies(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.studies.is_empty() {
        return Err(validation("studies: at least one study is required".into()));
    }
    for (i, study) in config.studies.iter().enumerate() {
        if StudyKind::from_str(&study.kind).is_none() {
            let known: Vec<&str> = StudyKind::ALL.iter().map(|k| k.as_str()).collect();
            return Err(validation(format!(
                "studies[{i}].kind: unknown study \"{}\" (expected one of {})",
                study.kind,
                known.join(", ")
            )));
        }
        if study.periods == Some(0) {
            return Err(validation(format!("studies[{i}].periods must be > 0")));
        }
    }
    Ok(())
}
