use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum StudyError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}

#[derive(Debug, Display, Error)]
pub enum ChartError {
    #[display("no study attached with id {id}")]
    UnknownStudy { id: String },
    #[display("tick is older than the last candle")]
    OutOfOrderTick,
    #[display("no candle set loaded")]
    NoCandles,
    #[display("study recompute failed")]
    Study,
}

#[derive(Debug, Display, Error)]
pub enum FeedError {
    #[display("failed to read candle file")]
    ReadFile,
    #[display("failed to parse candles: {reason}")]
    Parse { reason: String },
    #[display("candle at index {index} is not after its predecessor")]
    Unordered { index: usize },
    #[display("tick stream closed")]
    Stream,
}
