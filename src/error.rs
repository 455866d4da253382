use thiserror::Error;

/// Failure to extract a collection timestamp from an archive path.
#[derive(Debug, Error)]
pub enum PathParseError {
    #[error("path does not match the archive path pattern: {0}")]
    NoMatch(String),
    #[error("path {path} has an invalid calendar timestamp: {source}")]
    InvalidTimestamp {
        path: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Failure recorded while tracking or advancing a Kafka offset.
#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("partition {topic}-{partition} is already tracked")]
    AlreadyTracked { topic: String, partition: i32 },
    #[error("partition {topic}-{partition} has no recorded offset")]
    NotTracked { topic: String, partition: i32 },
    #[error(
        "negative lag on {topic}-{partition}: observed offset {observed} is behind cached offset {cached}"
    )]
    NegativeLag {
        topic: String,
        partition: i32,
        observed: i64,
        cached: i64,
    },
}

/// Failure while parsing or materializing reports in the aggregator.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("failed to parse report JSON: {0}")]
    InvalidReport(#[from] serde_json::Error),
    #[error("writer error while materializing table {table}: {source}")]
    Writer {
        table: &'static str,
        #[source]
        source: WriterError,
    },
}

/// Failure from the object store writer. `Fatal` variants require the caller to roll back any
/// files already written in the same batch.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to list prefix {prefix}: {message}")]
    List { prefix: String, message: String },
    #[error("failed to open file {path}: {message}")]
    Open { path: String, message: String },
    #[error("failed to encode row into {path}: {message}")]
    RowEncode { path: String, message: String },
    #[error("failed to close file {path}: {message}")]
    Close { path: String, message: String },
    #[error("failed to delete files: {message}")]
    Delete { message: String },
}

/// Failure raised by a Consumer partition worker or the supervising run loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Offset(#[from] OffsetError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("failed to commit offsets: {0}")]
    Commit(String),
}
