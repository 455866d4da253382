use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/archive-report-worker/config.json";

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("WORKER_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileOverrides {
    #[serde(default)]
    kafka_brokers: Option<String>,
    #[serde(default)]
    kafka_topic: Option<String>,
    #[serde(default)]
    s3_bucket: Option<String>,
    #[serde(default)]
    s3_prefix: Option<String>,
    #[serde(default)]
    max_records: Option<u64>,
    #[serde(default)]
    time_shift_minutes: Option<i64>,
}

fn load_file_overrides() -> Option<FileOverrides> {
    let path = config_file_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read config file; using env defaults");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse config file; using env defaults");
            None
        }
    }
}

/// Security settings for the Kafka client transport, passed through to `rdkafka::ClientConfig`
/// without interpretation.
#[derive(Clone, Debug, Default)]
pub struct KafkaSecurity {
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_security: KafkaSecurity,

    pub s3_endpoint: Option<String>,
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub s3_region: String,

    pub time_shift_minutes: i64,
    pub max_records: u64,
    pub consumer_timeout_seconds: u64,

    pub metrics_pushgateway_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let overrides = load_file_overrides();

        let kafka_brokers = env::var("WORKER_KAFKA_BROKERS")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| ov.kafka_brokers.as_deref())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
            })
            .context("WORKER_KAFKA_BROKERS is required (or present as kafka_brokers in the config file)")?;

        let kafka_topic = env::var("WORKER_KAFKA_TOPIC")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| ov.kafka_topic.as_deref())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
            })
            .context("WORKER_KAFKA_TOPIC is required (or present as kafka_topic in the config file)")?;

        let kafka_group_id = env::var("WORKER_KAFKA_GROUP_ID")
            .unwrap_or_else(|_| "archive-report-worker".to_string());

        let kafka_security = KafkaSecurity {
            security_protocol: env::var("WORKER_KAFKA_SECURITY_PROTOCOL").ok(),
            sasl_mechanism: env::var("WORKER_KAFKA_SASL_MECHANISM").ok(),
            sasl_username: env::var("WORKER_KAFKA_SASL_USERNAME").ok(),
            sasl_password: env::var("WORKER_KAFKA_SASL_PASSWORD").ok(),
            ssl_ca_location: env::var("WORKER_KAFKA_SSL_CA_LOCATION").ok(),
        };

        let s3_endpoint = env::var("WORKER_S3_ENDPOINT").ok();
        let s3_bucket = env::var("WORKER_S3_BUCKET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| ov.s3_bucket.as_deref())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
            })
            .context("WORKER_S3_BUCKET is required (or present as s3_bucket in the config file)")?;
        let s3_prefix = env::var("WORKER_S3_PREFIX")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| overrides.as_ref().and_then(|ov| ov.s3_prefix.clone()))
            .unwrap_or_else(|| "reports".to_string());
        let s3_region = env::var("WORKER_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        let time_shift_minutes = env::var("WORKER_TIME_SHIFT_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .or_else(|| overrides.as_ref().and_then(|ov| ov.time_shift_minutes))
            .unwrap_or(0);
        let max_records = env::var("WORKER_MAX_RECORDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .or_else(|| overrides.as_ref().and_then(|ov| ov.max_records))
            .unwrap_or(10_000);
        let consumer_timeout_seconds = env::var("WORKER_CONSUMER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(120);

        let metrics_pushgateway_url = env::var("WORKER_METRICS_PUSHGATEWAY_URL").ok();

        Ok(Self {
            kafka_brokers,
            kafka_topic,
            kafka_group_id,
            kafka_security,
            s3_endpoint,
            s3_bucket,
            s3_prefix,
            s3_region,
            time_shift_minutes,
            max_records,
            consumer_timeout_seconds,
            metrics_pushgateway_url,
        })
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_timeout_seconds)
    }
}
