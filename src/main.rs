use archive_report_worker::aggregator::ReportAggregator;
use archive_report_worker::config::Config;
use archive_report_worker::consumer::Consumer;
use archive_report_worker::error::{AggregatorError, ConsumerError};
use archive_report_worker::metrics::{MetricsPusher, NoopPusher, PushgatewayPusher, WorkerMetrics};
use archive_report_worker::writer::S3ObjectStoreWriter;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,archive_report_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .expect("tracing subscriber already initialized");
}

async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::Region;

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.s3_region.clone()));
    if let Some(endpoint) = &config.s3_endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let shared_config = loader.load().await;
    aws_sdk_s3::Client::new(&shared_config)
}

/// Runs one bounded invocation and reports what failed, if anything, distinctly enough for
/// `main` to pick an exit code. `SIGINT`/`SIGTERM` during the run is treated as an abort: the
/// consumer drops without committing, matching the "never commit on a signal" contract.
enum RunResult {
    Success,
    ConfigError(anyhow::Error),
    ConsumerError(ConsumerError),
    WriterError(ConsumerError),
    MetricsError(anyhow::Error),
}

async fn run() -> RunResult {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => return RunResult::ConfigError(err),
    };

    let s3_client = build_s3_client(&config).await;
    let writer = Arc::new(S3ObjectStoreWriter::new(
        s3_client,
        config.s3_bucket.clone(),
        config.s3_prefix.clone(),
    ));
    let metrics = Arc::new(WorkerMetrics::new());
    let aggregator = Arc::new(ReportAggregator::new(metrics.clone()));

    let consumer = match Consumer::new(&config, aggregator, writer, metrics.clone()) {
        Ok(consumer) => Arc::new(consumer),
        Err(err) => return RunResult::ConsumerError(err),
    };

    let run_outcome = tokio::select! {
        outcome = consumer.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received; aborting without committing offsets");
            return RunResult::Success;
        }
    };

    let run_error = match run_outcome {
        Ok(outcome) => {
            tracing::info!(files_written = outcome.files_written, "run complete");
            None
        }
        Err(err) => Some(err),
    };

    let pusher: Arc<dyn MetricsPusher> = match &config.metrics_pushgateway_url {
        Some(url) => Arc::new(PushgatewayPusher::new(url.clone())),
        None => Arc::new(NoopPusher),
    };
    let metrics_result = pusher.push(&metrics).await;

    match (run_error, metrics_result) {
        (Some(err), _) => classify_consumer_error(err),
        (None, Ok(())) => RunResult::Success,
        (None, Err(err)) => RunResult::MetricsError(err),
    }
}

fn classify_consumer_error(err: ConsumerError) -> RunResult {
    match err {
        ConsumerError::Aggregator(AggregatorError::Writer { .. }) => RunResult::WriterError(err),
        other => RunResult::ConsumerError(other),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        RunResult::Success => ExitCode::from(0),
        RunResult::ConfigError(err) => {
            tracing::error!(error = %err, "configuration error");
            ExitCode::from(1)
        }
        RunResult::ConsumerError(err) => {
            tracing::error!(error = %err, "consumer error; offsets not committed");
            ExitCode::from(2)
        }
        RunResult::WriterError(err) => {
            tracing::error!(error = %err, "object store writer error; offsets not committed");
            ExitCode::from(3)
        }
        RunResult::MetricsError(err) => {
            tracing::warn!(error = %err, "failed to push metrics to pushgateway");
            ExitCode::from(4)
        }
    }
}
