//! Process-local counters for a single invocation, grouped the way the teacher's `IngestStats`
//! groups pipeline counters, plus an optional end-of-run push to a Prometheus pushgateway.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub messages_consumed: AtomicU64,
    pub messages_skipped_parse_error: AtomicU64,
    pub messages_skipped_duplicate: AtomicU64,
    pub offsets_committed: AtomicU64,
    pub files_written: AtomicU64,
    pub writer_rollbacks: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_parse_error(&self) {
        self.messages_skipped_parse_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_duplicate(&self) {
        self.messages_skipped_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offsets_committed(&self, count: u64) {
        self.offsets_committed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_files_written(&self, count: u64) {
        self.files_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.writer_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_text(&self) -> String {
        format!(
            "archive_report_worker_messages_consumed {}\n\
             archive_report_worker_messages_skipped_parse_error {}\n\
             archive_report_worker_messages_skipped_duplicate {}\n\
             archive_report_worker_offsets_committed {}\n\
             archive_report_worker_files_written {}\n\
             archive_report_worker_writer_rollbacks {}\n",
            self.messages_consumed.load(Ordering::Relaxed),
            self.messages_skipped_parse_error.load(Ordering::Relaxed),
            self.messages_skipped_duplicate.load(Ordering::Relaxed),
            self.offsets_committed.load(Ordering::Relaxed),
            self.files_written.load(Ordering::Relaxed),
            self.writer_rollbacks.load(Ordering::Relaxed),
        )
    }
}

/// Pushes a final metrics snapshot somewhere. Kept as a trait so tests can substitute a no-op
/// pusher instead of reaching out over the network.
#[async_trait]
pub trait MetricsPusher: Send + Sync {
    async fn push(&self, metrics: &WorkerMetrics) -> anyhow::Result<()>;
}

pub struct PushgatewayPusher {
    client: reqwest::Client,
    url: String,
}

impl PushgatewayPusher {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl MetricsPusher for PushgatewayPusher {
    async fn push(&self, metrics: &WorkerMetrics) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/metrics/job/archive_report_worker", self.url.trim_end_matches('/')))
            .body(metrics.snapshot_text())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("pushgateway returned status {}", response.status());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopPusher;

#[async_trait]
impl MetricsPusher for NoopPusher {
    async fn push(&self, _metrics: &WorkerMetrics) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_text_includes_every_counter() {
        let metrics = WorkerMetrics::new();
        metrics.record_consumed();
        metrics.record_files_written(3);
        let text = metrics.snapshot_text();
        assert!(text.contains("archive_report_worker_messages_consumed 1"));
        assert!(text.contains("archive_report_worker_files_written 3"));
    }

    #[tokio::test]
    async fn noop_pusher_always_succeeds() {
        let metrics = WorkerMetrics::new();
        NoopPusher.push(&metrics).await.unwrap();
    }
}
