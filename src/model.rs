//! Wire payload and per-hour table row shapes.

use serde::Deserialize;

/// The JSON payload carried by a Kafka message. Unknown fields are ignored; `report.info` is
/// kept only so it can be logged, never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct Report {
    pub path: String,
    pub metadata: ReportMetadata,
    pub report: ReportBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportMetadata {
    pub cluster_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportBody {
    #[serde(default)]
    pub reports: Vec<RuleHit>,
    #[serde(default)]
    pub info: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleHit {
    pub rule_id: String,
}

/// One row of the `archives` table, deduped per hour bucket by its full tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveRow {
    pub cluster_id: String,
    pub collected_at_ms: i64,
    pub archive_path: String,
}

/// One row of the `rule_hits` table. Not deduped: one row per element of `report.reports`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHitRow {
    pub cluster_id: String,
    pub rule_id: String,
    pub collected_at_ms: i64,
    pub archive_path: String,
}

/// `collected_at_ms = floor(collected_at.unix_seconds) * 1000`.
pub fn collected_at_ms(collected_at: chrono::DateTime<chrono::Utc>) -> i64 {
    collected_at.timestamp() * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_report() {
        let raw = r#"{
            "path": "archives/compressed/aa/uuid/202101/20/031044.tar.gz",
            "metadata": {"cluster_id": "c1"},
            "report": {"reports": [{"rule_id": "r1"}, {"rule_id": "r2"}]}
        }"#;
        let report: Report = serde_json::from_str(raw).unwrap();
        assert_eq!(report.metadata.cluster_id, "c1");
        assert_eq!(report.report.reports.len(), 2);
        assert!(report.report.info.is_empty());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let raw = r#"{"path": "x"}"#;
        assert!(serde_json::from_str::<Report>(raw).is_err());
    }
}
