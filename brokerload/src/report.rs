//! Operator-facing output: status lines, the final summary and JSON export.

use crate::config::RunConfig;
use crate::measurer::RateRange;
use crate::metrics::{IntegrityEntry, Snapshot};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use uuid::Uuid;

/// How many keys the summary lists as worst offenders
pub const WORST_KEYS_LIMIT: usize = 5;

/// Renders elapsed time, counters, throughput and latency on one line.
pub fn status_line(snap: &Snapshot) -> String {
    format!(
        "[{:>6.1}s] sent={} recv={} err={} tx={:.1}/s rx={:.1}/s \
         p50={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms (n={})",
        snap.elapsed_sec,
        snap.messages_sent,
        snap.messages_received,
        snap.errors,
        snap.throughput_sent,
        snap.throughput_recv,
        snap.latency_p50_ms,
        snap.latency_p95_ms,
        snap.latency_p99_ms,
        snap.latency_max_ms,
        snap.latency_samples
    )
}

/// Integrity keys split by SLA outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaSummary {
    pub in_sla: usize,
    pub out_sla: usize,
    pub total: usize,
}

pub fn classify_sla(entries: &[IntegrityEntry]) -> SlaSummary {
    let in_sla = entries.iter().filter(|e| e.in_sla()).count();
    SlaSummary {
        in_sla,
        out_sla: entries.len() - in_sla,
        total: entries.len(),
    }
}

/// Up to `limit` keys ordered by loss, then duplicates, both descending.
///
/// Clean keys sort last, and the list stops at the first one.
pub fn worst_keys(entries: &[IntegrityEntry], limit: usize) -> Vec<&IntegrityEntry> {
    let mut ranked: Vec<&IntegrityEntry> = entries.iter().collect();
    ranked.sort_by(|a, b| {
        b.loss
            .cmp(&a.loss)
            .then_with(|| b.duplicates.cmp(&a.duplicates))
    });
    ranked
        .into_iter()
        .take(limit)
        .take_while(|e| !e.in_sla())
        .collect()
}

/// Builds the end-of-run summary, troubleshooting hints included.
pub fn render_summary(cfg: &RunConfig, snap: &Snapshot, rates: &RateRange) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== FINAL RESULTS: {} ===", cfg.test_name);
    let _ = writeln!(out, "Duration:        {:.1}s", snap.elapsed_sec);
    let _ = writeln!(
        out,
        "Messages:        sent={} received={} errors={}",
        snap.messages_sent, snap.messages_received, snap.errors
    );
    let _ = writeln!(
        out,
        "Throughput:      tx={:.1} msg/s rx={:.1} msg/s (rx interval min: {:.1}, max: {:.1})",
        snap.throughput_sent, snap.throughput_recv, rates.min_rx, rates.max_rx
    );
    let _ = writeln!(
        out,
        "Latency:         p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms ({} samples)",
        snap.latency_p50_ms,
        snap.latency_p95_ms,
        snap.latency_p99_ms,
        snap.latency_max_ms,
        snap.latency_samples
    );
    let _ = writeln!(
        out,
        "Integrity:       duplicates={} estimated_loss={}",
        snap.duplicates, snap.estimated_loss
    );

    let sla = classify_sla(&snap.integrity_breakdown);
    if sla.total > 0 {
        let _ = writeln!(
            out,
            "SLA:             {}/{} keys in SLA ({} out)",
            sla.in_sla, sla.total, sla.out_sla
        );
        let worst = worst_keys(&snap.integrity_breakdown, WORST_KEYS_LIMIT);
        if !worst.is_empty() {
            let _ = writeln!(out, "Worst keys:");
            for e in worst {
                let _ = writeln!(
                    out,
                    "  {} / {} / {}: loss={} duplicates={} seq=[{}..{}] unique={}",
                    e.topic, e.subscription, e.producer, e.loss, e.duplicates, e.min, e.max, e.unique_seen
                );
            }
        }
    }

    render_troubleshooting(&mut out, cfg, snap);
    out
}

fn render_troubleshooting(out: &mut String, cfg: &RunConfig, snap: &Snapshot) {
    let url = &cfg.broker.service_url;
    if snap.messages_sent == 0 && cfg.total_producers() > 0 {
        let _ = writeln!(out, "\nCRITICAL: No messages were sent by producers!");
        let _ = writeln!(out, "  - Verify the service url: {}", url);
        let _ = writeln!(out, "  - Check the error counter and warnings above for send failures");
        let _ = writeln!(out, "  - Make sure the run lasted long enough for the first send");
    } else if snap.messages_received == 0 && cfg.total_consumers() > 0 {
        let _ = writeln!(out, "\nCRITICAL: No messages were received by consumers!");
        let _ = writeln!(out, "  - Verify the service url: {}", url);
        let _ = writeln!(out, "  - Consumers start after producers; very short runs may end first");
        let _ = writeln!(out, "  - Subscriptions start at the latest message, check topic and subscription names");
        let _ = writeln!(out, "  - Check warnings above for subscribe errors");
    }
}

/// Producer/consumer/topic counts carried in the export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub producers: usize,
    pub consumers: usize,
    pub topics: usize,
}

/// Persisted result of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub run_id: Uuid,
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub service_url: String,
    pub duration_sec: f64,
    pub snapshot: Snapshot,
    pub config_summary: ConfigSummary,
}

impl ExportDocument {
    pub fn new(cfg: &RunConfig, snap: &Snapshot) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            test_name: cfg.test_name.clone(),
            description: cfg.description.clone(),
            service_url: cfg.broker.service_url.clone(),
            duration_sec: snap.elapsed_sec,
            snapshot: snap.clone(),
            config_summary: ConfigSummary {
                producers: cfg.total_producers(),
                consumers: cfg.total_consumers(),
                topics: cfg.topics.len(),
            },
        }
    }
}

/// Writes the export file if `metrics.export_path` is set
///
/// Failures are logged and reported as `None`; they never fail the run.
pub fn export_results(cfg: &RunConfig, snap: &Snapshot) -> Option<PathBuf> {
    let dir = cfg.metrics.export_path.as_deref()?;
    match write_export(Path::new(dir), &ExportDocument::new(cfg, snap)) {
        Ok(path) => {
            info!("Results exported to {}", path.display());
            Some(path)
        }
        Err(e) => {
            error!("Failed to export results to {}: {:#}", dir, e);
            None
        }
    }
}

fn write_export(dir: &Path, doc: &ExportDocument) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create export dir {}", dir.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("{}_{}.json", file_stem(&doc.test_name), stamp));
    let body = serde_json::to_string_pretty(doc).context("encode export document")?;
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Keeps test names usable as file names.
fn file_stem(test_name: &str) -> String {
    test_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::VALID;

    fn entry(producer: &str, loss: u64, duplicates: u64) -> IntegrityEntry {
        IntegrityEntry {
            topic: "/default/test".to_string(),
            subscription: "sub".to_string(),
            producer: producer.to_string(),
            min: 1,
            max: 10,
            unique_seen: 10 - loss,
            loss,
            duplicates,
        }
    }

    fn config() -> RunConfig {
        RunConfig::from_yaml(VALID).unwrap()
    }

    #[test]
    fn test_status_line_fields() {
        let snap = Snapshot {
            elapsed_sec: 2.0,
            messages_sent: 300,
            messages_received: 280,
            errors: 1,
            throughput_sent: 150.0,
            throughput_recv: 140.0,
            latency_p50_ms: 1.5,
            latency_samples: 280,
            ..Snapshot::default()
        };
        let line = status_line(&snap);
        assert!(line.contains("sent=300"));
        assert!(line.contains("recv=280"));
        assert!(line.contains("err=1"));
        assert!(line.contains("tx=150.0/s"));
        assert!(line.contains("p50=1.5ms"));
        assert!(line.contains("(n=280)"));
    }

    #[test]
    fn test_classify_sla() {
        let entries = vec![entry("a", 0, 0), entry("b", 2, 0), entry("c", 0, 1)];
        assert_eq!(
            classify_sla(&entries),
            SlaSummary {
                in_sla: 1,
                out_sla: 2,
                total: 3
            }
        );
        assert_eq!(classify_sla(&[]), SlaSummary::default());
    }

    #[test]
    fn test_worst_keys_ordering_and_cutoff() {
        let entries = vec![
            entry("clean", 0, 0),
            entry("dups", 0, 4),
            entry("loss1", 1, 0),
            entry("loss3", 3, 0),
            entry("loss3dup", 3, 2),
        ];
        let worst: Vec<_> = worst_keys(&entries, WORST_KEYS_LIMIT)
            .into_iter()
            .map(|e| e.producer.as_str())
            .collect();
        assert_eq!(worst, ["loss3dup", "loss3", "loss1", "dups"]);
    }

    #[test]
    fn test_worst_keys_respects_limit() {
        let entries: Vec<_> = (1..=8).map(|i| entry(&format!("p-{i}"), i, 0)).collect();
        let worst = worst_keys(&entries, WORST_KEYS_LIMIT);
        assert_eq!(worst.len(), 5);
        assert_eq!(worst[0].producer, "p-8");
        assert!(worst_keys(&[entry("clean", 0, 0)], WORST_KEYS_LIMIT).is_empty());
    }

    #[test]
    fn test_summary_includes_sla_and_hints() {
        let cfg = config();
        let snap = Snapshot {
            messages_sent: 10,
            integrity_breakdown: vec![entry("p-0", 0, 0), entry("p-1", 2, 0)],
            ..Snapshot::default()
        };
        let text = render_summary(&cfg, &snap, &RateRange::default());
        assert!(text.contains("1/2 keys in SLA (1 out)"));
        assert!(text.contains("p-1: loss=2"));
        assert!(text.contains("No messages were received"));

        let idle = render_summary(&cfg, &Snapshot::default(), &RateRange::default());
        assert!(idle.contains("No messages were sent"));
        assert!(!idle.contains("SLA:"));
    }

    #[test]
    fn test_export_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.test_name = "unit run/1".to_string();
        cfg.description = None;
        cfg.metrics.export_path = Some(dir.path().join("results").display().to_string());
        let snap = Snapshot {
            elapsed_sec: 2.5,
            messages_sent: 42,
            ..Snapshot::default()
        };

        let path = export_results(&cfg, &snap).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("unit_run_1_"), "{name}");
        assert!(name.ends_with(".json"));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains('\n'));
        let doc: ExportDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc.test_name, "unit run/1");
        assert_eq!(doc.service_url, "memory://local");
        assert_eq!(doc.duration_sec, 2.5);
        assert_eq!(doc.snapshot, snap);
        assert_eq!(
            doc.config_summary,
            ConfigSummary {
                producers: 3,
                consumers: 3,
                topics: 2
            }
        );

        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("description").is_none());
        assert!(value["run_id"].is_string());
    }

    #[test]
    fn test_export_skipped_without_path() {
        let cfg = config();
        assert!(export_results(&cfg, &Snapshot::default()).is_none());
    }

    #[test]
    fn test_export_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();
        let mut cfg = config();
        cfg.metrics.export_path = Some(blocker.display().to_string());
        assert!(export_results(&cfg, &Snapshot::default()).is_none());
    }
}
