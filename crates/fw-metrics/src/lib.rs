use anyhow::Result;
use fw_nft::{ReconcileReport, TableStatus};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics for reconciliation passes
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Pass outcomes
    passes: IntCounterVec,
    mutations: IntCounterVec,
    rules_skipped: IntCounterVec,
    rules_failed: IntCounterVec,

    // Live object counts
    chains_count: IntGaugeVec,
    rules_count: IntGaugeVec,
    sets_count: IntGaugeVec,
    set_elements_count: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let passes = IntCounterVec::new(
            Opts::new(
                "fwsync_reconcile_passes_total",
                "Total reconciliation passes by outcome",
            ),
            &["table", "result"],
        )?;
        registry.register(Box::new(passes.clone()))?;

        let mutations = IntCounterVec::new(
            Opts::new(
                "fwsync_mutations_total",
                "Total kernel mutations committed by reconciliation",
            ),
            &["table", "kind"],
        )?;
        registry.register(Box::new(mutations.clone()))?;

        let rules_skipped = IntCounterVec::new(
            Opts::new(
                "fwsync_rules_skipped_total",
                "Total rules skipped because their kind is not compiled",
            ),
            &["table"],
        )?;
        registry.register(Box::new(rules_skipped.clone()))?;

        let rules_failed = IntCounterVec::new(
            Opts::new(
                "fwsync_rules_failed_total",
                "Total rules left out of a pass because they failed to compile",
            ),
            &["table"],
        )?;
        registry.register(Box::new(rules_failed.clone()))?;

        let chains_count = IntGaugeVec::new(
            Opts::new("fwsync_chains_count", "Number of live chains in the table"),
            &["table"],
        )?;
        registry.register(Box::new(chains_count.clone()))?;

        let rules_count = IntGaugeVec::new(
            Opts::new("fwsync_rules_count", "Number of live rules in the table"),
            &["table"],
        )?;
        registry.register(Box::new(rules_count.clone()))?;

        let sets_count = IntGaugeVec::new(
            Opts::new("fwsync_sets_count", "Number of live sets in the table"),
            &["table"],
        )?;
        registry.register(Box::new(sets_count.clone()))?;

        let set_elements_count = IntGaugeVec::new(
            Opts::new(
                "fwsync_set_elements_count",
                "Number of live set elements in the table",
            ),
            &["table"],
        )?;
        registry.register(Box::new(set_elements_count.clone()))?;

        Ok(Self {
            registry,
            passes,
            mutations,
            rules_skipped,
            rules_failed,
            chains_count,
            rules_count,
            sets_count,
            set_elements_count,
        })
    }

    /// Record a completed pass
    pub fn record_report(&self, report: &ReconcileReport) {
        let table = report.table.as_str();
        let result = if report.rules_failed > 0 {
            "partial"
        } else if report.is_noop() {
            "unchanged"
        } else {
            "changed"
        };
        self.passes.with_label_values(&[table, result]).inc();

        let counts = [
            ("table_created", usize::from(report.table_created)),
            ("chain_deleted", report.chains_deleted),
            ("chain_created", report.chains_created),
            ("chain_updated", report.chains_updated),
            ("rule_deleted", report.rules_deleted),
            ("rule_added", report.rules_added),
            ("set_deleted", report.sets_deleted),
            ("set_created", report.sets_created),
            ("set_updated", report.sets_updated),
        ];
        for (kind, count) in counts {
            if count > 0 {
                self.mutations
                    .with_label_values(&[table, kind])
                    .inc_by(count as u64);
            }
        }

        if report.rules_skipped > 0 {
            self.rules_skipped
                .with_label_values(&[table])
                .inc_by(report.rules_skipped as u64);
        }
        if report.rules_failed > 0 {
            self.rules_failed
                .with_label_values(&[table])
                .inc_by(report.rules_failed as u64);
        }
    }

    /// Record a pass that aborted
    pub fn record_failure(&self, table: &str) {
        self.passes.with_label_values(&[table, "failed"]).inc();
    }

    /// Update live object gauges
    pub fn update_table_status(&self, status: &TableStatus) {
        let table = status.name.as_str();
        self.chains_count
            .with_label_values(&[table])
            .set(status.chains as i64);
        self.rules_count
            .with_label_values(&[table])
            .set(status.rules as i64);
        self.sets_count
            .with_label_values(&[table])
            .set(status.sets as i64);
        self.set_elements_count
            .with_label_values(&[table])
            .set(status.elements as i64);
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
