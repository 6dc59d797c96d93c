//! Metrics - export statistics
//!
//! Renders a [`StatsSummary`] for monitoring systems (Prometheus text
//! exposition or JSON).

use super::StatsSummary;
use indexmap::IndexMap;

/// Metric value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Counter(v) => *v as f64,
            MetricValue::Gauge(v) => *v,
        }
    }
}

impl StatsSummary {
    /// Metrics in a stable order
    pub fn to_metrics(&self) -> IndexMap<&'static str, MetricValue> {
        use MetricValue::{Counter, Gauge};
        let mut metrics = IndexMap::new();
        metrics.insert("brc_retains_local_total", Counter(self.retains_local));
        metrics.insert("brc_retains_remote_total", Counter(self.retains_remote));
        metrics.insert("brc_releases_local_total", Counter(self.releases_local));
        metrics.insert("brc_releases_remote_total", Counter(self.releases_remote));
        metrics.insert("brc_immortal_retains_total", Counter(self.immortal_retains));
        metrics.insert("brc_immortal_releases_total", Counter(self.immortal_releases));
        metrics.insert("brc_allocations_total", Counter(self.allocations));
        metrics.insert("brc_deallocations_total", Counter(self.deallocations));
        metrics.insert("brc_merges_total", Counter(self.merges));
        metrics.insert("brc_queued_total", Counter(self.queued));
        metrics.insert("brc_drained_total", Counter(self.drained));
        metrics.insert("brc_promotions_total", Counter(self.promotions));
        metrics.insert("brc_weakrefs_created_total", Counter(self.weakrefs_created));
        metrics.insert("brc_weakrefs_cleared_total", Counter(self.weakrefs_cleared));
        metrics.insert("brc_callbacks_invoked_total", Counter(self.callbacks_invoked));
        metrics.insert("brc_live_objects", Gauge(self.live_objects() as f64));
        metrics.insert("brc_live_threads", Gauge(self.live_threads as f64));
        metrics
    }

    /// Export to Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, value) in self.to_metrics() {
            let kind = match value {
                MetricValue::Counter(_) => "counter",
                MetricValue::Gauge(_) => "gauge",
            };
            output.push_str(&format!("# TYPE {} {}\n{} {}\n", name, kind, name, value.as_f64()));
        }
        output
    }

    /// Export to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_export() {
        let summary = StatsSummary {
            allocations: 3,
            deallocations: 1,
            ..Default::default()
        };
        let text = summary.to_prometheus();
        assert!(text.contains("# TYPE brc_allocations_total counter\nbrc_allocations_total 3\n"));
        assert!(text.contains("brc_live_objects 2\n"));
    }

    #[test]
    fn test_json_export() {
        let summary = StatsSummary {
            promotions: 4,
            ..Default::default()
        };
        let value: serde_json::Value = serde_json::from_str(&summary.to_json()).unwrap();
        assert_eq!(value["promotions"], 4);
        assert_eq!(value["live_threads"], 0);
    }

    #[test]
    fn test_metric_order_is_stable() {
        let metrics = StatsSummary::default().to_metrics();
        let first = metrics.keys().next().copied();
        assert_eq!(first, Some("brc_retains_local_total"));
        assert_eq!(metrics.len(), 17);
    }
}
