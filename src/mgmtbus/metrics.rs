use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::{config::MineMeldConfig, mgmtbus::NodeStateInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic per-node statistic; the collector derives rates.
    Counter,
    Gauge,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: i64,
    /// ms since epoch
    pub timestamp: u64,
}

/// Sink for graph metrics. The wire format is the implementor's business.
pub trait MetricsCollector: Send + Sync + 'static {
    fn put_values(&self, samples: Vec<MetricSample>);
}

pub struct NullCollector;

impl MetricsCollector for NullCollector {
    fn put_values(&self, _samples: Vec<MetricSample>) {}
}

/// Keeps every sample; handy for tests and the status endpoint.
#[derive(Default)]
pub struct MemoryCollector {
    samples: Mutex<Vec<MetricSample>>,
}

impl MemoryCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.samples
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map(|s| s.value)
    }
}

impl MetricsCollector for MemoryCollector {
    fn put_values(&self, samples: Vec<MetricSample>) {
        self.samples
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(samples);
    }
}

/// `miners` have no inputs, `outputs` have the output flag off, the rest
/// are `processors`.
pub fn category(config: &MineMeldConfig, node: &str) -> Option<&'static str> {
    let n = config.nodes.get(node)?;
    Some(if n.inputs.is_empty() {
        "miners"
    } else if !n.output {
        "outputs"
    } else {
        "processors"
    })
}

/// Per-node counters and length gauges, plus per-category sums.
pub fn aggregate_metrics(
    config: &MineMeldConfig,
    status: &BTreeMap<String, NodeStateInfo>,
    timestamp: u64,
) -> Vec<MetricSample> {
    let sample = |name: String, kind: MetricKind, value: i64| MetricSample {
        name,
        kind,
        value,
        timestamp,
    };

    let mut out = Vec::new();
    let mut sums: BTreeMap<&'static str, (i64, BTreeMap<&str, i64>)> = BTreeMap::new();

    for (node, info) in status {
        for (stat, value) in &info.statistics {
            out.push(sample(
                format!("minemeld.{node}.{stat}"),
                MetricKind::Counter,
                *value,
            ));
        }
        out.push(sample(
            format!("minemeld.{node}.length"),
            MetricKind::Gauge,
            info.length as i64,
        ));

        let Some(cat) = category(config, node) else {
            continue;
        };
        let (length, stats) = sums.entry(cat).or_default();
        *length += info.length as i64;
        for (stat, value) in &info.statistics {
            *stats.entry(stat.as_str()).or_default() += *value;
        }
    }

    for (cat, (length, stats)) in sums {
        for (stat, value) in stats {
            out.push(sample(
                format!("minemeld.{cat}.{stat}"),
                MetricKind::Counter,
                value,
            ));
        }
        out.push(sample(
            format!("minemeld.{cat}.length"),
            MetricKind::Gauge,
            length,
        ));
    }
    out
}
