// Metrics collection
// Bounded per-metric sample rings and host process sampling

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::models::{MetricAggregate, MetricSample, MetricType, PerformanceSnapshot};

/// Bounded sample history, one ring per metric name
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    capacity: usize,
    series: HashMap<String, VecDeque<MetricSample>>,
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: HashMap::new(),
        }
    }

    pub fn record(&mut self, name: &str, value: f64, metric_type: MetricType) {
        self.record_tagged(name, value, metric_type, HashMap::new());
    }

    pub fn record_tagged(
        &mut self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        tags: HashMap<String, String>,
    ) {
        let ring = self.series.entry(name.to_string()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(MetricSample {
            name: name.to_string(),
            value,
            metric_type,
            timestamp: Utc::now(),
            tags,
        });
    }

    /// Aggregate over the last `minutes`; `None` when no sample falls inside
    pub fn aggregated(&self, name: &str, minutes: i64) -> Option<MetricAggregate> {
        let since = Utc::now() - ChronoDuration::minutes(minutes);
        let values: Vec<f64> = self
            .series
            .get(name)?
            .iter()
            .filter(|s| s.timestamp >= since)
            .map(|s| s.value)
            .collect();

        let latest = *values.last()?;
        let sum: f64 = values.iter().sum();
        Some(MetricAggregate {
            count: values.len(),
            sum,
            avg: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            latest,
        })
    }

    /// Aggregates for every metric with samples inside the window
    pub fn aggregate_all(&self, minutes: i64) -> HashMap<String, MetricAggregate> {
        self.series
            .keys()
            .filter_map(|name| self.aggregated(name, minutes).map(|agg| (name.clone(), agg)))
            .collect()
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.series.get(name)?.back().map(|s| s.value)
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.keys().cloned().collect();
        names.sort();
        names
    }
}

/// CPU, memory and thread count of the current process
///
/// CPU usage is computed by sysinfo from the delta between two refreshes, so
/// the first sample after construction usually reads zero.
pub struct ProcessSampler {
    pid: Pid,
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let refresh_kind = Self::refresh_kind();
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_specifics(refresh_kind);

        Self {
            pid: Pid::from_u32(std::process::id()),
            system,
        }
    }

    fn refresh_kind() -> RefreshKind {
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_cpu().with_memory())
    }

    /// Refresh and read this process; `None` if it cannot be found
    pub fn sample(&mut self) -> Option<PerformanceSnapshot> {
        self.system.refresh_specifics(Self::refresh_kind());
        let process = self.system.process(self.pid)?;

        Some(PerformanceSnapshot {
            cpu_percent: process.cpu_usage() as f64,
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
            thread_count: process.tasks().map(|tasks| tasks.len()).unwrap_or(0),
            sampled_at: Some(Utc::now()),
        })
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}
