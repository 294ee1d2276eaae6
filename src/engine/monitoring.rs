// Instance Monitoring System
// Per-instance performance sampling, health checkers, diagnostics, tracing
// and auto-recovery

//! # Instance Monitoring System
//!
//! Each registered instance gets a monitor holding a weak handle to the
//! instance, a [`MetricsCollector`], the latest [`PerformanceSnapshot`] and
//! the latest result of every health checker, keyed by checker name.
//!
//! One monitoring cycle:
//!
//! 1. drops monitors whose instance has been dropped by its owner
//! 2. samples monitors at least `monitoring_interval` old
//! 3. runs every [`HealthChecker`] on monitors whose `health_check_interval`
//!    has elapsed and folds the results with [`HealthStatus::aggregate`]
//! 4. hands a [`MonitorSnapshot`] to each diagnostic rule
//! 5. calls `recover()` on UNHEALTHY instances that support it
//!
//! Checkers, rules, callbacks and instance capabilities run with no lock held.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitoringConfig;
use crate::engine::metrics::{MetricsCollector, ProcessSampler};
use crate::engine::spans::TracingManager;
use crate::models::{
    CallSpan, DiagnosticEvent, HealthCheckOutcome, HealthCheckResult, HealthStatus,
    InstanceHealthReport, ManagedInstance, MetricAggregate, MetricType, MonitoringStats,
    PerformanceSnapshot, SeverityLevel, SpanStatus, SystemOverview,
};
use crate::Result;

/// What a health checker gets to look at
pub struct CheckTarget<'a> {
    pub instance_id: &'a str,
    pub instance: &'a dyn ManagedInstance,
    pub performance: &'a PerformanceSnapshot,
}

/// A named health check run against every monitored instance
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `None` when the check does not apply to this instance
    async fn check(&self, target: &CheckTarget<'_>) -> Option<HealthCheckOutcome>;
}

struct FnChecker<F>(F);

#[async_trait]
impl<F, O> HealthChecker for FnChecker<F>
where
    F: Fn(&str) -> O + Send + Sync,
    O: Into<HealthCheckOutcome>,
{
    async fn check(&self, target: &CheckTarget<'_>) -> Option<HealthCheckOutcome> {
        Some((self.0)(target.instance_id).into())
    }
}

/// Process CPU check: degraded above the first threshold, unhealthy above
/// the second
pub struct ProcessCpuChecker {
    pub degraded_percent: f64,
    pub unhealthy_percent: f64,
}

#[async_trait]
impl HealthChecker for ProcessCpuChecker {
    async fn check(&self, target: &CheckTarget<'_>) -> Option<HealthCheckOutcome> {
        target.performance.sampled_at?;
        let cpu = target.performance.cpu_percent;
        let outcome = if cpu > self.unhealthy_percent {
            HealthCheckOutcome::new(HealthStatus::Unhealthy, format!("CPU usage {:.1}% is critical", cpu), 0.0)
        } else if cpu > self.degraded_percent {
            HealthCheckOutcome::new(HealthStatus::Degraded, format!("CPU usage {:.1}% is high", cpu), 0.0)
        } else {
            HealthCheckOutcome::new(HealthStatus::Healthy, format!("CPU usage {:.1}%", cpu), 0.0)
        };
        Some(outcome)
    }
}

/// Runs the instance's own `health_check()` when it has one
pub struct InstanceProbeChecker;

#[async_trait]
impl HealthChecker for InstanceProbeChecker {
    async fn check(&self, target: &CheckTarget<'_>) -> Option<HealthCheckOutcome> {
        let probe = target.instance.as_health_check()?;
        let started = Instant::now();
        let result = probe.health_check().await;
        let latency = started.elapsed().as_secs_f64() * 1000.0;

        Some(match result {
            Ok(true) => HealthCheckOutcome::new(HealthStatus::Healthy, "probe passed", latency),
            Ok(false) => HealthCheckOutcome::new(HealthStatus::Unhealthy, "probe reported failure", latency),
            Err(e) => HealthCheckOutcome::new(HealthStatus::Unhealthy, format!("probe failed: {}", e), latency),
        })
    }
}

/// Read-only view of one monitor handed to diagnostic rules
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub instance_id: String,
    pub overall_health: HealthStatus,
    pub health_checks: HashMap<String, HealthCheckResult>,
    pub performance: PerformanceSnapshot,
    pub metrics: HashMap<String, MetricAggregate>,
}

/// Inspects a monitor and returns one message per issue found
pub type DiagnosticRule = Arc<dyn Fn(&MonitorSnapshot) -> Vec<String> + Send + Sync>;

pub type EventCallback = Arc<dyn Fn(&DiagnosticEvent) + Send + Sync>;

struct InstanceMonitor {
    instance: Weak<dyn ManagedInstance>,
    metrics: MetricsCollector,
    performance: PerformanceSnapshot,
    health_checks: HashMap<String, HealthCheckResult>,
    overall_health: HealthStatus,
    last_sample: Option<Instant>,
    last_health_check: Option<Instant>,
    last_check_at: Option<DateTime<Utc>>,
}

impl InstanceMonitor {
    fn snapshot(&self, instance_id: &str) -> MonitorSnapshot {
        MonitorSnapshot {
            instance_id: instance_id.to_string(),
            overall_health: self.overall_health,
            health_checks: self.health_checks.clone(),
            performance: self.performance.clone(),
            metrics: self.metrics.aggregate_all(60),
        }
    }
}

struct DueMonitor {
    instance_id: String,
    instance: Arc<dyn ManagedInstance>,
    run_health: bool,
}

struct MonitoringState {
    monitors: HashMap<String, InstanceMonitor>,
    events: VecDeque<DiagnosticEvent>,
    tracing: TracingManager,
    total_health_checks: u64,
    total_diagnostic_events: u64,
    last_cycle: Option<DateTime<Utc>>,
}

/// Health, metrics and tracing for registered instances
#[derive(Clone)]
pub struct InstanceMonitoringSystem {
    config: MonitoringConfig,
    state: Arc<RwLock<MonitoringState>>,
    checkers: Arc<RwLock<BTreeMap<String, Arc<dyn HealthChecker>>>>,
    rules: Arc<RwLock<Vec<DiagnosticRule>>>,
    callbacks: Arc<RwLock<Vec<EventCallback>>>,
    sampler: Arc<Mutex<ProcessSampler>>,
    cancel: CancellationToken,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl InstanceMonitoringSystem {
    pub fn new(config: MonitoringConfig) -> Self {
        let mut checkers: BTreeMap<String, Arc<dyn HealthChecker>> = BTreeMap::new();
        if config.install_default_checkers {
            checkers.insert(
                "basic".to_string(),
                Arc::new(ProcessCpuChecker {
                    degraded_percent: config.cpu_degraded_percent,
                    unhealthy_percent: config.cpu_unhealthy_percent,
                }),
            );
            checkers.insert("instance_probe".to_string(), Arc::new(InstanceProbeChecker));
        }

        let state = MonitoringState {
            monitors: HashMap::new(),
            events: VecDeque::new(),
            tracing: TracingManager::new(config.span_capacity),
            total_health_checks: 0,
            total_diagnostic_events: 0,
            last_cycle: None,
        };

        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            checkers: Arc::new(RwLock::new(checkers)),
            rules: Arc::new(RwLock::new(Vec::new())),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            sampler: Arc::new(Mutex::new(ProcessSampler::new())),
            cancel: CancellationToken::new(),
            monitor_task: Arc::new(Mutex::new(None)),
        }
    }

    //===============================================================
    // Registration
    //===============================================================

    /// Start monitoring an instance; an existing monitor for the id is kept
    pub async fn register_instance(&self, instance_id: &str, instance: &Arc<dyn ManagedInstance>) -> bool {
        let mut state = self.state.write().await;
        if state.monitors.contains_key(instance_id) {
            debug!("Instance {} is already monitored", instance_id);
            return false;
        }
        state.monitors.insert(
            instance_id.to_string(),
            InstanceMonitor {
                instance: Arc::downgrade(instance),
                metrics: MetricsCollector::new(self.config.metric_capacity),
                performance: PerformanceSnapshot::default(),
                health_checks: HashMap::new(),
                overall_health: HealthStatus::Unknown,
                last_sample: None,
                last_health_check: None,
                last_check_at: None,
            },
        );
        info!("Monitoring instance {}", instance_id);
        true
    }

    pub async fn unregister_instance(&self, instance_id: &str) -> bool {
        let removed = self.state.write().await.monitors.remove(instance_id).is_some();
        if removed {
            info!("Stopped monitoring instance {}", instance_id);
        }
        removed
    }

    pub async fn is_monitored(&self, instance_id: &str) -> bool {
        self.state.read().await.monitors.contains_key(instance_id)
    }

    pub async fn register_health_checker(&self, name: &str, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.insert(name.to_string(), checker);
        debug!("Registered health checker '{}'", name);
    }

    /// Register a closure `instance_id -> (status, message, latency_ms)`
    pub async fn register_health_checker_fn<F, O>(&self, name: &str, checker: F)
    where
        F: Fn(&str) -> O + Send + Sync + 'static,
        O: Into<HealthCheckOutcome> + 'static,
    {
        self.register_health_checker(name, Arc::new(FnChecker(checker)))
            .await;
    }

    pub async fn unregister_health_checker(&self, name: &str) -> bool {
        self.checkers.write().await.remove(name).is_some()
    }

    pub async fn add_diagnostic_rule<F>(&self, rule: F)
    where
        F: Fn(&MonitorSnapshot) -> Vec<String> + Send + Sync + 'static,
    {
        self.rules.write().await.push(Arc::new(rule));
    }

    /// Called for every recorded diagnostic event
    pub async fn add_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&DiagnosticEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().await.push(Arc::new(callback));
    }

    //===============================================================
    // Metrics and events
    //===============================================================

    pub async fn record_metric(
        &self,
        instance_id: &str,
        name: &str,
        value: f64,
        metric_type: MetricType,
    ) -> bool {
        let mut state = self.state.write().await;
        match state.monitors.get_mut(instance_id) {
            Some(monitor) => {
                monitor.metrics.record(name, value, metric_type);
                true
            }
            None => false,
        }
    }

    /// Append to the event ring and notify callbacks
    pub async fn record_event(&self, event: DiagnosticEvent) {
        {
            let mut state = self.state.write().await;
            if state.events.len() >= self.config.diagnostic_capacity.max(1) {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());
            state.total_diagnostic_events += 1;
        }

        match event.severity {
            SeverityLevel::High | SeverityLevel::Critical => warn!(
                "[{}] {}: {}",
                event.instance_id, event.event_type, event.message
            ),
            _ => debug!(
                "[{}] {}: {}",
                event.instance_id, event.event_type, event.message
            ),
        }

        let callbacks = self.callbacks.read().await.clone();
        for callback in &callbacks {
            callback(&event);
        }
    }

    /// Recent events, newest last
    pub async fn get_diagnostic_events(
        &self,
        instance_id: Option<&str>,
        min_severity: Option<SeverityLevel>,
        limit: usize,
    ) -> Vec<DiagnosticEvent> {
        let state = self.state.read().await;
        let matching: Vec<DiagnosticEvent> = state
            .events
            .iter()
            .filter(|e| instance_id.map_or(true, |id| e.instance_id == id))
            .filter(|e| min_severity.map_or(true, |s| e.severity >= s))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    //===============================================================
    // Tracing
    //===============================================================

    pub async fn create_span(
        &self,
        operation_name: &str,
        instance_id: &str,
        trace_id: Option<&str>,
        parent_span_id: Option<&str>,
    ) -> CallSpan {
        self.state
            .write()
            .await
            .tracing
            .create_span(operation_name, instance_id, trace_id, parent_span_id)
    }

    pub async fn finish_span(&self, span_id: &str, status: SpanStatus, error: Option<String>) -> Option<CallSpan> {
        let finished = self
            .state
            .write()
            .await
            .tracing
            .finish_span(span_id, status, error);
        if finished.is_none() {
            debug!("Span {} is unknown or already finished", span_id);
        }
        finished
    }

    pub async fn tag_span(&self, span_id: &str, key: &str, value: &str) -> bool {
        self.state.write().await.tracing.tag_span(span_id, key, value)
    }

    pub async fn get_span(&self, span_id: &str) -> Option<CallSpan> {
        self.state.read().await.tracing.get_span(span_id)
    }

    /// All spans of a trace in start order, including unfinished ones
    pub async fn get_trace(&self, trace_id: &str) -> Vec<CallSpan> {
        self.state.read().await.tracing.get_trace(trace_id)
    }

    /// Run `fut` inside a span that ends `ok` or `error` with its result
    pub async fn traced<T, F>(
        &self,
        operation_name: &str,
        instance_id: &str,
        parent_span_id: Option<&str>,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = self
            .create_span(operation_name, instance_id, None, parent_span_id)
            .await;
        let result = fut.await;

        let finished = match &result {
            Ok(_) => self.finish_span(&span.span_id, SpanStatus::Ok, None).await,
            Err(e) => {
                self.finish_span(&span.span_id, SpanStatus::Error, Some(e.to_string()))
                    .await
            }
        };
        if let Some(duration) = finished.and_then(|s| s.duration_ms) {
            self.record_metric(instance_id, "call_duration_ms", duration, MetricType::Timer)
                .await;
        }
        result
    }

    //===============================================================
    // Monitoring cycle
    //===============================================================

    /// One monitoring tick over every registered instance
    pub async fn run_monitoring_cycle(&self) {
        let due = self.collect_due().await;
        if due.is_empty() {
            self.state.write().await.last_cycle = Some(Utc::now());
            return;
        }

        let sample = self.sampler.lock().await.sample();
        if sample.is_none() {
            error!("Could not sample process performance");
        }

        for entry in due {
            let performance = self.store_sample(&entry.instance_id, sample.as_ref()).await;

            if entry.run_health {
                self.run_health_checks(&entry, &performance).await;
            }

            let Some(snapshot) = self.snapshot(&entry.instance_id).await else {
                continue;
            };
            self.apply_rules(&snapshot).await;

            if snapshot.overall_health == HealthStatus::Unhealthy && self.config.auto_recovery {
                self.attempt_recovery(&entry.instance_id, entry.instance.as_ref())
                    .await;
            }
        }

        self.state.write().await.last_cycle = Some(Utc::now());
    }

    /// Drop dead monitors and pick the ones due for sampling
    async fn collect_due(&self) -> Vec<DueMonitor> {
        let now = Instant::now();
        let sample_every = self.config.monitoring_interval();
        let check_every = self.config.health_check_interval();

        let mut state = self.state.write().await;
        let mut dead = Vec::new();
        let mut due = Vec::new();

        for (instance_id, monitor) in &state.monitors {
            let Some(instance) = monitor.instance.upgrade() else {
                dead.push(instance_id.clone());
                continue;
            };
            if !elapsed(monitor.last_sample, now, sample_every) {
                continue;
            }
            due.push(DueMonitor {
                instance_id: instance_id.clone(),
                instance,
                run_health: elapsed(monitor.last_health_check, now, check_every),
            });
        }

        for instance_id in dead {
            warn!("Instance {} was dropped while monitored, unregistering", instance_id);
            state.monitors.remove(&instance_id);
        }
        due.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        due
    }

    async fn store_sample(&self, instance_id: &str, sample: Option<&PerformanceSnapshot>) -> PerformanceSnapshot {
        let mut state = self.state.write().await;
        let Some(monitor) = state.monitors.get_mut(instance_id) else {
            return PerformanceSnapshot::default();
        };
        monitor.last_sample = Some(Instant::now());
        if let Some(sample) = sample {
            monitor.metrics.record("cpu_percent", sample.cpu_percent, MetricType::Gauge);
            monitor.metrics.record("memory_mb", sample.memory_mb, MetricType::Gauge);
            monitor
                .metrics
                .record("thread_count", sample.thread_count as f64, MetricType::Gauge);
            monitor.performance = sample.clone();
        }
        monitor.performance.clone()
    }

    async fn run_health_checks(&self, entry: &DueMonitor, performance: &PerformanceSnapshot) {
        let checkers: Vec<(String, Arc<dyn HealthChecker>)> = self
            .checkers
            .read()
            .await
            .iter()
            .map(|(name, checker)| (name.clone(), checker.clone()))
            .collect();

        let target = CheckTarget {
            instance_id: &entry.instance_id,
            instance: entry.instance.as_ref(),
            performance,
        };

        let mut results = Vec::new();
        for (name, checker) in checkers {
            if let Some(outcome) = checker.check(&target).await {
                results.push(HealthCheckResult {
                    check_name: name,
                    status: outcome.status,
                    message: outcome.message,
                    timestamp: Utc::now(),
                    response_time_ms: outcome.response_time_ms,
                    details: HashMap::new(),
                });
            }
        }

        let mut state = self.state.write().await;
        state.total_health_checks += results.len() as u64;
        let Some(monitor) = state.monitors.get_mut(&entry.instance_id) else {
            return;
        };
        for result in results {
            monitor.health_checks.insert(result.check_name.clone(), result);
        }
        monitor.overall_health = HealthStatus::aggregate(monitor.health_checks.values().map(|r| r.status));
        monitor.last_health_check = Some(Instant::now());
        monitor.last_check_at = Some(Utc::now());
    }

    async fn snapshot(&self, instance_id: &str) -> Option<MonitorSnapshot> {
        let state = self.state.read().await;
        state
            .monitors
            .get(instance_id)
            .map(|monitor| monitor.snapshot(instance_id))
    }

    async fn apply_rules(&self, snapshot: &MonitorSnapshot) {
        let rules = self.rules.read().await.clone();
        for rule in rules {
            for issue in rule(snapshot) {
                self.record_event(DiagnosticEvent::new(
                    &snapshot.instance_id,
                    "diagnostic_rule",
                    SeverityLevel::Medium,
                    issue,
                ))
                .await;
            }
        }
    }

    async fn attempt_recovery(&self, instance_id: &str, instance: &dyn ManagedInstance) {
        let Some(recoverable) = instance.as_recoverable() else {
            return;
        };

        info!("Attempting recovery of unhealthy instance {}", instance_id);
        let event = match recoverable.recover().await {
            Ok(()) => DiagnosticEvent::new(
                instance_id,
                "auto_recovery",
                SeverityLevel::Low,
                "Automatic recovery succeeded",
            ),
            Err(e) => DiagnosticEvent::new(
                instance_id,
                "auto_recovery_failed",
                SeverityLevel::High,
                format!("Automatic recovery failed: {}", e),
            ),
        };
        self.record_event(event).await;
    }

    //===============================================================
    // Queries
    //===============================================================

    pub async fn get_instance_health(&self, instance_id: &str) -> Option<InstanceHealthReport> {
        let state = self.state.read().await;
        let monitor = state.monitors.get(instance_id)?;

        let mut recent_events: Vec<DiagnosticEvent> = state
            .events
            .iter()
            .rev()
            .filter(|e| e.instance_id == instance_id)
            .take(10)
            .cloned()
            .collect();
        recent_events.reverse();

        Some(InstanceHealthReport {
            instance_id: instance_id.to_string(),
            overall_health: monitor.overall_health,
            health_checks: monitor.health_checks.clone(),
            performance: monitor.performance.clone(),
            recent_events,
            last_check: monitor.last_check_at,
        })
    }

    /// Per-metric aggregates over the last `minutes`
    pub async fn get_instance_metrics(
        &self,
        instance_id: &str,
        minutes: i64,
    ) -> Option<HashMap<String, MetricAggregate>> {
        let state = self.state.read().await;
        state
            .monitors
            .get(instance_id)
            .map(|monitor| monitor.metrics.aggregate_all(minutes))
    }

    pub async fn get_stats(&self) -> MonitoringStats {
        let state = self.state.read().await;
        let health = |status: HealthStatus| {
            state
                .monitors
                .values()
                .filter(|m| m.overall_health == status)
                .count()
        };

        MonitoringStats {
            total_instances: state.monitors.len(),
            healthy_instances: health(HealthStatus::Healthy),
            unhealthy_instances: health(HealthStatus::Unhealthy),
            total_health_checks: state.total_health_checks,
            total_diagnostic_events: state.total_diagnostic_events,
            total_spans: state.tracing.total_spans(),
            last_cycle: state.last_cycle,
        }
    }

    pub async fn get_system_overview(&self) -> SystemOverview {
        let stats = self.get_stats().await;
        let state = self.state.read().await;
        let hour_ago = Utc::now() - ChronoDuration::hours(1);

        SystemOverview {
            stats,
            instance_health: state
                .monitors
                .iter()
                .map(|(id, m)| (id.clone(), m.overall_health))
                .collect(),
            recent_events: state
                .events
                .iter()
                .filter(|e| e.timestamp >= hour_ago)
                .count(),
            active_spans: state.tracing.active_count(),
            timestamp: Utc::now(),
        }
    }

    //===============================================================
    // Background loop
    //===============================================================

    pub async fn start(&self) {
        let mut task = self.monitor_task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let system = self.clone();
        let token = self.cancel.clone();
        let period = self.config.monitoring_interval().max(Duration::from_millis(1));

        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => system.run_monitoring_cycle().await,
                }
            }
            debug!("Monitoring loop stopped");
        }));
        info!("Instance monitoring started");
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.monitor_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Monitoring task ended abnormally: {}", e);
            }
        }
        self.state.write().await.monitors.clear();
        info!("Instance monitoring shut down");
    }
}

impl Default for InstanceMonitoringSystem {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

fn elapsed(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    last.map_or(true, |at| now.duration_since(at) >= every)
}
