//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Metrics collection and reporting for the scheduler
//!
//! Counters are plain atomics readable from any thread. With the `metrics`
//! feature each record also goes to the `metrics` facade under
//! `idle_pulse_*` names; with the `tracing` feature notable events are
//! logged.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::notifier::{NotifierError, Opportunity};
use crate::scheduler::DrainReport;
use crate::work_unit::{Priority, UnitError, UnitId};

/// Overrun, as a fraction of the budget, past which an overrun is logged as a warning
pub const SEVERE_OVERRUN_FRACTION: f64 = 0.5;

/// Whether a pass ran past its budget by more than [`SEVERE_OVERRUN_FRACTION`]
#[must_use]
pub fn is_severe_overrun(elapsed: Duration, budget: Duration) -> bool {
    elapsed.saturating_sub(budget).as_secs_f64() > budget.as_secs_f64() * SEVERE_OVERRUN_FRACTION
}

/// Scheduler counters
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Actions run, successful or not
    pub units_executed: AtomicU64,

    /// Actions that returned an error or panicked
    pub unit_failures: AtomicU64,

    /// Failures that were re-enqueued
    pub unit_retries: AtomicU64,

    /// Units dropped after exhausting retries
    pub units_dropped: AtomicU64,

    /// Idle opportunities serviced
    pub idle_opportunities: AtomicU64,

    /// Frame opportunities serviced
    pub frame_opportunities: AtomicU64,

    /// Opportunities ignored because a `clear` superseded them
    pub stale_opportunities: AtomicU64,

    /// Passes whose last unit ran past the budget
    pub budget_overruns: AtomicU64,

    /// Overruns beyond [`SEVERE_OVERRUN_FRACTION`] of the budget
    pub severe_budget_overruns: AtomicU64,

    /// Units that ran longer than their estimated cost
    pub estimate_overruns: AtomicU64,

    /// Drain-to-empty notifications delivered
    pub queue_empty_notifications: AtomicU64,

    /// Units discarded by `clear`
    pub units_discarded: AtomicU64,

    /// Failed registrations with the host
    pub host_unavailable: AtomicU64,

    /// Number of configuration updates
    pub config_updates: AtomicU64,

    /// Actions run per priority level
    per_priority: [AtomicU64; Priority::COUNT],

    /// Creation time for uptime calculation
    start_time: Instant,
}

impl SchedulerMetrics {
    /// Create new metrics instance
    #[must_use]
    pub fn new() -> Self {
        Self {
            units_executed: AtomicU64::new(0),
            unit_failures: AtomicU64::new(0),
            unit_retries: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
            idle_opportunities: AtomicU64::new(0),
            frame_opportunities: AtomicU64::new(0),
            stale_opportunities: AtomicU64::new(0),
            budget_overruns: AtomicU64::new(0),
            severe_budget_overruns: AtomicU64::new(0),
            estimate_overruns: AtomicU64::new(0),
            queue_empty_notifications: AtomicU64::new(0),
            units_discarded: AtomicU64::new(0),
            host_unavailable: AtomicU64::new(0),
            config_updates: AtomicU64::new(0),
            per_priority: Default::default(),
            start_time: Instant::now(),
        }
    }

    /// Record a serviced opportunity
    pub fn record_opportunity(&self, opportunity: &Opportunity) {
        match opportunity {
            Opportunity::Idle => self.idle_opportunities.fetch_add(1, Ordering::Relaxed),
            Opportunity::Frame { .. } => self.frame_opportunities.fetch_add(1, Ordering::Relaxed),
        };

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_opportunities_total", "kind" => opportunity.kind()).increment(1);
    }

    /// Record an opportunity that arrived after its registration was cancelled
    pub fn record_stale_opportunity(&self) {
        self.stale_opportunities.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!("Stale opportunity ignored");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_stale_opportunities_total").increment(1);
    }

    /// Record one action run
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_execution(&self, priority: Priority, execution: Duration) {
        self.units_executed.fetch_add(1, Ordering::Relaxed);
        self.per_priority[priority.index()].fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        {
            counter!("idle_pulse_units_executed_total", "priority" => priority.name()).increment(1);
            histogram!("idle_pulse_unit_execution_seconds").record(execution.as_secs_f64());
        }
    }

    /// Record the wait of a successful unit
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_wait(&self, wait: Duration) {
        #[cfg(feature = "metrics")]
        histogram!("idle_pulse_unit_wait_seconds").record(wait.as_secs_f64());
    }

    /// Record a failed run
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_failure(&self, id: UnitId, priority: Priority, error: &UnitError) {
        self.unit_failures.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(unit = %id, priority = %priority, error = %error, "Unit failed");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_unit_failures_total", "panic" => if error.is_panic() { "true" } else { "false" }).increment(1);
    }

    /// Record a retry and its demotion
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_retry(&self, id: UnitId, from: Priority, to: Priority) {
        self.unit_retries.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(unit = %id, from = %from, to = %to, "Unit re-enqueued for retry");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_unit_retries_total", "from" => from.name(), "to" => to.name()).increment(1);
    }

    /// Record a unit given up on
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_drop(&self, id: UnitId, retries: u32, error: &UnitError) {
        self.units_dropped.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        warn!(unit = %id, retries = retries, error = %error, "Unit dropped after exhausting retries");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_units_dropped_total").increment(1);
    }

    /// Record a pass that ran past its budget
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_budget_overrun(&self, elapsed: Duration, budget: Duration) {
        self.budget_overruns.fetch_add(1, Ordering::Relaxed);

        // The last unit of a budget-bound pass nearly always crosses the line
        if is_severe_overrun(elapsed, budget) {
            self.severe_budget_overruns.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "tracing")]
            warn!(
                elapsed_us = elapsed.as_micros() as u64,
                budget_us = budget.as_micros() as u64,
                "Drain pass overran its budget"
            );
        } else {
            #[cfg(feature = "tracing")]
            debug!(
                elapsed_us = elapsed.as_micros() as u64,
                budget_us = budget.as_micros() as u64,
                "Drain pass overran its budget"
            );
        }

        #[cfg(feature = "metrics")]
        {
            counter!("idle_pulse_budget_overruns_total").increment(1);
            histogram!("idle_pulse_budget_overrun_seconds")
                .record(elapsed.saturating_sub(budget).as_secs_f64());
        }
    }

    /// Record a unit that ran longer than its hint
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_estimate_overrun(&self, id: UnitId, estimated: Duration, actual: Duration) {
        self.estimate_overruns.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(
            unit = %id,
            estimated_us = estimated.as_micros() as u64,
            actual_us = actual.as_micros() as u64,
            "Unit exceeded its estimated cost"
        );

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_estimate_overruns_total").increment(1);
    }

    /// Record a drain-to-empty notification
    pub fn record_queue_empty(&self) {
        self.queue_empty_notifications.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_queue_empty_total").increment(1);
    }

    /// Record units discarded by `clear`
    pub fn record_discarded(&self, count: usize) {
        self.units_discarded.fetch_add(count as u64, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(count = count, "Queued units discarded");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_units_discarded_total").increment(count as u64);
    }

    /// Record a failed host registration
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_host_unavailable(&self, error: &NotifierError) {
        self.host_unavailable.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        warn!(error = %error, "Host notifier unavailable; backlog waits for drain_now or a later enqueue");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_host_unavailable_total").increment(1);
    }

    /// Record configuration update
    pub fn record_config_update(&self) {
        self.config_updates.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        info!("Scheduler configuration updated");

        #[cfg(feature = "metrics")]
        counter!("idle_pulse_config_updates_total").increment(1);
    }

    /// Record a finished pass
    #[cfg_attr(not(all(feature = "tracing", feature = "metrics")), allow(unused_variables))]
    pub fn record_pass(&self, report: &DrainReport) {
        #[cfg(feature = "metrics")]
        {
            histogram!("idle_pulse_pass_seconds", "tier" => report.tier.name()).record(report.elapsed.as_secs_f64());
            gauge!("idle_pulse_queue_depth").set(report.remaining as f64);
        }
    }

    /// Actions run at one level
    #[must_use]
    pub fn executed_at(&self, priority: Priority) -> u64 {
        self.per_priority[priority.index()].load(Ordering::Relaxed)
    }

    /// Actions run per level
    #[must_use]
    pub fn per_priority_counts(&self) -> BTreeMap<Priority, u64> {
        Priority::ALL.iter().map(|p| (*p, self.executed_at(*p))).collect()
    }

    /// Seconds since creation
    #[must_use]
    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Get snapshot of current metric values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            units_executed: self.units_executed.load(Ordering::Relaxed),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
            unit_retries: self.unit_retries.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            idle_opportunities: self.idle_opportunities.load(Ordering::Relaxed),
            frame_opportunities: self.frame_opportunities.load(Ordering::Relaxed),
            stale_opportunities: self.stale_opportunities.load(Ordering::Relaxed),
            budget_overruns: self.budget_overruns.load(Ordering::Relaxed),
            severe_budget_overruns: self.severe_budget_overruns.load(Ordering::Relaxed),
            estimate_overruns: self.estimate_overruns.load(Ordering::Relaxed),
            queue_empty_notifications: self.queue_empty_notifications.load(Ordering::Relaxed),
            units_discarded: self.units_discarded.load(Ordering::Relaxed),
            host_unavailable: self.host_unavailable.load(Ordering::Relaxed),
            config_updates: self.config_updates.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Actions run
    pub units_executed: u64,
    /// Failed actions
    pub unit_failures: u64,
    /// Retries scheduled
    pub unit_retries: u64,
    /// Units dropped
    pub units_dropped: u64,
    /// Idle opportunities serviced
    pub idle_opportunities: u64,
    /// Frame opportunities serviced
    pub frame_opportunities: u64,
    /// Stale opportunities ignored
    pub stale_opportunities: u64,
    /// Budget overruns
    pub budget_overruns: u64,
    /// Overruns past the warning threshold
    pub severe_budget_overruns: u64,
    /// Estimate overruns
    pub estimate_overruns: u64,
    /// Queue-empty notifications
    pub queue_empty_notifications: u64,
    /// Units discarded by `clear`
    pub units_discarded: u64,
    /// Failed host registrations
    pub host_unavailable: u64,
    /// Configuration updates
    pub config_updates: u64,
    /// Seconds since creation
    pub uptime_seconds: f64,
}

/// Pull-based performance view for dashboards
///
/// Averages cover the successful executions still in the history window;
/// counters cover the scheduler's lifetime. Fields are read one at a time,
/// so a snapshot taken during a pass may mix ages.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSnapshot {
    /// Actions run, successful or not
    pub total_executed: u64,
    /// Mean execution time of recent successes
    pub average_execution_ms: f64,
    /// Mean wait time of recent successes
    pub average_wait_ms: f64,
    /// Actions run per level
    pub per_priority_counts: BTreeMap<Priority, u64>,
    /// Failed actions
    pub failures: u64,
    /// Retries scheduled
    pub retries: u64,
    /// Units dropped after exhausting retries
    pub dropped: u64,
    /// Passes that overran their budget
    pub budget_overruns: u64,
    /// Opportunities serviced
    pub opportunities: u64,
    /// Drain-to-empty notifications
    pub queue_empty_notifications: u64,
}

/// Register every counter at zero so exporters see them before first use
#[cfg(feature = "metrics")]
pub fn init_metrics() {
    #[cfg(feature = "tracing")]
    info!("Initializing idle-pulse metrics registry");

    counter!("idle_pulse_units_executed_total").absolute(0);
    counter!("idle_pulse_unit_failures_total").absolute(0);
    counter!("idle_pulse_unit_retries_total").absolute(0);
    counter!("idle_pulse_units_dropped_total").absolute(0);
    counter!("idle_pulse_opportunities_total").absolute(0);
    counter!("idle_pulse_stale_opportunities_total").absolute(0);
    counter!("idle_pulse_budget_overruns_total").absolute(0);
    counter!("idle_pulse_estimate_overruns_total").absolute(0);
    counter!("idle_pulse_queue_empty_total").absolute(0);
    counter!("idle_pulse_units_discarded_total").absolute(0);
    counter!("idle_pulse_host_unavailable_total").absolute(0);
    counter!("idle_pulse_config_updates_total").absolute(0);

    gauge!("idle_pulse_queue_depth").set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = SchedulerMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.units_executed, 0);
        assert_eq!(snapshot.budget_overruns, 0);
        assert!(snapshot.uptime_seconds >= 0.0);
    }

    #[test]
    fn test_execution_per_priority() {
        let metrics = SchedulerMetrics::new();

        metrics.record_execution(Priority::High, Duration::from_millis(1));
        metrics.record_execution(Priority::High, Duration::from_millis(1));
        metrics.record_execution(Priority::Background, Duration::from_millis(1));

        assert_eq!(metrics.units_executed.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.executed_at(Priority::High), 2);
        assert_eq!(metrics.executed_at(Priority::Critical), 0);

        let counts = metrics.per_priority_counts();
        assert_eq!(counts.len(), Priority::COUNT);
        assert_eq!(counts[&Priority::Background], 1);
    }

    #[test]
    fn test_opportunity_kinds() {
        let metrics = SchedulerMetrics::new();

        metrics.record_opportunity(&Opportunity::Idle);
        metrics.record_opportunity(&Opportunity::Frame {
            timestamp: Instant::now(),
        });
        metrics.record_opportunity(&Opportunity::Idle);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.idle_opportunities, 2);
        assert_eq!(snapshot.frame_opportunities, 1);
    }

    #[test]
    fn test_failure_paths() {
        let metrics = SchedulerMetrics::new();
        let err = UnitError::msg("x");

        metrics.record_failure(UnitId(1), Priority::High, &err);
        metrics.record_retry(UnitId(1), Priority::High, Priority::Normal);
        metrics.record_failure(UnitId(1), Priority::Normal, &err);
        metrics.record_drop(UnitId(1), 1, &err);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.unit_failures, 2);
        assert_eq!(snapshot.unit_retries, 1);
        assert_eq!(snapshot.units_dropped, 1);
    }

    #[test]
    fn test_severe_overrun_threshold() {
        let budget = Duration::from_millis(16);
        assert!(!is_severe_overrun(Duration::from_millis(16), budget));
        assert!(!is_severe_overrun(Duration::from_millis(20), budget));
        assert!(!is_severe_overrun(Duration::from_millis(24), budget));
        assert!(is_severe_overrun(Duration::from_millis(25), budget));
    }

    #[test]
    fn test_overruns_and_discards() {
        let metrics = SchedulerMetrics::new();

        metrics.record_budget_overrun(Duration::from_millis(25), Duration::from_millis(16));
        metrics.record_budget_overrun(Duration::from_millis(17), Duration::from_millis(16));
        metrics.record_estimate_overrun(UnitId(7), Duration::from_millis(1), Duration::from_millis(3));
        metrics.record_discarded(4);
        metrics.record_discarded(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.budget_overruns, 2);
        assert_eq!(snapshot.severe_budget_overruns, 1);
        assert_eq!(snapshot.estimate_overruns, 1);
        assert_eq!(snapshot.units_discarded, 4);
    }
}
