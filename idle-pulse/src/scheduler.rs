//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Budgeted drain loop and its state machine
//!
//! ```text
//!          enqueue                 opportunity
//!   Idle ----------> Armed ---------------------> Draining
//!    ^                 ^                             |
//!    |                 +------ backlog remains ------+
//!    +------------------------ queue empty ----------+
//! ```
//!
//! `clear()` returns to Idle from any state. A unit that has started always
//! runs to completion; the budget only decides whether the next one starts.
//!
//! # Example
//!
//! ```rust
//! use idle_pulse::{ManualNotifier, Priority, Scheduler, SchedulerConfig, SchedulerState};
//! use idle_pulse::load_probe::FixedLoadProbe;
//! use std::sync::Arc;
//!
//! let notifier = Arc::new(ManualNotifier::new());
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     notifier.clone(),
//!     Arc::new(FixedLoadProbe::neutral()),
//! )
//! .unwrap();
//!
//! scheduler.enqueue(Priority::Normal, || Ok(()));
//! assert_eq!(scheduler.state(), SchedulerState::Armed);
//!
//! notifier.fire_idle();
//! assert_eq!(scheduler.state(), SchedulerState::Idle);
//! assert_eq!(scheduler.performance_snapshot().total_executed, 1);
//! ```

#![forbid(unsafe_code)]

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

#[cfg(feature = "tracing")]
use tracing::{debug, trace, warn};

use crate::clock::{default_clock, Clock};
use crate::config::{ConfigError, SchedulerConfig};
use crate::history::{ExecutionHistory, ExecutionSample};
use crate::hooks::{ExecutionHooks, ExecutionOutcome, HookRegistry};
use crate::load_probe::{LoadProbe, LoadSample, SystemLoadProbe};
use crate::metrics::{PerformanceSnapshot, SchedulerMetrics};
use crate::notifier::{HostNotifier, Opportunity};
use crate::queue_set::{PriorityQueueSet, QueueDepths};
use crate::time_slice::{BudgetTier, TimeSliceController};
use crate::work_unit::{Priority, UnitError, UnitId, WorkUnit};

/// Listener fired when a pass drains the backlog to empty
pub type QueueEmptyListener = Arc<dyn Fn() + Send + Sync>;

/// Externally visible scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    /// Nothing registered with the host
    Idle,
    /// Waiting for the host to call back
    Armed,
    /// A pass is running
    Draining,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    /// What triggered the pass; `None` for `drain_now`
    pub opportunity: Option<Opportunity>,
    /// Actions run, successful or not
    pub executed: usize,
    /// Actions that failed
    pub failed: usize,
    /// Failures re-enqueued one level lower
    pub retried: usize,
    /// Units given up on
    pub dropped: usize,
    /// Time the pass took
    pub elapsed: Duration,
    /// Budget the pass was given
    pub budget: Duration,
    /// Rule that sized the budget
    pub tier: BudgetTier,
    /// Load reading behind the budget, if adaptive
    pub load: Option<LoadSample>,
    /// Whether the last unit ran past the budget
    pub overran: bool,
    /// Units still queued afterwards
    pub remaining: usize,
}

impl DrainReport {
    /// Successful executions in this pass
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.executed - self.failed
    }
}

/* Clears the draining flag even if a hook unwinds out of the pass */
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cooperative, budgeted work-unit scheduler
///
/// Always handled through an `Arc`; host callbacks hold a weak reference so
/// dropping the last handle cancels any pending registration.
pub struct Scheduler {
    self_ref: Weak<Scheduler>,
    config: RwLock<SchedulerConfig>,
    queues: PriorityQueueSet,
    slices: TimeSliceController,
    notifier: Arc<dyn HostNotifier>,
    clock: Arc<dyn Clock>,
    hooks: HookRegistry,
    history: ExecutionHistory,
    metrics: SchedulerMetrics,
    armed: AtomicBool,
    draining: AtomicBool,
    host_available: AtomicBool,
    /* Bumped by clear(); callbacks from older registrations are stale */
    generation: AtomicU64,
    queue_empty_listener: RwLock<Option<QueueEmptyListener>>,
    last_report: Mutex<Option<DrainReport>>,
}

impl Scheduler {
    /// Creates a scheduler on the monotonic clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(
        config: SchedulerConfig,
        notifier: Arc<dyn HostNotifier>,
        probe: Arc<dyn LoadProbe>,
    ) -> Result<Arc<Self>, ConfigError> {
        SchedulerBuilder::new(notifier).config(config).probe(probe).build()
    }

    /// Starts a builder
    pub fn builder(notifier: Arc<dyn HostNotifier>) -> SchedulerBuilder {
        SchedulerBuilder::new(notifier)
    }

    /// Queues a unit with no retries or callbacks
    pub fn enqueue<F>(&self, priority: Priority, action: F) -> UnitId
    where
        F: FnMut() -> Result<(), UnitError> + Send + 'static,
    {
        self.enqueue_unit(WorkUnit::new(priority, action))
    }

    /// Queues a fully-built unit and arms the scheduler if it was idle
    pub fn enqueue_unit(&self, mut unit: WorkUnit) -> UnitId {
        unit.stamp(self.clock.now());
        let id = unit.id();

        #[cfg(feature = "tracing")]
        trace!(unit = %id, priority = %unit.priority(), "Unit enqueued");

        self.queues.enqueue(unit);
        self.arm_if_idle();
        id
    }

    /// Empties every queue and de-registers from the host
    ///
    /// No unit callbacks run. A unit already executing finishes, and its pass
    /// then stops. Returns how many units were discarded.
    pub fn clear(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notifier.cancel();
        self.armed.store(false, Ordering::SeqCst);

        let discarded = self.queues.clear();
        if discarded > 0 {
            self.metrics.record_discarded(discarded);
        }

        #[cfg(feature = "tracing")]
        debug!(discarded = discarded, "Scheduler cleared");

        discarded
    }

    /// Runs one pass immediately, without waiting for the host
    ///
    /// Returns `None` if a pass is already running.
    pub fn drain_now(&self) -> Option<DrainReport> {
        if !self.try_claim() {
            return None;
        }
        Some(self.run_pass(None))
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        if self.draining.load(Ordering::SeqCst) {
            SchedulerState::Draining
        } else if self.armed.load(Ordering::SeqCst) {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        }
    }

    /// Whether a host registration is pending
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Whether a pass is running
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Whether the last registration attempt succeeded
    #[must_use]
    pub fn host_available(&self) -> bool {
        self.host_available.load(Ordering::SeqCst)
    }

    /// Units queued per level
    #[must_use]
    pub fn queue_depths(&self) -> QueueDepths {
        self.queues.size_by_level()
    }

    /// Units queued in total
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.len()
    }

    /// Pull-based performance view
    #[must_use]
    pub fn performance_snapshot(&self) -> PerformanceSnapshot {
        let (average_execution_ms, average_wait_ms) = self.history.averages_ms();
        let counters = self.metrics.snapshot();

        PerformanceSnapshot {
            total_executed: counters.units_executed,
            average_execution_ms,
            average_wait_ms,
            per_priority_counts: self.metrics.per_priority_counts(),
            failures: counters.unit_failures,
            retries: counters.unit_retries,
            dropped: counters.units_dropped,
            budget_overruns: counters.budget_overruns,
            opportunities: counters.idle_opportunities + counters.frame_opportunities,
            queue_empty_notifications: counters.queue_empty_notifications,
        }
    }

    /// Report of the most recent pass
    #[must_use]
    pub fn last_report(&self) -> Option<DrainReport> {
        self.last_report.lock().clone()
    }

    /// Installs the drain-to-empty listener, replacing any previous one
    pub fn set_queue_empty_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.queue_empty_listener.write() = Some(Arc::new(listener));
    }

    /// Removes the drain-to-empty listener
    pub fn clear_queue_empty_listener(&self) {
        *self.queue_empty_listener.write() = None;
    }

    /// Installs lifecycle hooks, returning the previous ones
    pub fn set_hooks(&self, hooks: Arc<dyn ExecutionHooks>) -> Option<Arc<dyn ExecutionHooks>> {
        self.hooks.set_hooks(hooks)
    }

    /// Removes lifecycle hooks
    pub fn clear_hooks(&self) -> Option<Arc<dyn ExecutionHooks>> {
        self.hooks.clear_hooks()
    }

    /// Swaps budgets, adaptive mode and history size; applies from the next pass
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] and keeps the old config if validation fails.
    pub fn update_config(&self, config: SchedulerConfig) -> Result<(), ConfigError> {
        config.validate()?;

        self.slices.update(&config);
        self.history.set_capacity(config.history_capacity);

        #[cfg(feature = "tracing")]
        tracing::info!(
            base_budget_ms = config.base_budget_ms,
            max_budget_ms = config.max_budget_ms,
            adaptive = config.adaptive_enabled,
            history_capacity = config.history_capacity,
            "Applying scheduler configuration"
        );

        *self.config.write() = config;
        self.metrics.record_config_update();
        Ok(())
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.config.read().clone()
    }

    /// Lifetime counters
    #[must_use]
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Recent successful executions
    #[must_use]
    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Budget policy
    #[must_use]
    pub fn time_slices(&self) -> &TimeSliceController {
        &self.slices
    }

    fn arm_if_idle(&self) {
        // A running pass re-checks the backlog after it clears `draining`
        atomic::fence(Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            return;
        }
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.register_with_host();
    }

    fn register_with_host(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        let scheduler = self.self_ref.clone();

        let callback = Box::new(move |opportunity: Opportunity| {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.on_opportunity(generation, opportunity);
            }
        });

        match self.notifier.request_opportunity(callback) {
            Ok(()) => {
                self.host_available.store(true, Ordering::SeqCst);

                #[cfg(feature = "tracing")]
                debug!(notifier = self.notifier.name(), generation = generation, "Scheduler armed");
            }
            Err(error) => {
                self.armed.store(false, Ordering::SeqCst);
                self.host_available.store(false, Ordering::SeqCst);
                self.metrics.record_host_unavailable(&error);
            }
        }
    }

    fn on_opportunity(&self, generation: u64, opportunity: Opportunity) {
        if generation != self.generation.load(Ordering::SeqCst) {
            self.metrics.record_stale_opportunity();
            return;
        }

        if !self.try_claim() {
            // Our registration was consumed; keep one pending unless the pass disarmed
            if self.armed.load(Ordering::SeqCst) {
                #[cfg(feature = "tracing")]
                debug!("Opportunity arrived during a pass; re-registering");

                self.register_with_host();
            }
            return;
        }

        self.armed.store(false, Ordering::SeqCst);
        self.metrics.record_opportunity(&opportunity);
        self.run_pass(Some(opportunity));
    }

    fn try_claim(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /* Caller must have claimed `draining` */
    fn run_pass(&self, opportunity: Option<Opportunity>) -> DrainReport {
        let guard = DrainGuard(&self.draining);
        let pass_generation = self.generation.load(Ordering::SeqCst);

        let start = self.clock.now();
        let slice = self.slices.compute_slice();
        let had_backlog = !self.queues.is_empty();

        let mut report = DrainReport {
            opportunity,
            executed: 0,
            failed: 0,
            retried: 0,
            dropped: 0,
            elapsed: Duration::ZERO,
            budget: slice.budget,
            tier: slice.tier,
            load: slice.sample,
            overran: false,
            remaining: 0,
        };

        while self.clock.now().saturating_sub(start) < slice.budget {
            // A clear() during the pass ends it; later work belongs to the next arming
            if self.generation.load(Ordering::SeqCst) != pass_generation {
                break;
            }
            let Some(unit) = self.queues.pop_next() else {
                break;
            };
            self.execute(unit, pass_generation, &mut report);
        }

        report.elapsed = self.clock.now().saturating_sub(start);
        report.overran = report.elapsed > slice.budget;
        report.remaining = self.queues.len();

        if report.overran {
            self.metrics.record_budget_overrun(report.elapsed, slice.budget);
        }
        self.metrics.record_pass(&report);

        #[cfg(feature = "tracing")]
        debug!(
            kind = opportunity.as_ref().map_or("manual", Opportunity::kind),
            tier = %slice.tier,
            budget_us = slice.budget.as_micros() as u64,
            elapsed_us = report.elapsed.as_micros() as u64,
            executed = report.executed,
            failed = report.failed,
            remaining = report.remaining,
            "Drain pass finished"
        );

        *self.last_report.lock() = Some(report.clone());

        // Producers cannot arm while `draining` is held, so this cannot race an enqueue
        if report.remaining == 0 {
            self.disarm();
        }

        drop(guard);
        atomic::fence(Ordering::SeqCst);

        // Producers skip arming while `draining` is set, so look again now
        if !self.queues.is_empty() {
            self.arm_if_idle();
        } else if had_backlog && pass_generation == self.generation.load(Ordering::SeqCst) {
            self.notify_queue_empty();
        }

        report
    }

    fn execute(&self, mut unit: WorkUnit, pass_generation: u64, report: &mut DrainReport) {
        self.hooks.before_execute(&unit);

        let priority = unit.priority();
        let started = self.clock.now();
        let wait = started.saturating_sub(unit.enqueued_at());

        let result = unit.run();

        let finished = self.clock.now();
        let execution = finished.saturating_sub(started);

        report.executed += 1;
        self.metrics.record_execution(priority, execution);
        self.hooks.after_execute(&unit, ExecutionOutcome::of(&result), execution);

        match result {
            Ok(()) => {
                if let Some(estimate) = unit.estimated_cost() {
                    if execution > estimate {
                        self.metrics.record_estimate_overrun(unit.id(), estimate, execution);
                    }
                }

                self.history.record(ExecutionSample {
                    unit_id: unit.id(),
                    priority,
                    execution,
                    wait,
                    finished_at: finished,
                });
                self.metrics.record_wait(wait);

                #[cfg(feature = "tracing")]
                trace!(
                    unit = %unit.id(),
                    priority = %priority,
                    execution_us = execution.as_micros() as u64,
                    wait_us = wait.as_micros() as u64,
                    "Unit completed"
                );

                unit.complete_success();
            }
            Err(error) => self.handle_failure(unit, error, pass_generation, report),
        }
    }

    fn handle_failure(
        &self,
        mut unit: WorkUnit,
        error: UnitError,
        pass_generation: u64,
        report: &mut DrainReport,
    ) {
        let from = unit.priority();
        report.failed += 1;
        self.metrics.record_failure(unit.id(), from, &error);

        // Cleared while running: the unit goes the way of the rest of the backlog
        if self.generation.load(Ordering::SeqCst) != pass_generation {
            #[cfg(feature = "tracing")]
            debug!(unit = %unit.id(), "Unit failed after clear; discarding without retry");

            self.metrics.record_discarded(1);
            return;
        }

        if unit.record_failure() {
            let retry = unit.into_retry(self.clock.now());
            report.retried += 1;
            self.metrics.record_retry(retry.id(), from, retry.priority());
            self.hooks.on_retry(&retry, from);
            self.queues.enqueue(retry);
        } else {
            report.dropped += 1;
            self.metrics.record_drop(unit.id(), unit.retry_budget(), &error);
            self.hooks.on_drop(&unit, &error);
            unit.complete_failure(error);
        }
    }

    /* Drops a host registration left over from before a manual pass */
    fn disarm(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.notifier.cancel();

            #[cfg(feature = "tracing")]
            debug!("Backlog drained manually; host registration cancelled");
        }
    }

    fn notify_queue_empty(&self) {
        self.metrics.record_queue_empty();

        let listener = self.queue_empty_listener.read().clone();
        let Some(listener) = listener else {
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
            #[cfg(feature = "tracing")]
            warn!("Queue-empty listener panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.notifier.cancel();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("host_available", &self.host_available())
            .field("notifier", &self.notifier.name())
            .field("clock", &self.clock.name())
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Scheduler`]
#[must_use]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    notifier: Arc<dyn HostNotifier>,
    probe: Option<Arc<dyn LoadProbe>>,
    clock: Option<Arc<dyn Clock>>,
    hooks: Option<Arc<dyn ExecutionHooks>>,
    listener: Option<QueueEmptyListener>,
}

impl SchedulerBuilder {
    /// Builder with default config, system load probe and monotonic clock
    pub fn new(notifier: Arc<dyn HostNotifier>) -> Self {
        Self {
            config: SchedulerConfig::default(),
            notifier,
            probe: None,
            clock: None,
            hooks: None,
            listener: None,
        }
    }

    /// Set configuration
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set load probe
    pub fn probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Set time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set lifecycle hooks
    pub fn hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Set drain-to-empty listener
    pub fn queue_empty_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Validate the config and create the scheduler
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config fails validation.
    pub fn build(self) -> Result<Arc<Scheduler>, ConfigError> {
        self.config.validate()?;

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemLoadProbe::new()) as Arc<dyn LoadProbe>);
        let clock = self.clock.unwrap_or_else(default_clock);
        let slices = TimeSliceController::new(&self.config, probe);
        let history = ExecutionHistory::new(self.config.history_capacity);

        let hooks = HookRegistry::new();
        if let Some(installed) = self.hooks {
            hooks.set_hooks(installed);
        }

        #[cfg(feature = "tracing")]
        debug!(
            notifier = self.notifier.name(),
            probe = slices.probe().name(),
            clock = clock.name(),
            base_budget_ms = self.config.base_budget_ms,
            max_budget_ms = self.config.max_budget_ms,
            adaptive = self.config.adaptive_enabled,
            "Scheduler created"
        );

        let notifier = self.notifier;
        let listener = self.listener;
        let config = self.config;

        Ok(Arc::new_cyclic(|self_ref| Scheduler {
            self_ref: self_ref.clone(),
            config: RwLock::new(config),
            queues: PriorityQueueSet::new(),
            slices,
            notifier,
            clock,
            hooks,
            history,
            metrics: SchedulerMetrics::new(),
            armed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            host_available: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            queue_empty_listener: RwLock::new(listener),
            last_report: Mutex::new(None),
        }))
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("notifier", &self.notifier.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::load_probe::FixedLoadProbe;
    use crate::notifier::{ManualNotifier, UnavailableNotifier};
    use std::sync::atomic::AtomicUsize;

    fn fixed(base: u64) -> SchedulerConfig {
        SchedulerConfig {
            base_budget_ms: base,
            max_budget_ms: base * 2,
            adaptive_enabled: false,
            history_capacity: 16,
        }
    }

    fn setup(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<ManualNotifier>, ManualClock) {
        let notifier = Arc::new(ManualNotifier::new());
        let clock = ManualClock::new();
        let scheduler = Scheduler::builder(notifier.clone())
            .config(config)
            .probe(Arc::new(FixedLoadProbe::neutral()))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (scheduler, notifier, clock)
    }

    #[test]
    fn test_arms_once() {
        let (scheduler, notifier, _clock) = setup(fixed(8));
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.enqueue(Priority::Normal, || Ok(()));
        scheduler.enqueue(Priority::Normal, || Ok(()));

        assert_eq!(scheduler.state(), SchedulerState::Armed);
        assert_eq!(notifier.request_count(), 1);
    }

    #[test]
    fn test_opportunity_drains_and_goes_idle() {
        let (scheduler, notifier, _clock) = setup(fixed(8));
        for _ in 0..3 {
            scheduler.enqueue(Priority::Low, || Ok(()));
        }

        assert!(notifier.fire_idle());
        let report = scheduler.last_report().unwrap();
        assert_eq!(report.executed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.opportunity, Some(Opportunity::Idle));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!notifier.is_pending());
    }

    #[test]
    fn test_budget_stops_pass_and_rearms() {
        let (scheduler, notifier, clock) = setup(fixed(10));
        for _ in 0..5 {
            let clock = clock.clone();
            scheduler.enqueue(Priority::Normal, move || {
                clock.advance(Duration::from_millis(4));
                Ok(())
            });
        }

        notifier.fire_idle();
        let report = scheduler.last_report().unwrap();
        // 0 -> 4 -> 8 -> 12: third unit starts at 8ms and overruns
        assert_eq!(report.executed, 3);
        assert!(report.overran);
        assert_eq!(report.remaining, 2);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        assert!(notifier.is_pending());
        assert_eq!(scheduler.metrics().snapshot().budget_overruns, 1);
    }

    #[test]
    fn test_enqueue_during_pass_not_lost() {
        let (scheduler, notifier, _clock) = setup(fixed(8));
        let inner = Arc::downgrade(&scheduler);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        scheduler.enqueue(Priority::Normal, move || {
            if let Some(s) = inner.upgrade() {
                let counter = Arc::clone(&counter);
                s.enqueue(Priority::Normal, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
            Ok(())
        });

        notifier.fire_idle();
        // Nested enqueue ran in the same pass since budget remained
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_unavailable_host() {
        let scheduler = Scheduler::new(
            fixed(8),
            Arc::new(UnavailableNotifier::new("headless")),
            Arc::new(FixedLoadProbe::neutral()),
        )
        .unwrap();

        scheduler.enqueue(Priority::High, || Ok(()));
        scheduler.enqueue(Priority::High, || Ok(()));

        assert!(!scheduler.host_available());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.metrics().snapshot().host_unavailable, 2);

        let report = scheduler.drain_now().unwrap();
        assert_eq!(report.executed, 2);
        assert!(report.opportunity.is_none());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_stale_callback_ignored_after_clear() {
        let (scheduler, notifier, _clock) = setup(fixed(8));
        scheduler.enqueue(Priority::Normal, || Ok(()));

        // Capture the registration before clear cancels it
        let stale: Arc<Mutex<Option<crate::notifier::OpportunityCallback>>> = Arc::default();
        {
            let generation = scheduler.generation.load(Ordering::SeqCst);
            let weak = Arc::downgrade(&scheduler);
            *stale.lock() = Some(Box::new(move |opportunity| {
                if let Some(s) = weak.upgrade() {
                    s.on_opportunity(generation, opportunity);
                }
            }));
        }

        assert_eq!(scheduler.clear(), 1);
        assert!(!notifier.is_pending());

        scheduler.enqueue(Priority::Normal, || Ok(()));
        let callback = stale.lock().take().unwrap();
        callback(Opportunity::Idle);

        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.metrics().snapshot().stale_opportunities, 1);

        notifier.fire_idle();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_drain_now_rejected_while_draining() {
        let (scheduler, notifier, _clock) = setup(fixed(8));
        let inner = Arc::downgrade(&scheduler);
        let nested = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&nested);
        scheduler.enqueue(Priority::Normal, move || {
            if let Some(s) = inner.upgrade() {
                *slot.lock() = Some(s.drain_now().is_none());
                assert_eq!(s.state(), SchedulerState::Draining);
            }
            Ok(())
        });

        notifier.fire_idle();
        assert_eq!(*nested.lock(), Some(true));
    }

    #[test]
    fn test_update_config() {
        let (scheduler, _notifier, _clock) = setup(fixed(8));

        let bad = SchedulerConfig {
            base_budget_ms: 0,
            ..fixed(8)
        };
        assert_eq!(scheduler.update_config(bad), Err(ConfigError::ZeroBaseBudget));
        assert_eq!(scheduler.config().base_budget_ms, 8);

        scheduler.update_config(fixed(3)).unwrap();
        assert_eq!(scheduler.config().base_budget_ms, 3);
        assert_eq!(scheduler.time_slices().compute_budget(), Duration::from_millis(3));
        assert_eq!(scheduler.metrics().snapshot().config_updates, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Scheduler::new(
            SchedulerConfig {
                base_budget_ms: 20,
                max_budget_ms: 10,
                ..SchedulerConfig::default()
            },
            Arc::new(ManualNotifier::new()),
            Arc::new(FixedLoadProbe::neutral()),
        );
        assert_eq!(
            result.err(),
            Some(ConfigError::BaseExceedsMax { base: 20, max: 10 })
        );
    }

    #[test]
    fn test_drop_cancels_registration() {
        let (scheduler, notifier, _clock) = setup(fixed(8));
        scheduler.enqueue(Priority::Normal, || Ok(()));
        assert!(notifier.is_pending());

        drop(scheduler);
        assert!(!notifier.is_pending());
    }

    #[test]
    fn test_estimate_overrun_counted() {
        let (scheduler, notifier, clock) = setup(fixed(8));
        let c = clock.clone();
        scheduler.enqueue_unit(
            WorkUnit::builder(Priority::Normal, move || {
                c.advance(Duration::from_millis(3));
                Ok(())
            })
            .estimated_cost(Duration::from_millis(1))
            .build(),
        );

        notifier.fire_idle();
        assert_eq!(scheduler.metrics().snapshot().estimate_overruns, 1);
    }
}
