//! Cooperative, budgeted work-unit scheduler
//!
//! Producers queue short, non-preemptible units of work at one of five
//! priority levels. Whenever the host reports an opportunity (spare idle time
//! or the start of a frame) the scheduler drains the backlog in strict
//! priority order until a per-opportunity time budget runs out, then asks the
//! host to call back again. The budget shrinks when the machine is saturated
//! and grows when it is idle.
//!
//! ```rust
//! use idle_pulse::{ManualNotifier, Priority, Scheduler, SchedulerConfig, UnitError, WorkUnit};
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
//! scheduler.enqueue(Priority::High, || Ok(()));
//! scheduler.enqueue_unit(
//!     WorkUnit::builder(Priority::Low, || Err(UnitError::msg("not yet")))
//!         .retry_budget(1)
//!         .build(),
//! );
//!
//! // The host's event loop reports spare time
//! notifier.fire_idle();
//!
//! let snapshot = scheduler.performance_snapshot();
//! assert_eq!(snapshot.total_executed, 3);
//! assert_eq!(snapshot.dropped, 1);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group

/// Monotonic time sources
pub mod clock;
/// Configuration, validation and presets
pub mod config;
/// Bounded execution history
pub mod history;
/// Hook system for unit lifecycle instrumentation
pub mod hooks;
/// Load sampling
pub mod load_probe;
/// Metrics collection and reporting
pub mod metrics;
/// Host opportunity notifiers
pub mod notifier;
/// Per-priority FIFO backlog
pub mod queue_set;
/// Drain loop and state machine
pub mod scheduler;
/// Budget policy
pub mod time_slice;
/// Work units and priorities
pub mod work_unit;

// Public API exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, ConfigProfile, SchedulerConfig, SchedulerConfigBuilder};
pub use history::{ExecutionHistory, ExecutionSample};
pub use hooks::{ExecutionHooks, ExecutionOutcome, HookRegistry, NullHooks};
pub use load_probe::{FixedLoadProbe, LoadProbe, LoadSample, SystemLoadProbe};
pub use metrics::{MetricsSnapshot, PerformanceSnapshot, SchedulerMetrics};
pub use notifier::{
    HostNotifier, ManualNotifier, NotifierError, Opportunity, OpportunityCallback,
    UnavailableNotifier,
};
pub use queue_set::{PriorityQueueSet, QueueDepths};
pub use scheduler::{DrainReport, Scheduler, SchedulerBuilder, SchedulerState};
pub use time_slice::{BudgetTier, TimeSlice, TimeSliceController};
pub use work_unit::{Priority, UnitError, UnitId, WorkUnit, WorkUnitBuilder};
