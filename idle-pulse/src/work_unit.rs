//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Work units and their scheduling metadata
//!
//! A [`WorkUnit`] is the atomic, non-preemptible piece of work the scheduler
//! drains. Once started it always runs to completion; the scheduler only
//! decides *whether* to start the next one.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Priority levels, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Must run at the next opportunity
    Critical = 0,
    /// User-visible work
    High = 1,
    /// Standard work
    Normal = 2,
    /// Deferred work
    Low = 3,
    /// Runs only when every other level is empty
    Background = 4,
}

impl Priority {
    /// Number of priority levels
    pub const COUNT: usize = 5;

    /// All levels in drain order
    pub const ALL: [Priority; Priority::COUNT] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Queue index of this level (0 = most urgent)
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Level for a queue index
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            4 => Some(Self::Background),
            _ => None,
        }
    }

    /// Drop priority by one level
    ///
    /// `Background` is the floor and stays where it is.
    #[must_use]
    pub const fn demote(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Normal,
            Self::Normal => Self::Low,
            Self::Low | Self::Background => Self::Background,
        }
    }

    /// Lowercase name, used for logs and metric labels
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unit identifier, stable across retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

impl UnitId {
    /// Allocates the next process-wide identifier
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Failure raised by a unit's action
#[derive(Debug, Error)]
pub enum UnitError {
    /// Action reported failure
    #[error("unit failed: {0}")]
    Failed(String),

    /// Action panicked; the payload message is preserved when it is a string
    #[error("unit panicked: {0}")]
    Panicked(String),

    /// Any other error surfaced by the action
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl UnitError {
    /// Shorthand for [`UnitError::Failed`]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether the failure came from a panic
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(message)
    }
}

/// Unit body. `FnMut` so a retried unit can run the same closure again.
pub type Action = Box<dyn FnMut() -> Result<(), UnitError> + Send>;

/// Invoked once after a successful execution
pub type SuccessCallback = Box<dyn FnOnce() + Send>;

/// Invoked once when retries are exhausted
pub type FailureCallback = Box<dyn FnOnce(UnitError) + Send>;

/// Atomic unit of work plus scheduling metadata
pub struct WorkUnit {
    id: UnitId,
    label: Option<String>,
    action: Action,
    priority: Priority,
    estimated_cost: Option<Duration>,
    retry_budget: u32,
    retry_count: u32,
    enqueued_at: Duration,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl WorkUnit {
    /// Creates a unit with no retries and no callbacks
    pub fn new<F>(priority: Priority, action: F) -> Self
    where
        F: FnMut() -> Result<(), UnitError> + Send + 'static,
    {
        Self::builder(priority, action).build()
    }

    /// Starts a builder for a unit with callbacks, retries or diagnostics
    pub fn builder<F>(priority: Priority, action: F) -> WorkUnitBuilder
    where
        F: FnMut() -> Result<(), UnitError> + Send + 'static,
    {
        WorkUnitBuilder {
            unit: Self {
                id: UnitId::next(),
                label: None,
                action: Box::new(action),
                priority,
                estimated_cost: None,
                retry_budget: 0,
                retry_count: 0,
                enqueued_at: Duration::ZERO,
                on_success: None,
                on_failure: None,
            },
        }
    }

    /// Unit identifier
    #[inline]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Diagnostic label
    #[inline]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Current priority (lower after each demoting retry)
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Advisory duration hint
    #[inline]
    pub fn estimated_cost(&self) -> Option<Duration> {
        self.estimated_cost
    }

    /// Maximum re-attempts after failure
    #[inline]
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Failures so far
    #[inline]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Scheduler clock reading at insertion
    #[inline]
    pub fn enqueued_at(&self) -> Duration {
        self.enqueued_at
    }

    pub(crate) fn stamp(&mut self, now: Duration) {
        self.enqueued_at = now;
    }

    /// Runs the action; a panic is converted into [`UnitError::Panicked`]
    pub(crate) fn run(&mut self) -> Result<(), UnitError> {
        let action = &mut self.action;
        match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(result) => result,
            Err(payload) => Err(UnitError::from_panic(payload)),
        }
    }

    /// Counts a failure; returns `true` while the retry budget allows another attempt
    pub(crate) fn record_failure(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count <= self.retry_budget
    }

    /// Re-creates the unit one level lower for its next attempt
    pub(crate) fn into_retry(mut self, now: Duration) -> Self {
        self.priority = self.priority.demote();
        self.enqueued_at = now;
        self
    }

    pub(crate) fn complete_success(mut self) {
        if let Some(callback) = self.on_success.take() {
            contain_callback(self.id, "on_success", callback);
        }
    }

    pub(crate) fn complete_failure(mut self, error: UnitError) {
        if let Some(callback) = self.on_failure.take() {
            contain_callback(self.id, "on_failure", move || callback(error));
        }
    }
}

/* Callback panics stay inside the unit boundary */
fn contain_callback<F: FnOnce()>(id: UnitId, which: &'static str, callback: F) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(unit = %id, callback = which, "Completion callback panicked");

        #[cfg(not(feature = "tracing"))]
        let _ = (id, which);
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("estimated_cost", &self.estimated_cost)
            .field("retry_budget", &self.retry_budget)
            .field("retry_count", &self.retry_count)
            .field("enqueued_at", &self.enqueued_at)
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkUnit`]
///
/// ```
/// use idle_pulse::{Priority, UnitError, WorkUnit};
/// use std::time::Duration;
///
/// let unit = WorkUnit::builder(Priority::High, || Err(UnitError::msg("flaky")))
///     .retry_budget(2)
///     .estimated_cost(Duration::from_millis(3))
///     .label("thumbnail")
///     .on_failure(|err| eprintln!("gave up: {err}"))
///     .build();
///
/// assert_eq!(unit.retry_budget(), 2);
/// assert_eq!(unit.label(), Some("thumbnail"));
/// ```
#[must_use]
pub struct WorkUnitBuilder {
    unit: WorkUnit,
}

impl WorkUnitBuilder {
    /// Set maximum re-attempts after failure
    pub fn retry_budget(mut self, retries: u32) -> Self {
        self.unit.retry_budget = retries;
        self
    }

    /// Set advisory cost hint
    pub fn estimated_cost(mut self, cost: Duration) -> Self {
        self.unit.estimated_cost = Some(cost);
        self
    }

    /// Set diagnostic label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.unit.label = Some(label.into());
        self
    }

    /// Set success callback
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.unit.on_success = Some(Box::new(callback));
        self
    }

    /// Set failure callback, called with the last error after retries run out
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(UnitError) + Send + 'static,
    {
        self.unit.on_failure = Some(Box::new(callback));
        self
    }

    /// Finish the unit
    pub fn build(self) -> WorkUnit {
        self.unit
    }
}
