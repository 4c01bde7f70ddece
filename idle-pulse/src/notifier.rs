//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Host environment contract
//!
//! The scheduler never decides on its own when to run. It registers a
//! one-shot callback with a [`HostNotifier`] and drains when the host calls
//! back, either because it went idle or because a frame started.
//!
//! Implementations must never invoke the callback from inside
//! [`HostNotifier::request_opportunity`]; the scheduler may be holding
//! state it expects to release before the opportunity runs.
//!
//! # Example
//!
//! ```rust
//! use idle_pulse::notifier::{HostNotifier, ManualNotifier, Opportunity};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! let notifier = ManualNotifier::new();
//! let fired = Arc::new(AtomicBool::new(false));
//!
//! let flag = Arc::clone(&fired);
//! notifier
//!     .request_opportunity(Box::new(move |opportunity| {
//!         assert_eq!(opportunity, Opportunity::Idle);
//!         flag.store(true, Ordering::SeqCst);
//!     }))
//!     .unwrap();
//!
//! assert!(notifier.fire_idle());
//! assert!(fired.load(Ordering::SeqCst));
//! ```

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

/// Why the host called back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opportunity {
    /// Host has spare time
    Idle,
    /// A frame started at `timestamp`
    Frame {
        /// Frame start as reported by the host
        timestamp: Instant,
    },
}

impl Opportunity {
    /// Lowercase name, used for logs and metric labels
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Frame { .. } => "frame",
        }
    }
}

/// One-shot callback handed to the host
pub type OpportunityCallback = Box<dyn FnOnce(Opportunity) + Send>;

/// Host notifier errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifierError {
    /// The host cannot deliver opportunities
    #[error("host notifier unavailable: {0}")]
    Unavailable(String),

    /// The runtime backing the notifier has shut down
    #[error("host runtime has shut down")]
    RuntimeShutdown,
}

/// "Call me back once at the next opportunity"
pub trait HostNotifier: Send + Sync {
    /// Registers a one-shot callback, replacing any pending one
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError`] when the host cannot deliver opportunities.
    fn request_opportunity(&self, callback: OpportunityCallback) -> Result<(), NotifierError>;

    /// Drops any pending registration without invoking it
    fn cancel(&self);

    /// Implementation name, for logs
    fn name(&self) -> &'static str;
}

/// Notifier driven by the embedder's own event loop
///
/// The host calls [`fire_idle`](Self::fire_idle) or
/// [`fire_frame`](Self::fire_frame) when it has time to spare.
#[derive(Default)]
pub struct ManualNotifier {
    pending: Mutex<Option<OpportunityCallback>>,
    requests: AtomicU64,
}

impl ManualNotifier {
    /// Notifier with nothing pending
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `opportunity` to the pending callback; `false` if none
    pub fn fire(&self, opportunity: Opportunity) -> bool {
        // Take it out first: the callback usually re-registers
        let callback = self.pending.lock().take();
        match callback {
            Some(callback) => {
                callback(opportunity);
                true
            }
            None => false,
        }
    }

    /// Delivers an idle opportunity
    pub fn fire_idle(&self) -> bool {
        self.fire(Opportunity::Idle)
    }

    /// Delivers a frame opportunity
    pub fn fire_frame(&self, timestamp: Instant) -> bool {
        self.fire(Opportunity::Frame { timestamp })
    }

    /// Whether a callback is registered
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Registrations received so far
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl HostNotifier for ManualNotifier {
    fn request_opportunity(&self, callback: OpportunityCallback) -> Result<(), NotifierError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        *self.pending.lock() = Some(callback);
        Ok(())
    }

    fn cancel(&self) {
        // Drop outside the lock
        let stale = self.pending.lock().take();
        drop(stale);
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

impl fmt::Debug for ManualNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualNotifier")
            .field("pending", &self.is_pending())
            .field("requests", &self.request_count())
            .finish()
    }
}

/// Notifier for hosts with no opportunity source
///
/// Every registration fails; the backlog only moves through
/// `Scheduler::drain_now`.
#[derive(Debug, Clone, Default)]
pub struct UnavailableNotifier {
    reason: String,
}

impl UnavailableNotifier {
    /// Notifier failing with `reason`
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl HostNotifier for UnavailableNotifier {
    fn request_opportunity(&self, _callback: OpportunityCallback) -> Result<(), NotifierError> {
        let reason = if self.reason.is_empty() {
            "no opportunity source".to_string()
        } else {
            self.reason.clone()
        };
        Err(NotifierError::Unavailable(reason))
    }

    fn cancel(&self) {}

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_latest_registration_wins() {
        let notifier = ManualNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&hits);
        notifier
            .request_opportunity(Box::new(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let second = Arc::clone(&hits);
        notifier
            .request_opportunity(Box::new(move |_| {
                second.fetch_add(10, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(notifier.fire_idle());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(notifier.request_count(), 2);
    }

    #[test]
    fn test_fire_without_pending() {
        let notifier = ManualNotifier::new();
        assert!(!notifier.fire_idle());
        assert!(!notifier.fire_frame(Instant::now()));
    }

    #[test]
    fn test_cancel_drops_pending() {
        let notifier = ManualNotifier::new();
        notifier.request_opportunity(Box::new(|_| panic!("cancelled callback ran"))).unwrap();
        assert!(notifier.is_pending());

        notifier.cancel();
        assert!(!notifier.is_pending());
        assert!(!notifier.fire_idle());
    }

    #[test]
    fn test_frame_timestamp_delivered() {
        let notifier = ManualNotifier::new();
        let seen = Arc::new(Mutex::new(None));
        let ts = Instant::now();

        let slot = Arc::clone(&seen);
        notifier
            .request_opportunity(Box::new(move |opportunity| {
                *slot.lock() = Some(opportunity);
            }))
            .unwrap();
        notifier.fire_frame(ts);

        assert_eq!(*seen.lock(), Some(Opportunity::Frame { timestamp: ts }));
    }

    #[test]
    fn test_callback_may_reregister() {
        let notifier = Arc::new(ManualNotifier::new());

        let again = Arc::clone(&notifier);
        notifier
            .request_opportunity(Box::new(move |_| {
                again.request_opportunity(Box::new(|_| {})).unwrap();
            }))
            .unwrap();

        assert!(notifier.fire_idle());
        assert!(notifier.is_pending());
    }

    #[test]
    fn test_unavailable_notifier() {
        let notifier = UnavailableNotifier::new("headless");
        let err = notifier.request_opportunity(Box::new(|_| {})).unwrap_err();
        assert_eq!(err, NotifierError::Unavailable("headless".into()));
        assert_eq!(err.to_string(), "host notifier unavailable: headless");
    }
}
