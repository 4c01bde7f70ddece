//! Tokio host notifiers for the idle-pulse scheduler
//!
//! Two ways for a Tokio application to hand the scheduler opportunities:
//!
//! - [`TokioIdleNotifier`] fires once the runtime has let other ready tasks
//!   run, approximating "the event loop went idle".
//! - [`TokioFrameNotifier`] fires at the next boundary of a fixed frame
//!   interval, carrying the frame's start time.
//!
//! Both keep at most one registration pending; a new request replaces the
//! previous one and `cancel` aborts it. Callbacks run on a runtime worker, so
//! units should stay short (the scheduler's budget bounds each pass).
//!
//! # Examples
//!
//! ```rust
//! use idle_pulse::{Priority, Scheduler, SchedulerConfig};
//! use idle_pulse::load_probe::FixedLoadProbe;
//! use idle_pulse_tokio::TokioIdleNotifier;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let notifier = Arc::new(TokioIdleNotifier::try_current().unwrap());
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     notifier,
//!     Arc::new(FixedLoadProbe::neutral()),
//! )
//! .unwrap();
//!
//! let done = Arc::new(tokio::sync::Notify::new());
//! let signal = Arc::clone(&done);
//! scheduler.set_queue_empty_listener(move || signal.notify_one());
//!
//! scheduler.enqueue(Priority::Normal, || Ok(()));
//! done.notified().await;
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

// Re-export core types
pub use idle_pulse::{
    HostNotifier, NotifierError, Opportunity, OpportunityCallback, Priority, Scheduler,
    SchedulerConfig, WorkUnit,
};

/// 60 frames per second
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_nanos(16_666_667);

/// Shortest accepted frame interval
pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct SlotState {
    seq: u64,
    task: Option<AbortHandle>,
}

/* At most one pending task; a task only fires if its sequence is still current */
#[derive(Debug, Default)]
struct PendingSlot {
    state: Mutex<SlotState>,
}

impl PendingSlot {
    fn replace<S>(&self, spawn: S)
    where
        S: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut state = self.state.lock();
        state.seq = state.seq.wrapping_add(1);
        if let Some(previous) = state.task.take() {
            previous.abort();
        }
        let handle = spawn(state.seq);
        state.task = Some(handle.abort_handle());
    }

    fn claim(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        if state.seq != seq {
            return false;
        }
        state.task = None;
        true
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.seq = state.seq.wrapping_add(1);
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    fn is_pending(&self) -> bool {
        self.state.lock().task.is_some()
    }
}

#[derive(Debug)]
struct Registrar {
    handle: Handle,
    slot: Arc<PendingSlot>,
    closed: AtomicBool,
}

impl Registrar {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            slot: Arc::new(PendingSlot::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn register<F>(&self, callback: OpportunityCallback, wait: F) -> Result<(), NotifierError>
    where
        F: Future<Output = Opportunity> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(NotifierError::RuntimeShutdown);
        }

        let slot = Arc::clone(&self.slot);
        self.slot.replace(|seq| {
            self.handle.spawn(async move {
                let opportunity = wait.await;
                if slot.claim(seq) {
                    callback(opportunity);
                }
            })
        });
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slot.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!("Tokio notifier closed");
    }
}

fn current_handle() -> Result<Handle, NotifierError> {
    Handle::try_current().map_err(|e| NotifierError::Unavailable(e.to_string()))
}

/// Fires [`Opportunity::Idle`] after the runtime has run other ready tasks
#[derive(Debug)]
pub struct TokioIdleNotifier {
    registrar: Registrar,
}

impl TokioIdleNotifier {
    /// Notifier spawning onto `handle`
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            registrar: Registrar::new(handle),
        }
    }

    /// Notifier on the current runtime
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::Unavailable`] outside a Tokio runtime.
    pub fn try_current() -> Result<Self, NotifierError> {
        current_handle().map(Self::new)
    }

    /// Rejects further registrations with [`NotifierError::RuntimeShutdown`]
    ///
    /// Call during runtime shutdown so the scheduler stops arming.
    pub fn close(&self) {
        self.registrar.close();
    }

    /// Whether a registration is waiting to fire
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.registrar.slot.is_pending()
    }
}

impl HostNotifier for TokioIdleNotifier {
    fn request_opportunity(&self, callback: OpportunityCallback) -> Result<(), NotifierError> {
        self.registrar.register(callback, async {
            tokio::task::yield_now().await;
            Opportunity::Idle
        })
    }

    fn cancel(&self) {
        self.registrar.slot.cancel();
    }

    fn name(&self) -> &'static str {
        "tokio-idle"
    }
}

/// Fires [`Opportunity::Frame`] at the next frame boundary
///
/// Boundaries are multiples of the frame interval counted from the
/// notifier's creation, so consecutive registrations stay on the same grid.
#[derive(Debug)]
pub struct TokioFrameNotifier {
    registrar: Registrar,
    frame_interval: Duration,
    origin: Instant,
}

impl TokioFrameNotifier {
    /// Notifier ticking every `frame_interval` (at least [`MIN_FRAME_INTERVAL`])
    #[must_use]
    pub fn new(handle: Handle, frame_interval: Duration) -> Self {
        Self {
            registrar: Registrar::new(handle),
            frame_interval: frame_interval.max(MIN_FRAME_INTERVAL),
            origin: Instant::now(),
        }
    }

    /// Notifier on the current runtime
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::Unavailable`] outside a Tokio runtime.
    pub fn try_current(frame_interval: Duration) -> Result<Self, NotifierError> {
        current_handle().map(|handle| Self::new(handle, frame_interval))
    }

    /// Notifier at `fps` frames per second on the current runtime
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::Unavailable`] outside a Tokio runtime.
    pub fn with_fps(fps: u32) -> Result<Self, NotifierError> {
        Self::try_current(Duration::from_secs(1) / fps.max(1))
    }

    /// Interval between frames
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Rejects further registrations with [`NotifierError::RuntimeShutdown`]
    pub fn close(&self) {
        self.registrar.close();
    }

    /// Whether a registration is waiting to fire
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.registrar.slot.is_pending()
    }

    fn next_frame(&self) -> Instant {
        let now = Instant::now();
        let interval = self.frame_interval.as_nanos();
        let frames = now.saturating_duration_since(self.origin).as_nanos() / interval + 1;

        u64::try_from(frames * interval)
            .ok()
            .and_then(|nanos| self.origin.checked_add(Duration::from_nanos(nanos)))
            .unwrap_or(now + self.frame_interval)
    }
}

impl HostNotifier for TokioFrameNotifier {
    fn request_opportunity(&self, callback: OpportunityCallback) -> Result<(), NotifierError> {
        let deadline = self.next_frame();

        #[cfg(feature = "tracing")]
        tracing::trace!(
            in_us = deadline.saturating_duration_since(Instant::now()).as_micros() as u64,
            "Waiting for next frame"
        );

        self.registrar.register(callback, async move {
            tokio::time::sleep_until(deadline).await;
            Opportunity::Frame {
                timestamp: deadline.into_std(),
            }
        })
    }

    fn cancel(&self) {
        self.registrar.slot.cancel();
    }

    fn name(&self) -> &'static str {
        "tokio-frame"
    }
}
