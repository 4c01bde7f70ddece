#![forbid(unsafe_code)]
#![allow(clippy::inline_always)] /* Called once per unit on the drain path */

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group

/* Unit lifecycle hooks for instrumentation */

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::work_unit::{Priority, UnitError, WorkUnit};

/// How one execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Action returned `Ok`
    Succeeded,
    /// Action returned an error
    Failed,
    /// Action panicked
    Panicked,
}

impl ExecutionOutcome {
    pub(crate) fn of(result: &Result<(), UnitError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(err) if err.is_panic() => Self::Panicked,
            Err(_) => Self::Failed,
        }
    }
}

/// Execution hook interface.
///
/// Hooks run on the scheduling thread inside the pass and count against its
/// budget; keep them cheap.
pub trait ExecutionHooks: Send + Sync {
    /// Called before running a unit.
    fn before_execute(&self, unit: &WorkUnit);

    /// Called after running a unit.
    fn after_execute(&self, unit: &WorkUnit, outcome: ExecutionOutcome, duration: Duration);

    /// Called when a failed unit is re-enqueued; `unit` already carries its new priority.
    fn on_retry(&self, unit: &WorkUnit, from: Priority);

    /// Called when a unit is given up on, before its failure callback.
    fn on_drop(&self, unit: &WorkUnit, error: &UnitError);
}

/// No-op `ExecutionHooks`
#[derive(Debug, Default)]
pub struct NullHooks;

impl ExecutionHooks for NullHooks {
    #[inline(always)]
    fn before_execute(&self, _unit: &WorkUnit) {}

    #[inline(always)]
    fn after_execute(&self, _unit: &WorkUnit, _outcome: ExecutionOutcome, _duration: Duration) {}

    #[inline(always)]
    fn on_retry(&self, _unit: &WorkUnit, _from: Priority) {}

    #[inline(always)]
    fn on_drop(&self, _unit: &WorkUnit, _error: &UnitError) {}
}

/// Hook registry using RwLock for safe concurrent access
pub struct HookRegistry {
    hooks: RwLock<Option<Arc<dyn ExecutionHooks>>>,
}

impl HookRegistry {
    /// Create empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(None),
        }
    }

    /// Install hooks, returning the previous set
    pub fn set_hooks(&self, hooks: Arc<dyn ExecutionHooks>) -> Option<Arc<dyn ExecutionHooks>> {
        self.hooks.write().replace(hooks)
    }

    /// Remove hooks
    pub fn clear_hooks(&self) -> Option<Arc<dyn ExecutionHooks>> {
        self.hooks.write().take()
    }

    /* Clone out the current hooks so no lock is held while they run */
    #[inline(always)]
    fn current(&self) -> Option<Arc<dyn ExecutionHooks>> {
        self.hooks.read().clone()
    }

    /// Pre-execute hook
    #[inline(always)]
    pub fn before_execute(&self, unit: &WorkUnit) {
        if let Some(hooks) = self.current() {
            hooks.before_execute(unit);
        }
    }

    /// Post-execute hook
    #[inline(always)]
    pub fn after_execute(&self, unit: &WorkUnit, outcome: ExecutionOutcome, duration: Duration) {
        if let Some(hooks) = self.current() {
            hooks.after_execute(unit, outcome, duration);
        }
    }

    /// Retry hook
    #[inline(always)]
    pub fn on_retry(&self, unit: &WorkUnit, from: Priority) {
        if let Some(hooks) = self.current() {
            hooks.on_retry(unit, from);
        }
    }

    /// Drop hook
    #[inline(always)]
    pub fn on_drop(&self, unit: &WorkUnit, error: &UnitError) {
        if let Some(hooks) = self.current() {
            hooks.on_drop(unit, error);
        }
    }

    /// Check if hooks installed
    #[inline]
    pub fn has_hooks(&self) -> bool {
        self.hooks.read().is_some()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("has_hooks", &self.has_hooks())
            .finish()
    }
}
