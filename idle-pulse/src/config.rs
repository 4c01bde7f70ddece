//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Scheduler configuration, validation and presets

#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Default per-opportunity budget in milliseconds
pub const DEFAULT_BASE_BUDGET_MS: u64 = 8;
/// Default budget ceiling when the system is idle
pub const DEFAULT_MAX_BUDGET_MS: u64 = 16;
/// Default number of execution samples retained
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Rejected configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A zero base budget would never start a unit
    #[error("base budget must be greater than zero")]
    ZeroBaseBudget,

    /// The base budget must not exceed the idle ceiling
    #[error("base budget {base}ms exceeds max budget {max}ms")]
    BaseExceedsMax {
        /// Requested base budget in milliseconds
        base: u64,
        /// Requested max budget in milliseconds
        max: u64,
    },

    /// History must hold at least one sample
    #[error("history capacity must be greater than zero")]
    ZeroHistoryCapacity,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Budget under normal load
    pub base_budget_ms: u64,
    /// Budget when the system is idle
    pub max_budget_ms: u64,
    /// Whether the budget follows system load
    pub adaptive_enabled: bool,
    /// Execution samples kept for statistics
    pub history_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_budget_ms: DEFAULT_BASE_BUDGET_MS,
            max_budget_ms: DEFAULT_MAX_BUDGET_MS,
            adaptive_enabled: true,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Starts a builder from the defaults
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    /// Checks `0 < base <= max` and a non-empty history
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_budget_ms == 0 {
            return Err(ConfigError::ZeroBaseBudget);
        }
        if self.base_budget_ms > self.max_budget_ms {
            return Err(ConfigError::BaseExceedsMax {
                base: self.base_budget_ms,
                max: self.max_budget_ms,
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistoryCapacity);
        }
        Ok(())
    }

    /// Base budget as a duration
    #[inline]
    #[must_use]
    pub fn base_budget(&self) -> Duration {
        Duration::from_millis(self.base_budget_ms)
    }

    /// Max budget as a duration
    #[inline]
    #[must_use]
    pub fn max_budget(&self) -> Duration {
        Duration::from_millis(self.max_budget_ms)
    }
}

/// Builder for [`SchedulerConfig`]
///
/// ```
/// use idle_pulse::config::SchedulerConfig;
///
/// let config = SchedulerConfig::builder()
///     .base_budget_ms(4)
///     .max_budget_ms(10)
///     .adaptive(false)
///     .build()
///     .expect("valid config");
/// assert_eq!(config.base_budget_ms, 4);
///
/// assert!(SchedulerConfig::builder().base_budget_ms(0).build().is_err());
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Builder seeded with [`SchedulerConfig::default`]
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    /// Builder seeded with a preset
    pub fn from_profile(profile: ConfigProfile) -> Self {
        Self {
            config: profile.create_config(),
        }
    }

    /// Set base budget
    pub fn base_budget_ms(mut self, ms: u64) -> Self {
        self.config.base_budget_ms = ms;
        self
    }

    /// Set max budget
    pub fn max_budget_ms(mut self, ms: u64) -> Self {
        self.config.max_budget_ms = ms;
        self
    }

    /// Enable or disable load-adaptive budgets
    pub fn adaptive(mut self, enabled: bool) -> Self {
        self.config.adaptive_enabled = enabled;
        self
    }

    /// Set history capacity
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Validate and finish
    ///
    /// # Errors
    ///
    /// See [`SchedulerConfig::validate`].
    pub fn build(self) -> Result<SchedulerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Preset configurations for common hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigProfile {
    /// Idle-slot executor: runs whenever the host reports spare time
    ///
    /// 8ms base, 16ms when idle, adaptive.
    IdleSlot,

    /// Frame-budget splitter: shares a frame with rendering
    ///
    /// 8ms base, 12ms ceiling so a 60Hz frame keeps headroom, adaptive,
    /// two seconds of history at 60 frames per second.
    FrameBudget,

    /// Priority-queue splitter: fixed slices for throughput-oriented hosts
    ///
    /// 16ms base and 32ms ceiling, non-adaptive.
    PriorityQueue,

    /// Defaults, meant to be customized through the builder
    Custom,
}

impl ConfigProfile {
    /// Creates a config for this profile
    #[must_use]
    pub fn create_config(self) -> SchedulerConfig {
        match self {
            ConfigProfile::IdleSlot | ConfigProfile::Custom => SchedulerConfig::default(),
            ConfigProfile::FrameBudget => SchedulerConfig {
                base_budget_ms: 8,
                max_budget_ms: 12,
                adaptive_enabled: true,
                history_capacity: 120,
            },
            ConfigProfile::PriorityQueue => SchedulerConfig {
                base_budget_ms: 16,
                max_budget_ms: 32,
                adaptive_enabled: false,
                history_capacity: DEFAULT_HISTORY_CAPACITY,
            },
        }
    }

    /// Human-readable summary
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            ConfigProfile::IdleSlot => {
                "Idle-slot execution with an 8ms base budget stretching to 16ms on an idle system. \
                 Best for background work behind an event loop."
            }
            ConfigProfile::FrameBudget => {
                "Frame-budget splitting with an 8ms base and a 12ms ceiling. \
                 Best for work interleaved with rendering."
            }
            ConfigProfile::PriorityQueue => {
                "Fixed 16ms slices regardless of load. \
                 Best for throughput-oriented hosts with predictable opportunities."
            }
            ConfigProfile::Custom => {
                "Default settings intended as a starting point for the builder."
            }
        }
    }

    /// All profiles
    #[must_use]
    pub fn all_profiles() -> &'static [ConfigProfile] {
        &[
            ConfigProfile::IdleSlot,
            ConfigProfile::FrameBudget,
            ConfigProfile::PriorityQueue,
            ConfigProfile::Custom,
        ]
    }
}
