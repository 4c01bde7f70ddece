//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
/* Per-opportunity time budget policy */

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::SchedulerConfig;
use crate::load_probe::{LoadProbe, LoadSample};

/// Busy-ness above which the budget is halved.
pub const SATURATED_BUSY: f32 = 80.0;

/// Pressure above which the budget is halved.
pub const SATURATED_PRESSURE: f32 = 0.8;

/// Busy-ness below which the budget may grow to the max.
pub const IDLE_BUSY: f32 = 30.0;

/// Pressure below which the budget may grow to the max.
pub const IDLE_PRESSURE: f32 = 0.5;

/// Which rule produced a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetTier {
    /// System saturated: half the base budget
    Saturated,
    /// Neither saturated nor idle: the base budget
    Normal,
    /// System idle: the max budget
    Idle,
    /// Adaptive sizing disabled: the base budget
    Fixed,
}

impl BudgetTier {
    /// Lowercase name, used for logs and metric labels
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Saturated => "saturated",
            Self::Normal => "normal",
            Self::Idle => "idle",
            Self::Fixed => "fixed",
        }
    }
}

impl fmt::Display for BudgetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Budget for one opportunity plus how it was chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSlice {
    /// Time allowed for starting units
    pub budget: Duration,
    /// Rule that produced the budget
    pub tier: BudgetTier,
    /// Load reading used, `None` when adaptive sizing is off
    pub sample: Option<LoadSample>,
}

#[derive(Debug, Clone, Copy)]
struct SliceSettings {
    base: Duration,
    max: Duration,
    adaptive: bool,
}

impl From<&SchedulerConfig> for SliceSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            base: config.base_budget(),
            max: config.max_budget(),
            adaptive: config.adaptive_enabled,
        }
    }
}

/// Three-tier budget policy
///
/// Deliberately coarse: no hysteresis, so a reading that straddles a
/// threshold can flip tiers between consecutive opportunities.
pub struct TimeSliceController {
    settings: RwLock<SliceSettings>,
    probe: Arc<dyn LoadProbe>,
}

impl TimeSliceController {
    /// Controller for an already-validated config
    #[must_use]
    pub fn new(config: &SchedulerConfig, probe: Arc<dyn LoadProbe>) -> Self {
        Self {
            settings: RwLock::new(SliceSettings::from(config)),
            probe,
        }
    }

    /// Budget for the next opportunity
    #[inline]
    pub fn compute_budget(&self) -> Duration {
        self.compute_slice().budget
    }

    /// Budget for the next opportunity, with the tier and reading behind it
    pub fn compute_slice(&self) -> TimeSlice {
        let settings = *self.settings.read();

        if !settings.adaptive {
            return TimeSlice {
                budget: settings.base,
                tier: BudgetTier::Fixed,
                sample: None,
            };
        }

        let sample = self.probe.sample();
        let tier = classify(sample);
        let budget = match tier {
            BudgetTier::Saturated => settings.base / 2,
            BudgetTier::Idle => settings.max,
            BudgetTier::Normal | BudgetTier::Fixed => settings.base,
        };

        TimeSlice {
            budget,
            tier,
            sample: Some(sample),
        }
    }

    /// Swaps base, max and adaptive mode; the config must already be validated
    pub fn update(&self, config: &SchedulerConfig) {
        *self.settings.write() = SliceSettings::from(config);
    }

    /// Whether budgets follow load
    #[must_use]
    pub fn is_adaptive(&self) -> bool {
        self.settings.read().adaptive
    }

    /// The probe backing adaptive sizing
    #[must_use]
    pub fn probe(&self) -> &Arc<dyn LoadProbe> {
        &self.probe
    }
}

impl fmt::Debug for TimeSliceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSliceController")
            .field("settings", &*self.settings.read())
            .field("probe", &self.probe.name())
            .finish()
    }
}

/* Saturation wins over idleness; both thresholds are strict */
fn classify(sample: LoadSample) -> BudgetTier {
    if sample.busy > SATURATED_BUSY || sample.pressure > SATURATED_PRESSURE {
        BudgetTier::Saturated
    } else if sample.busy < IDLE_BUSY && sample.pressure < IDLE_PRESSURE {
        BudgetTier::Idle
    } else {
        BudgetTier::Normal
    }
}
