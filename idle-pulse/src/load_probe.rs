//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! System load sampling for adaptive time slices
//!
//! A [`LoadProbe`] reports a coarse busy-ness (0-100, CPU-like) and pressure
//! (0.0-1.0, memory-like) reading. Probes never fail: when the operating
//! system cannot be queried they report [`LoadSample::NEUTRAL`], which keeps
//! the time-slice controller on its base budget.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Default number of raw readings averaged into one smoothed sample
pub const DEFAULT_SMOOTHING_WINDOW: usize = 8;

/// One smoothed load reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// CPU-like busy-ness, 0-100
    pub busy: f32,
    /// Memory-like pressure, 0.0-1.0
    pub pressure: f32,
}

impl LoadSample {
    /// Reading that maps to the normal budget tier
    pub const NEUTRAL: LoadSample = LoadSample {
        busy: 50.0,
        pressure: 0.5,
    };

    /// Creates a sample, clamping both values into range
    ///
    /// Non-finite inputs fall back to the neutral value for that field.
    #[must_use]
    pub fn new(busy: f32, pressure: f32) -> Self {
        let busy = if busy.is_finite() { busy.clamp(0.0, 100.0) } else { Self::NEUTRAL.busy };
        let pressure = if pressure.is_finite() {
            pressure.clamp(0.0, 1.0)
        } else {
            Self::NEUTRAL.pressure
        };
        Self { busy, pressure }
    }
}

impl Default for LoadSample {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Source of load readings
pub trait LoadProbe: Send + Sync {
    /// Current smoothed reading; never fails
    fn sample(&self) -> LoadSample;

    /// Most recent reading without taking a new one
    fn last_sample(&self) -> LoadSample;

    /// Implementation name, for logs
    fn name(&self) -> &'static str;
}

/// Sliding window for smoothing readings
#[derive(Debug)]
struct SlidingWindow {
    /// Ring buffer for samples
    samples: Vec<f64>,
    /// Current position in ring buffer
    position: usize,
    /// Number of samples collected
    count: usize,
}

impl SlidingWindow {
    fn new(window_size: usize) -> Self {
        Self {
            samples: vec![0.0; window_size.max(1)],
            position: 0,
            count: 0,
        }
    }

    fn add_sample(&mut self, value: f64) {
        self.samples[self.position] = value;
        self.position = (self.position + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().take(self.count).sum();
        sum / self.count as f64
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Smoothed busy and pressure readings
#[derive(Debug)]
struct Smoother {
    busy: SlidingWindow,
    pressure: SlidingWindow,
}

impl Smoother {
    fn new(window: usize) -> Self {
        Self {
            busy: SlidingWindow::new(window),
            pressure: SlidingWindow::new(window),
        }
    }

    /* A CPU reading taken before the counters have a full interval is discarded */
    fn push(&mut self, raw: LoadSample, cpu_ready: bool) -> LoadSample {
        if cpu_ready {
            self.busy.add_sample(f64::from(raw.busy));
        }
        self.pressure.add_sample(f64::from(raw.pressure));

        let busy = if self.busy.is_empty() {
            LoadSample::NEUTRAL.busy
        } else {
            self.busy.average() as f32
        };
        LoadSample::new(busy, self.pressure.average() as f32)
    }
}

#[derive(Debug)]
struct SamplerState {
    system: System,
    smoother: Smoother,
    /// When the CPU counters were first read
    primed_at: Instant,
    last_refresh: Option<Instant>,
}

/// Probe backed by `sysinfo` global CPU usage and RAM usage
///
/// The OS is queried at most once per refresh interval (never faster than
/// sysinfo's minimum CPU update interval); calls in between return the
/// cached smoothed reading.
pub struct SystemLoadProbe {
    state: Option<Mutex<SamplerState>>,
    last: AtomicCell<LoadSample>,
    refresh_interval: Duration,
}

impl SystemLoadProbe {
    /// Probe with the default smoothing window
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_SMOOTHING_WINDOW)
    }

    /// Probe averaging the last `window` readings
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        let state = sysinfo::IS_SUPPORTED_SYSTEM.then(|| {
            let system = System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                    .with_memory(MemoryRefreshKind::nothing().with_ram()),
            );
            Mutex::new(SamplerState {
                system,
                smoother: Smoother::new(window),
                primed_at: Instant::now(),
                last_refresh: None,
            })
        });

        #[cfg(feature = "tracing")]
        if state.is_none() {
            tracing::warn!("System load sampling unsupported on this platform; using neutral load");
        }

        Self {
            state,
            last: AtomicCell::new(LoadSample::NEUTRAL),
            refresh_interval: sysinfo::MINIMUM_CPU_UPDATE_INTERVAL,
        }
    }

    /// Sets how often the OS is queried; clamped to sysinfo's minimum
    #[must_use]
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self
    }

    /// Whether readings come from the OS rather than the neutral fallback
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.state.is_some()
    }

    fn refresh(state: &mut SamplerState, now: Instant) -> LoadSample {
        state.system.refresh_cpu_usage();
        state.system.refresh_memory();

        let busy = state.system.global_cpu_usage();
        let total = state.system.total_memory();
        let pressure = if total == 0 {
            LoadSample::NEUTRAL.pressure
        } else {
            (state.system.used_memory() as f64 / total as f64) as f32
        };

        // sysinfo needs two refreshes a full interval apart before CPU usage means anything
        let cpu_ready =
            now.duration_since(state.primed_at) >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL;

        // Clamp first so NaN or out-of-range readings never enter the window
        state.smoother.push(LoadSample::new(busy, pressure), cpu_ready)
    }
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SystemLoadProbe {
    fn sample(&self) -> LoadSample {
        let Some(state) = &self.state else {
            return LoadSample::NEUTRAL;
        };

        // Another thread is refreshing; its result is as good as ours
        let Some(mut state) = state.try_lock() else {
            return self.last.load();
        };

        let now = Instant::now();
        let due = state
            .last_refresh
            .map_or(true, |at| now.duration_since(at) >= self.refresh_interval);
        if !due {
            return self.last.load();
        }

        let sample = Self::refresh(&mut state, now);
        state.last_refresh = Some(now);
        self.last.store(sample);

        #[cfg(feature = "tracing")]
        tracing::trace!(busy = sample.busy, pressure = sample.pressure, "Load sampled");

        sample
    }

    fn last_sample(&self) -> LoadSample {
        self.last.load()
    }

    fn name(&self) -> &'static str {
        "sysinfo"
    }
}

impl std::fmt::Debug for SystemLoadProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemLoadProbe")
            .field("supported", &self.is_supported())
            .field("last", &self.last.load())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

/// Probe that reports whatever it was last told
///
/// Used to simulate load, and as a neutral probe for hosts that do not want
/// adaptive behavior tied to the machine.
#[derive(Debug)]
pub struct FixedLoadProbe {
    reading: AtomicCell<LoadSample>,
}

impl FixedLoadProbe {
    /// Probe fixed at the given reading
    #[must_use]
    pub fn new(busy: f32, pressure: f32) -> Self {
        Self {
            reading: AtomicCell::new(LoadSample::new(busy, pressure)),
        }
    }

    /// Probe fixed at [`LoadSample::NEUTRAL`]
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            reading: AtomicCell::new(LoadSample::NEUTRAL),
        }
    }

    /// Changes the reported load
    pub fn set(&self, busy: f32, pressure: f32) {
        self.reading.store(LoadSample::new(busy, pressure));
    }
}

impl Default for FixedLoadProbe {
    fn default() -> Self {
        Self::neutral()
    }
}

impl LoadProbe for FixedLoadProbe {
    fn sample(&self) -> LoadSample {
        self.reading.load()
    }

    fn last_sample(&self) -> LoadSample {
        self.reading.load()
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_clamping() {
        let s = LoadSample::new(150.0, -0.3);
        assert_eq!(s.busy, 100.0);
        assert_eq!(s.pressure, 0.0);

        let nan = LoadSample::new(f32::NAN, f32::INFINITY);
        assert_eq!(nan, LoadSample::NEUTRAL);
    }

    #[test]
    fn test_sliding_window() {
        let mut window = SlidingWindow::new(3);
        assert_eq!(window.average(), 0.0);

        window.add_sample(10.0);
        window.add_sample(20.0);
        assert_eq!(window.average(), 15.0);

        window.add_sample(30.0);
        window.add_sample(40.0); // evicts 10.0
        assert_eq!(window.average(), 30.0);
    }

    #[test]
    fn test_unprimed_cpu_reading_skipped() {
        let mut smoother = Smoother::new(4);

        // First reading after construction: CPU usage is not meaningful yet
        let first = smoother.push(LoadSample::new(0.0, 0.2), false);
        assert_eq!(first.busy, LoadSample::NEUTRAL.busy);
        assert_eq!(first.pressure, 0.2);

        let second = smoother.push(LoadSample::new(70.0, 0.4), true);
        assert_eq!(second.busy, 70.0);
        assert!((second.pressure - 0.3).abs() < 1e-6);

        let third = smoother.push(LoadSample::new(90.0, 0.4), true);
        assert_eq!(third.busy, 80.0);
    }

    #[test]
    fn test_fixed_probe() {
        let probe = FixedLoadProbe::new(90.0, 0.9);
        assert_eq!(probe.sample(), LoadSample::new(90.0, 0.9));

        probe.set(10.0, 0.1);
        assert_eq!(probe.sample(), LoadSample::new(10.0, 0.1));
        assert_eq!(probe.last_sample(), probe.sample());

        assert_eq!(FixedLoadProbe::neutral().sample(), LoadSample::NEUTRAL);
    }

    #[test]
    fn test_system_probe_stays_in_range() {
        let probe = SystemLoadProbe::new();

        for _ in 0..3 {
            let s = probe.sample();
            assert!((0.0..=100.0).contains(&s.busy), "busy out of range: {}", s.busy);
            assert!((0.0..=1.0).contains(&s.pressure), "pressure out of range: {}", s.pressure);
        }
        assert_eq!(probe.last_sample(), probe.last.load());
    }

    #[test]
    fn test_system_probe_caches_between_refreshes() {
        let probe = SystemLoadProbe::new().refresh_interval(Duration::from_secs(3600));
        let first = probe.sample();
        let second = probe.sample();
        assert_eq!(first, second);
    }
}
