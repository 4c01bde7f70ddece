//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Bounded record of recent successful executions

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::work_unit::{Priority, UnitId};

/// One successful execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSample {
    /// Unit that ran
    pub unit_id: UnitId,
    /// Priority it ran at
    pub priority: Priority,
    /// Time spent inside the action
    pub execution: Duration,
    /// Time from (re-)enqueue to execution start
    pub wait: Duration,
    /// Scheduler clock reading when it finished
    pub finished_at: Duration,
}

#[derive(Debug)]
struct Ring {
    samples: VecDeque<ExecutionSample>,
    capacity: usize,
}

/// Most recent N samples; the oldest is evicted first
#[derive(Debug)]
pub struct ExecutionHistory {
    ring: Mutex<Ring>,
}

impl ExecutionHistory {
    /// History holding at most `capacity` samples (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                samples: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Appends a sample, evicting the oldest when full
    pub fn record(&self, sample: ExecutionSample) {
        let mut ring = self.ring.lock();
        if ring.samples.len() == ring.capacity {
            ring.samples.pop_front();
        }
        ring.samples.push_back(sample);
    }

    /// Changes capacity, dropping the oldest samples if it shrinks
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut ring = self.ring.lock();
        while ring.samples.len() > capacity {
            ring.samples.pop_front();
        }
        ring.capacity = capacity;
    }

    /// Samples currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().samples.len()
    }

    /// Whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum samples held
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    /// Copy of the samples, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<ExecutionSample> {
        self.ring.lock().samples.iter().copied().collect()
    }

    /// Mean execution and wait time in milliseconds, `(0.0, 0.0)` when empty
    #[must_use]
    pub fn averages_ms(&self) -> (f64, f64) {
        let ring = self.ring.lock();
        let n = ring.samples.len();
        if n == 0 {
            return (0.0, 0.0);
        }

        let (exec, wait) = ring
            .samples
            .iter()
            .fold((0.0, 0.0), |(e, w), s| (e + as_ms(s.execution), w + as_ms(s.wait)));
        (exec / n as f64, wait / n as f64)
    }

    /// Drops every sample
    pub fn clear(&self) {
        self.ring.lock().samples.clear();
    }
}

#[inline]
fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u64, exec_ms: u64, wait_ms: u64) -> ExecutionSample {
        ExecutionSample {
            unit_id: UnitId(id),
            priority: Priority::Normal,
            execution: Duration::from_millis(exec_ms),
            wait: Duration::from_millis(wait_ms),
            finished_at: Duration::ZERO,
        }
    }

    #[test]
    fn test_bounded_eviction() {
        let history = ExecutionHistory::new(3);
        for id in 0..5 {
            history.record(sample(id, 1, 1));
        }

        let ids: Vec<u64> = history.snapshot().iter().map(|s| s.unit_id.0).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_averages() {
        let history = ExecutionHistory::new(10);
        assert_eq!(history.averages_ms(), (0.0, 0.0));

        history.record(sample(1, 2, 10));
        history.record(sample(2, 4, 20));

        let (exec, wait) = history.averages_ms();
        assert!((exec - 3.0).abs() < 1e-9);
        assert!((wait - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_shrink_capacity() {
        let history = ExecutionHistory::new(5);
        for id in 0..5 {
            history.record(sample(id, 1, 1));
        }

        history.set_capacity(2);
        assert_eq!(history.capacity(), 2);
        let ids: Vec<u64> = history.snapshot().iter().map(|s| s.unit_id.0).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let history = ExecutionHistory::new(0);
        history.record(sample(1, 1, 1));
        history.record(sample(2, 1, 1));
        assert_eq!(history.len(), 1);
    }
}
