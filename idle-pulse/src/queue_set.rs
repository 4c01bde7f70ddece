//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Per-priority FIFO backlog
//!
//! One queue per [`Priority`] level behind a single mutex. The lock is held
//! for a push, a pop or a clear, never while a unit runs. Producers may call
//! [`PriorityQueueSet::enqueue`] from any thread; draining happens on the
//! scheduling thread.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::ops::Index;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::work_unit::{Priority, WorkUnit};

/// Queue depth per priority level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths([usize; Priority::COUNT]);

impl QueueDepths {
    /// Depth of one level
    #[inline]
    #[must_use]
    pub fn get(&self, priority: Priority) -> usize {
        self.0[priority.index()]
    }

    /// Sum across levels
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// `(level, depth)` pairs in drain order
    pub fn iter(&self) -> impl Iterator<Item = (Priority, usize)> + '_ {
        Priority::ALL.iter().map(|p| (*p, self.0[p.index()]))
    }

    /// Depths as an ordered map
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<Priority, usize> {
        self.iter().collect()
    }
}

impl Index<Priority> for QueueDepths {
    type Output = usize;

    fn index(&self, priority: Priority) -> &usize {
        &self.0[priority.index()]
    }
}

/// Counters for queue monitoring
#[derive(Debug, Default)]
pub struct QueueSetMetrics {
    /// Units currently queued
    pub total_queued: AtomicUsize,
    /// Units ever enqueued
    pub total_enqueued: AtomicU64,
    /// Units ever popped
    pub total_popped: AtomicU64,
    /// Units discarded by `clear`
    pub total_discarded: AtomicU64,
    /// High water mark for queue depth
    pub queue_depth_high_water: AtomicUsize,
}

impl QueueSetMetrics {
    /// Record current queue depth
    pub fn record_queue_depth(&self, depth: usize) {
        self.total_queued.store(depth, Ordering::Relaxed);

        let mut current = self.queue_depth_high_water.load(Ordering::Relaxed);
        while depth > current {
            match self.queue_depth_high_water.compare_exchange_weak(
                current,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current = x,
            }
        }
    }
}

#[derive(Debug, Default)]
struct Levels {
    queues: [VecDeque<WorkUnit>; Priority::COUNT],
    len: usize,
}

/// Strict-priority queue set
///
/// `pop_next` always serves the most urgent non-empty level; within a level
/// units come out in insertion order.
#[derive(Debug, Default)]
pub struct PriorityQueueSet {
    levels: Mutex<Levels>,
    metrics: QueueSetMetrics,
}

impl PriorityQueueSet {
    /// Creates an empty queue set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a unit to the tail of its priority level
    pub fn enqueue(&self, unit: WorkUnit) {
        let depth = {
            let mut levels = self.levels.lock();
            levels.queues[unit.priority().index()].push_back(unit);
            levels.len += 1;
            levels.len
        };

        self.metrics.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_queue_depth(depth);
    }

    /// Removes the head of the most urgent non-empty level
    pub fn pop_next(&self) -> Option<WorkUnit> {
        let (unit, depth) = {
            let mut levels = self.levels.lock();
            let unit = levels.queues.iter_mut().find_map(VecDeque::pop_front)?;
            levels.len -= 1;
            (unit, levels.len)
        };

        self.metrics.total_popped.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_queued.store(depth, Ordering::Relaxed);
        Some(unit)
    }

    /// Snapshot of per-level depths
    #[must_use]
    pub fn size_by_level(&self) -> QueueDepths {
        let levels = self.levels.lock();
        let mut depths = [0; Priority::COUNT];
        for (depth, queue) in depths.iter_mut().zip(levels.queues.iter()) {
            *depth = queue.len();
        }
        QueueDepths(depths)
    }

    /// Drops every queued unit without running callbacks; returns how many
    pub fn clear(&self) -> usize {
        let drained: Vec<VecDeque<WorkUnit>> = {
            let mut levels = self.levels.lock();
            levels.len = 0;
            levels.queues.iter_mut().map(std::mem::take).collect()
        };
        self.metrics.total_queued.store(0, Ordering::Relaxed);

        // Units (and their captured state) are dropped outside the lock
        let discarded: usize = drained.iter().map(VecDeque::len).sum();
        self.metrics.total_discarded.fetch_add(discarded as u64, Ordering::Relaxed);
        discarded
    }

    /// Units currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.lock().len
    }

    /// Whether every level is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest depth observed
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.metrics.queue_depth_high_water.load(Ordering::Relaxed)
    }

    /// Queue counters
    #[must_use]
    pub fn metrics(&self) -> &QueueSetMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_unit::UnitId;

    fn unit(priority: Priority) -> WorkUnit {
        WorkUnit::new(priority, || Ok(()))
    }

    #[test]
    fn test_enqueue_dequeue_basic() {
        let queue = PriorityQueueSet::new();
        assert!(queue.is_empty());
        assert!(queue.pop_next().is_none());

        let u = unit(Priority::Normal);
        let id = u.id();
        queue.enqueue(u);

        assert_eq!(queue.len(), 1);
        let popped = queue.pop_next().expect("queued unit");
        assert_eq!(popped.id(), id);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_priority_ordering() {
        let queue = PriorityQueueSet::new();

        // Enqueue least urgent first
        for priority in Priority::ALL.iter().rev() {
            queue.enqueue(unit(*priority));
        }

        let order: Vec<Priority> = std::iter::from_fn(|| queue.pop_next())
            .map(|u| u.priority())
            .collect();
        assert_eq!(order, Priority::ALL.to_vec());
    }

    #[test]
    fn test_fifo_within_level() {
        let queue = PriorityQueueSet::new();
        let mut expected: Vec<UnitId> = Vec::new();

        for _ in 0..10 {
            let u = unit(Priority::Low);
            expected.push(u.id());
            queue.enqueue(u);
        }

        let actual: Vec<UnitId> = std::iter::from_fn(|| queue.pop_next()).map(|u| u.id()).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_size_by_level() {
        let queue = PriorityQueueSet::new();
        queue.enqueue(unit(Priority::Critical));
        queue.enqueue(unit(Priority::Normal));
        queue.enqueue(unit(Priority::Normal));
        queue.enqueue(unit(Priority::Background));

        let depths = queue.size_by_level();
        assert_eq!(depths.get(Priority::Critical), 1);
        assert_eq!(depths[Priority::High], 0);
        assert_eq!(depths[Priority::Normal], 2);
        assert_eq!(depths[Priority::Background], 1);
        assert_eq!(depths.total(), 4);
        assert_eq!(depths.to_map().len(), Priority::COUNT);
    }

    #[test]
    fn test_clear_discards_everything() {
        let queue = PriorityQueueSet::new();
        for priority in Priority::ALL {
            queue.enqueue(unit(priority));
        }

        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.size_by_level().total(), 0);

        // Second clear is a no-op
        assert_eq!(queue.clear(), 0);
        assert_eq!(queue.metrics().total_discarded.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_metrics_tracking() {
        let queue = PriorityQueueSet::new();
        for _ in 0..3 {
            queue.enqueue(unit(Priority::High));
        }
        let _ = queue.pop_next();

        let metrics = queue.metrics();
        assert_eq!(metrics.total_enqueued.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.total_popped.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_queued.load(Ordering::Relaxed), 2);
        assert_eq!(queue.high_water_mark(), 3);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = std::sync::Arc::new(PriorityQueueSet::new());

        std::thread::scope(|scope| {
            for t in 0..4 {
                let queue = &queue;
                scope.spawn(move || {
                    for i in 0..250 {
                        let priority = Priority::ALL[(t + i) % Priority::COUNT];
                        queue.enqueue(unit(priority));
                    }
                });
            }
        });

        assert_eq!(queue.len(), 1000);
        let mut popped = 0;
        let mut last = Priority::Critical;
        while let Some(u) = queue.pop_next() {
            assert!(u.priority() >= last, "priority went backwards");
            last = u.priority();
            popped += 1;
        }
        assert_eq!(popped, 1000);
    }
}
