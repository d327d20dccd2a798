//! Queues for tasks waiting on a free unit.
//!
//! `PriorityScheduler` dequeues the highest priority first and keeps FIFO
//! order within a priority. `FifoScheduler` ignores priority entirely.

use std::collections::{HashMap, VecDeque};

/// Anything that can be ordered by the priority scheduler.
pub trait Prioritized {
    /// Higher runs first.
    fn priority(&self) -> i32;
}

pub trait Scheduler<T>: Send {
    fn enqueue(&mut self, item: T);
    fn dequeue(&mut self) -> Option<T>;
    fn peek(&self) -> Option<&T>;
    fn len(&self) -> usize;
    fn clear(&mut self) -> Vec<T>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which queue discipline a pool uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingPolicy {
    #[default]
    Priority,
    Fifo,
}

impl SchedulingPolicy {
    pub fn build<T: Prioritized + Send + 'static>(self) -> Box<dyn Scheduler<T>> {
        match self {
            Self::Priority => Box::new(PriorityScheduler::new()),
            Self::Fifo => Box::new(FifoScheduler::new()),
        }
    }
}

/// One FIFO bucket per distinct priority plus a descending index of priorities.
pub struct PriorityScheduler<T> {
    buckets: HashMap<i32, VecDeque<T>>,
    /// Priorities with a non-empty bucket, highest first.
    order: Vec<i32>,
    len: usize,
}

impl<T> Default for PriorityScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityScheduler<T> {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            order: Vec::new(),
            len: 0,
        }
    }
}

impl<T: Prioritized + Send> Scheduler<T> for PriorityScheduler<T> {
    fn enqueue(&mut self, item: T) {
        let priority = item.priority();
        let bucket = self.buckets.entry(priority).or_default();
        if bucket.is_empty() {
            // Descending: search with reversed comparison.
            if let Err(pos) = self.order.binary_search_by(|p| priority.cmp(p)) {
                self.order.insert(pos, priority);
            }
        }
        bucket.push_back(item);
        self.len += 1;
    }

    fn dequeue(&mut self) -> Option<T> {
        let priority = *self.order.first()?;
        let bucket = self.buckets.get_mut(&priority)?;
        let item = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(&priority);
            self.order.remove(0);
        }
        if item.is_some() {
            self.len -= 1;
        }
        item
    }

    fn peek(&self) -> Option<&T> {
        let priority = self.order.first()?;
        self.buckets.get(priority)?.front()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for priority in self.order.drain(..) {
            if let Some(bucket) = self.buckets.remove(&priority) {
                drained.extend(bucket);
            }
        }
        self.buckets.clear();
        self.len = 0;
        drained
    }
}

pub struct FifoScheduler<T> {
    queue: VecDeque<T>,
}

impl<T> Default for FifoScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FifoScheduler<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T: Send> Scheduler<T> for FifoScheduler<T> {
    fn enqueue(&mut self, item: T) {
        self.queue.push_back(item);
    }

    fn dequeue(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    fn peek(&self) -> Option<&T> {
        self.queue.front()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn clear(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }
}
