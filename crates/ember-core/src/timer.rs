// src/timer.rs
//! Indexed binary min-heap of connection deadlines.
//!
//! Every node carries the id it was registered under, an absolute expiry and
//! a one-shot callback. The side index maps id to heap position so any node
//! can be moved or removed in O(log n); it is rewritten on every swap.
//!
//! Callbacks receive a caller-supplied context (`&mut C`) when they fire,
//! which lets the owner of the heap hand its own state (the connection table,
//! the multiplexer) to the eviction code without the callbacks having to
//! capture it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimeoutCallback<C> = Box<dyn FnOnce(&mut C) + Send>;

struct TimerNode<C> {
    id: usize,
    expires: Instant,
    cb: TimeoutCallback<C>,
}

pub struct TimerHeap<C = ()> {
    heap: Vec<TimerNode<C>>,
    index: HashMap<usize, usize>,
}

impl<C> TimerHeap<C> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.index.contains_key(&id)
    }

    pub fn expiry(&self, id: usize) -> Option<Instant> {
        self.index.get(&id).map(|&i| self.heap[i].expires)
    }

    /// Registers `cb` to fire `timeout` from now. An existing node for `id`
    /// gets the new deadline and callback; its old callback is dropped unfired.
    pub fn add<F>(&mut self, id: usize, timeout: Duration, cb: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.add_at(id, Instant::now() + timeout, cb);
    }

    pub fn add_at<F>(&mut self, id: usize, expires: Instant, cb: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let cb: TimeoutCallback<C> = Box::new(cb);
        match self.index.get(&id) {
            Some(&i) => {
                let node = &mut self.heap[i];
                node.expires = expires;
                node.cb = cb;
                self.reheap(i);
            }
            None => {
                let i = self.heap.len();
                self.heap.push(TimerNode { id, expires, cb });
                self.index.insert(id, i);
                self.sift_up(i);
            }
        }
    }

    /// Moves the deadline of `id` to `timeout` from now, keeping its callback.
    /// Returns `false` if `id` has no timer.
    pub fn adjust(&mut self, id: usize, timeout: Duration) -> bool {
        self.adjust_at(id, Instant::now() + timeout)
    }

    pub fn adjust_at(&mut self, id: usize, expires: Instant) -> bool {
        let Some(&i) = self.index.get(&id) else {
            return false;
        };
        self.heap[i].expires = expires;
        self.reheap(i);
        true
    }

    /// Removes the timer for `id` and fires it right away.
    pub fn do_work(&mut self, id: usize, ctx: &mut C) -> bool {
        let Some(&i) = self.index.get(&id) else {
            return false;
        };
        let node = self.remove_at(i);
        (node.cb)(ctx);
        true
    }

    /// Fires every timer whose deadline has passed.
    pub fn tick(&mut self, ctx: &mut C) -> usize {
        self.tick_at(Instant::now(), ctx)
    }

    pub fn tick_at(&mut self, now: Instant, ctx: &mut C) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.cb)(ctx);
            fired += 1;
        }
        fired
    }

    /// Drops the earliest timer without firing it.
    pub fn pop(&mut self) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0).id)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.heap.clear();
    }

    /// Sweeps expired timers, then reports how long until the next deadline.
    pub fn next_tick(&mut self, ctx: &mut C) -> Option<Duration> {
        self.next_tick_at(Instant::now(), ctx)
    }

    pub fn next_tick_at(&mut self, now: Instant, ctx: &mut C) -> Option<Duration> {
        self.tick_at(now, ctx);
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(now))
    }

    fn remove_at(&mut self, i: usize) -> TimerNode<C> {
        let node = self.heap.swap_remove(i);
        self.index.remove(&node.id);
        if i < self.heap.len() {
            self.index.insert(self.heap[i].id, i);
            self.reheap(i);
        }
        node
    }

    fn reheap(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl<C> Default for TimerHeap<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent<C>(timers: &TimerHeap<C>) {
        assert_eq!(timers.heap.len(), timers.index.len());
        for (i, node) in timers.heap.iter().enumerate() {
            assert_eq!(timers.index[&node.id], i, "index out of sync for {}", node.id);
            if i > 0 {
                assert!(timers.heap[(i - 1) / 2].expires <= node.expires);
            }
        }
    }

    fn record(id: usize) -> impl FnOnce(&mut Vec<usize>) + Send + 'static {
        move |fired: &mut Vec<usize>| fired.push(id)
    }

    #[test]
    fn expired_timer_fires_once_and_leaves_the_heap() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        timers.add_at(7, base + Duration::from_secs(15), record(7));
        assert_eq!(timers.tick_at(base + Duration::from_secs(16), &mut fired), 1);
        assert_eq!(fired, vec![7]);
        assert!(!timers.contains(7));

        assert_eq!(timers.tick_at(base + Duration::from_secs(60), &mut fired), 0);
        assert_eq!(fired, vec![7]);
    }

    #[test]
    fn tick_stops_at_first_live_deadline() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        for (id, secs) in [(1, 30), (2, 10), (3, 20), (4, 40), (5, 5)] {
            timers.add_at(id, base + Duration::from_secs(secs), record(id));
        }
        assert_consistent(&timers);

        timers.tick_at(base + Duration::from_secs(20), &mut fired);
        assert_eq!(fired, vec![5, 2, 3]);
        assert_eq!(timers.len(), 2);
        assert_consistent(&timers);
    }

    #[test]
    fn adjust_postpones_without_firing_stale_deadline() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        timers.add_at(1, base + Duration::from_secs(5), record(1));
        timers.add_at(2, base + Duration::from_secs(10), record(2));
        assert!(timers.adjust_at(1, base + Duration::from_secs(20)));
        assert_consistent(&timers);

        timers.tick_at(base + Duration::from_secs(12), &mut fired);
        assert_eq!(fired, vec![2]);
        assert!(timers.contains(1));

        timers.tick_at(base + Duration::from_secs(20), &mut fired);
        assert_eq!(fired, vec![2, 1]);
    }

    #[test]
    fn adjust_unknown_id_is_rejected() {
        let mut timers: TimerHeap<()> = TimerHeap::new();
        assert!(!timers.adjust(3, Duration::from_secs(1)));
    }

    #[test]
    fn re_adding_replaces_the_callback() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        timers.add_at(1, base + Duration::from_secs(1), |f: &mut Vec<usize>| f.push(100));
        timers.add_at(1, base + Duration::from_secs(2), |f: &mut Vec<usize>| f.push(200));
        assert_eq!(timers.len(), 1);

        timers.tick_at(base + Duration::from_secs(3), &mut fired);
        assert_eq!(fired, vec![200]);
    }

    #[test]
    fn re_adding_earlier_moves_node_up() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        for id in 0..10 {
            timers.add_at(id, base + Duration::from_secs(10 + id as u64), record(id));
        }
        timers.add_at(9, base + Duration::from_secs(1), record(9));
        assert_consistent(&timers);

        timers.tick_at(base + Duration::from_secs(1), &mut fired);
        assert_eq!(fired, vec![9]);
    }

    #[test]
    fn do_work_fires_immediately_from_the_middle() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        for id in 0..16 {
            timers.add_at(id, base + Duration::from_secs(100 - id as u64 * 3), record(id));
        }
        assert!(timers.do_work(6, &mut fired));
        assert!(!timers.do_work(6, &mut fired));
        assert_eq!(fired, vec![6]);
        assert_consistent(&timers);
        assert_eq!(timers.len(), 15);
    }

    #[test]
    fn pop_and_clear_drop_without_firing() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        timers.add_at(1, base + Duration::from_secs(2), record(1));
        timers.add_at(2, base + Duration::from_secs(1), record(2));
        assert_eq!(timers.pop(), Some(2));
        timers.clear();
        assert!(timers.is_empty());
        assert_eq!(timers.pop(), None);

        timers.tick_at(base + Duration::from_secs(10), &mut fired);
        assert!(fired.is_empty());
    }

    #[test]
    fn next_tick_reports_remaining_time() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        assert_eq!(timers.next_tick_at(base, &mut fired), None);
        timers.add_at(1, base + Duration::from_secs(1), record(1));
        timers.add_at(2, base + Duration::from_secs(4), record(2));

        let wait = timers.next_tick_at(base + Duration::from_secs(2), &mut fired);
        assert_eq!(wait, Some(Duration::from_secs(2)));
        assert_eq!(fired, vec![1]);
    }

    #[test]
    fn random_mutations_keep_heap_and_index_in_sync() {
        let mut timers = TimerHeap::new();
        let mut fired = Vec::new();
        let base = Instant::now();

        // Deterministic LCG so the sequence is reproducible.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seed >> 33
        };

        for _ in 0..2_000 {
            let id = (next() % 64) as usize;
            let at = base + Duration::from_millis(next() % 10_000);
            match next() % 4 {
                0 | 1 => timers.add_at(id, at, record(id)),
                2 => {
                    timers.adjust_at(id, at);
                }
                _ => {
                    timers.do_work(id, &mut fired);
                }
            }
            assert_consistent(&timers);
        }

        let before = timers.len();
        let count = timers.tick_at(base + Duration::from_secs(60), &mut fired);
        assert_eq!(count, before);
        assert!(timers.is_empty());
    }
}
