//! # Stable Priority Queue
//!
//! A binary max-heap ordered by a caller-supplied comparator. Items that
//! compare equal pop in the order they were pushed, which is what makes the
//! heap usable as a fair work queue.

use std::cmp::Ordering;
use std::fmt;

struct Stamped<T> {
    stamp: u64,
    item: T,
}

/// Max-heap with insertion-order tie-breaking.
///
/// `compare(a, b)` returning `Ordering::Greater` means `a` pops before `b`.
pub struct StablePriorityQueue<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    heap: Vec<Stamped<T>>,
    compare: C,
    next_stamp: u64,
}

impl<T, C> StablePriorityQueue<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    pub fn new(compare: C) -> Self {
        Self {
            heap: Vec::new(),
            compare,
            next_stamp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The item that the next `pop` would return.
    pub fn peek(&self) -> Option<&T> {
        self.heap.first().map(|s| &s.item)
    }

    pub fn push(&mut self, item: T) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.heap.push(Stamped { stamp, item });
        self.sift_up(self.heap.len() - 1);
    }

    /// Remove and return the greatest item.
    ///
    /// Returns `None` on an empty queue; callers that treat an empty pop as a
    /// broken invariant check `is_empty` first.
    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop().map(|s| s.item);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Drain every item in pop order.
    pub fn drain_ordered(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }

    fn cmp_at(&self, a: usize, b: usize) -> Ordering {
        let (a, b) = (&self.heap[a], &self.heap[b]);
        // earlier stamp wins among equals
        (self.compare)(&a.item, &b.item).then_with(|| b.stamp.cmp(&a.stamp))
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.cmp_at(index, parent) != Ordering::Greater {
                break;
            }
            self.heap.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            if left >= len {
                break;
            }
            let child = if right < len && self.cmp_at(right, left) == Ordering::Greater {
                right
            } else {
                left
            };
            if self.cmp_at(child, index) != Ordering::Greater {
                break;
            }
            self.heap.swap(index, child);
            index = child;
        }
    }
}

impl<T: fmt::Debug, C> fmt::Debug for StablePriorityQueue<T, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StablePriorityQueue")
            .field("len", &self.heap.len())
            .field("next_stamp", &self.next_stamp)
            .finish()
    }
}
