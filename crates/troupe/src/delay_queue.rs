//! # Delay Queue
//!
//! Holds messages scheduled for future delivery against a wrapping 32-bit
//! tick counter.
//!
//! Entries are split at insertion time into two buckets: `queue` holds
//! entries due before the counter next wraps, `post_wrap` holds entries whose
//! due tick overflowed past `u32::MAX`. Nothing is ever re-compared against
//! the clock across a wrap. Once `queue` has been fully drained and the
//! counter wraps, `wrap` swaps the buckets and flips the epoch flag.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::id::ObjectId;

/// Callback run exactly once when a delayed message will never be delivered.
pub type OnCancel = Box<dyn FnOnce() + Send + 'static>;

/// Longest single wait the queue reports, in ticks.
pub const MAX_WAIT: u32 = 0x7FFF_FFFF;

/// What the command loop should do once a computed wait elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// The earliest entry is due after the wait.
    NextEvent,
    /// Nothing is due within `MAX_WAIT`; sleep and recompute.
    LongWait,
    /// No entry is due before the counter wraps; wake at the wrap to flip epochs.
    Wrap,
}

/// A Post scheduled for later, together with its cancellation callback.
pub struct DelayedMessage<M> {
    pub dest: ObjectId,
    pub message: M,
    pub on_cancel: OnCancel,
}

impl<M: fmt::Debug> fmt::Debug for DelayedMessage<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedMessage")
            .field("dest", &self.dest)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

type Bucket<M> = BTreeMap<u32, Vec<DelayedMessage<M>>>;

pub struct DelayQueue<M> {
    /// Entries due in the current epoch
    queue: Bucket<M>,
    /// Entries due after the next wrap
    post_wrap: Bucket<M>,
    /// Epoch of `queue`; `post_wrap` is always the opposite
    epoch: bool,
    /// Outstanding (due, epoch) pairs per destination
    index: HashMap<ObjectId, HashSet<(u32, bool)>>,
    len: usize,
}

impl<M> DelayQueue<M> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            post_wrap: BTreeMap::new(),
            epoch: false,
            index: HashMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of outstanding entries addressed to `dest`.
    pub fn pending_for(&self, dest: ObjectId) -> usize {
        self.index
            .get(&dest)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.bucket(key.1).get(&key.0))
                    .flatten()
                    .filter(|entry| entry.dest == dest)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Schedule `message` for `dest`, due `delay` ticks after `now`.
    pub fn add(&mut self, now: u32, delay: u32, dest: ObjectId, message: M, on_cancel: OnCancel) {
        let due = now.wrapping_add(delay);
        let epoch = if due >= now { self.epoch } else { !self.epoch };

        self.bucket_mut(epoch)
            .entry(due)
            .or_default()
            .push(DelayedMessage {
                dest,
                message,
                on_cancel,
            });
        self.index.entry(dest).or_default().insert((due, epoch));
        self.len += 1;
    }

    /// How long until something needs attention at tick `now`.
    pub fn compute_wait(&self, now: u32) -> (u32, WaitKind) {
        match self.queue.keys().next() {
            Some(&due) if due <= now => (0, WaitKind::NextEvent),
            Some(&due) => {
                let distance = due - now;
                if distance > MAX_WAIT {
                    (MAX_WAIT, WaitKind::LongWait)
                } else {
                    (distance, WaitKind::NextEvent)
                }
            }
            None => {
                let distance = (1u64 << 32) - u64::from(now);
                if distance > u64::from(MAX_WAIT) {
                    (MAX_WAIT, WaitKind::LongWait)
                } else {
                    (distance as u32, WaitKind::Wrap)
                }
            }
        }
    }

    /// Remove and return every entry sharing the earliest due tick of the
    /// current epoch. Empty when the current epoch has nothing left.
    pub fn get_next_and_remove(&mut self) -> Vec<DelayedMessage<M>> {
        let Some((due, batch)) = self.queue.pop_first() else {
            return Vec::new();
        };
        let key = (due, self.epoch);
        for entry in &batch {
            if let Some(keys) = self.index.get_mut(&entry.dest) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.index.remove(&entry.dest);
                }
            }
        }
        self.len -= batch.len();
        batch
    }

    /// Remove every entry addressed to `dest` and hand back their
    /// cancellation callbacks. The caller must run them off the dispatcher
    /// thread.
    pub fn cancel_all(&mut self, dest: ObjectId) -> Vec<OnCancel> {
        let Some(keys) = self.index.remove(&dest) else {
            return Vec::new();
        };
        let current = self.epoch;
        let mut keys: Vec<(u32, bool)> = keys.into_iter().collect();
        // current epoch first, then by due tick
        keys.sort_by_key(|&(due, epoch)| (epoch != current, due));

        let mut callbacks = Vec::new();
        for (due, epoch) in keys {
            let bucket = self.bucket_mut(epoch);
            let Some(entries) = bucket.get_mut(&due) else {
                continue;
            };
            let (cancelled, kept): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|entry| entry.dest == dest);
            if kept.is_empty() {
                bucket.remove(&due);
            } else {
                *entries = kept;
            }
            callbacks.extend(cancelled.into_iter().map(|entry| entry.on_cancel));
        }
        self.len -= callbacks.len();
        callbacks
    }

    /// Swap in the next epoch once the counter has wrapped.
    ///
    /// ## Panics
    ///
    /// Panics if the current epoch still holds entries; the command loop must
    /// deliver them before allowing the wrap.
    pub fn wrap(&mut self) {
        assert!(
            self.queue.is_empty(),
            "delay queue wrapped with {} due tick(s) undelivered",
            self.queue.len()
        );
        std::mem::swap(&mut self.queue, &mut self.post_wrap);
        self.epoch = !self.epoch;
    }

    /// Remove everything, current epoch first, in due order.
    pub fn drain_all(&mut self) -> Vec<DelayedMessage<M>> {
        let mut out = Vec::with_capacity(self.len);
        for (_, batch) in std::mem::take(&mut self.queue) {
            out.extend(batch);
        }
        for (_, batch) in std::mem::take(&mut self.post_wrap) {
            out.extend(batch);
        }
        self.index.clear();
        self.len = 0;
        out
    }

    fn bucket(&self, epoch: bool) -> &Bucket<M> {
        if epoch == self.epoch {
            &self.queue
        } else {
            &self.post_wrap
        }
    }

    fn bucket_mut(&mut self, epoch: bool) -> &mut Bucket<M> {
        if epoch == self.epoch {
            &mut self.queue
        } else {
            &mut self.post_wrap
        }
    }
}

impl<M> Default for DelayQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for DelayQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayQueue")
            .field("queue_ticks", &self.queue.len())
            .field("post_wrap_ticks", &self.post_wrap.len())
            .field("epoch", &self.epoch)
            .field("len", &self.len)
            .finish()
    }
}
