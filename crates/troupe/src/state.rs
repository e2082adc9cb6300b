//! # Dispatcher State
//!
//! All bookkeeping about objects lives here and is only ever touched by the
//! command loop thread, so none of it is locked.
//!
//! Every registered object is in exactly one of:
//!
//! * **idle**: no turn in progress, handler parked in the idle map
//! * **busy**: a `handle` call is in flight, or a backlog is waiting for a
//!   worker; the handler is out on a worker or parked in the busy entry
//! * **busy + dying**: removed while busy; the backlog drains, then the
//!   handler is disposed
//!
//! An idle object can also be dying for as long as posts it accepted are
//! still sitting in the global queue.
//!
//! Per-object FIFO order follows from two rules. A busy object's new posts
//! go to its own backlog, and while any post for an object is waiting in the
//! global queue, newer posts to that object queue behind it there too.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::delay_queue::{DelayQueue, DelayedMessage, OnCancel, WaitKind};
use crate::handler::Handler;
use crate::id::{IdAllocator, ObjectId};
use crate::metrics::DispatcherStats;
use crate::priority_queue::StablePriorityQueue;
use crate::system::ActorSystem;

/// Index of one worker execution context.
pub type WorkerSlot = usize;

/// One `handle` call handed to a worker. The handler travels with the
/// message and comes back in the completion command.
pub struct Job<M> {
    pub id: ObjectId,
    pub message: M,
    pub handler: Box<dyn Handler<M>>,
}

/// Where the state machine sends work that must not run on the dispatcher
/// thread.
pub trait Executor<M> {
    /// Start `job` on worker `slot`. The slot has already been claimed.
    fn execute(&mut self, slot: WorkerSlot, job: Job<M>);

    /// Run a cancellation callback somewhere other than the dispatcher thread.
    fn defer(&mut self, callback: OnCancel);
}

enum GlobalToken<M> {
    /// A post accepted for an idle object while every worker was busy
    Post { id: ObjectId, message: M },
    /// A busy object with a backlog waiting for its next turn
    Revisit { id: ObjectId },
}

/// Tokens are served strictly in arrival order.
fn fair_order<M>(_: &GlobalToken<M>, _: &GlobalToken<M>) -> Ordering {
    Ordering::Equal
}

type TokenOrder<M> = fn(&GlobalToken<M>, &GlobalToken<M>) -> Ordering;
type FairQueue<M> = StablePriorityQueue<GlobalToken<M>, TokenOrder<M>>;

struct BusyObject<M> {
    backlog: VecDeque<M>,
    /// Parked here between turns; `None` while a worker holds it
    handler: Option<Box<dyn Handler<M>>>,
}

impl<M> BusyObject<M> {
    fn in_flight() -> Self {
        Self {
            backlog: VecDeque::new(),
            handler: None,
        }
    }

    fn next_turn(&mut self) -> Option<(M, Box<dyn Handler<M>>)> {
        if self.handler.is_none() {
            return None;
        }
        let message = self.backlog.pop_front()?;
        let handler = self.handler.take()?;
        Some((message, handler))
    }
}

pub struct State<M, X> {
    system: ActorSystem<M>,
    executor: X,
    ids: IdAllocator,
    idle: HashMap<ObjectId, Box<dyn Handler<M>>>,
    busy: HashMap<ObjectId, BusyObject<M>>,
    dying: HashSet<ObjectId>,
    global: FairQueue<M>,
    /// How many `Post` tokens per object are waiting in `global`
    queued_posts: HashMap<ObjectId, usize>,
    free_workers: BTreeSet<WorkerSlot>,
    workers: usize,
    delays: DelayQueue<M>,
    shutting_down: bool,
}

impl<M, X> State<M, X>
where
    M: Send + 'static,
    X: Executor<M>,
{
    pub fn new(system: ActorSystem<M>, executor: X, workers: usize) -> Self {
        Self {
            system,
            executor,
            ids: IdAllocator::new(),
            idle: HashMap::new(),
            busy: HashMap::new(),
            dying: HashSet::new(),
            global: StablePriorityQueue::new(fair_order as TokenOrder<M>),
            queued_posts: HashMap::new(),
            free_workers: (0..workers).collect(),
            workers,
            delays: DelayQueue::new(),
            shutting_down: false,
        }
    }

    /// Start id allocation at `next` instead of zero.
    pub fn starting_ids_at(mut self, next: u32) -> Self {
        self.ids = IdAllocator::starting_at(next);
        self
    }

    /// Register `handler` as a new idle object and welcome it.
    pub fn add_object(&mut self, mut handler: Box<dyn Handler<M>>) -> ObjectId {
        let (idle, busy) = (&self.idle, &self.busy);
        let id = self.ids.allocate(|candidate| {
            idle.contains_key(&candidate) || busy.contains_key(&candidate)
        });

        handler.welcome(&self.system, id);
        self.idle.insert(id, handler);
        debug!("Added object {}", id);
        id
    }

    /// Remove an object. Idle objects are disposed at once; busy ones finish
    /// the backlog they already accepted first. Delayed posts to the object
    /// are cancelled.
    ///
    /// ## Panics
    ///
    /// Panics if `id` is not registered. Ids only come from `add_object`, so
    /// an unknown id means the caller removed the same object twice.
    pub fn remove_object(&mut self, id: ObjectId) {
        let registered = self.idle.contains_key(&id) || self.busy.contains_key(&id);
        assert!(registered, "remove_object called for unknown object {}", id);

        for callback in self.delays.cancel_all(id) {
            self.executor.defer(callback);
        }

        if self.busy.contains_key(&id) || self.queued(id) > 0 {
            debug!("Object {} marked dying", id);
            self.dying.insert(id);
        } else if let Some(mut handler) = self.idle.remove(&id) {
            handler.dispose();
            info!("Object {} removed", id);
        }
    }

    /// Accept `message` for `id`. Returns false if the system is shutting
    /// down or the object is unknown or dying.
    pub fn post_message(&mut self, id: ObjectId, message: M) -> bool {
        if !self.accepts(id) {
            debug!("Rejected post to {}", id);
            return false;
        }

        if self.busy.contains_key(&id) {
            if self.queued_posts.contains_key(&id) {
                self.enqueue_post(id, message);
            } else if let Some(entry) = self.busy.get_mut(&id) {
                entry.backlog.push_back(message);
            }
            return true;
        }

        if self.queued(id) == 0 {
            if let Some(slot) = self.free_workers.pop_first() {
                if let Some(handler) = self.idle.remove(&id) {
                    self.start_turn(slot, id, message, handler);
                    return true;
                }
                self.free_workers.insert(slot);
            }
        }
        self.enqueue_post(id, message);
        true
    }

    /// Schedule `message` for `id` at `now + delay`. If the object cannot
    /// accept posts right now the cancellation callback runs instead.
    pub fn post_message_later(
        &mut self,
        now: u32,
        delay: u32,
        id: ObjectId,
        message: M,
        on_cancel: OnCancel,
    ) -> bool {
        if !self.accepts(id) {
            debug!("Rejected delayed post to {}", id);
            self.executor.defer(on_cancel);
            return false;
        }
        self.delays.add(now, delay, id, message, on_cancel);
        true
    }

    /// A worker finished one `handle` call for `id` and handed the handler
    /// back. The freed worker then picks up the next global token, if any.
    ///
    /// Returns true once shutdown has been requested and no worker is busy.
    pub fn message_complete(
        &mut self,
        id: ObjectId,
        slot: WorkerSlot,
        handler: Box<dyn Handler<M>>,
    ) -> bool {
        self.free_workers.insert(slot);

        let has_backlog = self.busy.get(&id).map(|entry| !entry.backlog.is_empty());
        match has_backlog {
            Some(true) => {
                if let Some(entry) = self.busy.get_mut(&id) {
                    entry.handler = Some(handler);
                }
                self.global.push(GlobalToken::Revisit { id });
            }
            Some(false) => {
                self.busy.remove(&id);
                self.settle(id, handler);
            }
            None => {
                warn!("Completion for {} which is not busy", id);
                self.settle(id, handler);
            }
        }

        self.drain_global(slot);
        self.is_finished()
    }

    /// Stop accepting posts. Returns true if no worker is busy.
    pub fn shutdown(&mut self) -> bool {
        if !self.shutting_down {
            info!(
                "Dispatcher shutting down with {} busy worker(s)",
                self.busy_workers()
            );
        }
        self.shutting_down = true;
        self.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.shutting_down && self.busy_workers() == 0
    }

    /// Dispose every remaining handler and cancel every outstanding delayed
    /// post. Called once, after the command loop has stopped.
    pub fn finish(&mut self) {
        for DelayedMessage { on_cancel, .. } in self.delays.drain_all() {
            self.executor.defer(on_cancel);
        }
        for (id, mut handler) in self.idle.drain() {
            handler.dispose();
            debug!("Disposed {} at shutdown", id);
        }
        for (id, entry) in self.busy.drain() {
            if let Some(mut handler) = entry.handler {
                warn!(
                    "Disposing {} with {} undelivered message(s)",
                    id,
                    entry.backlog.len()
                );
                handler.dispose();
            }
        }
        self.dying.clear();
        self.queued_posts.clear();
    }

    /// Wait until the next delayed post needs attention.
    pub fn next_wait(&self, now: u32) -> (u32, WaitKind) {
        self.delays.compute_wait(now)
    }

    /// Post the earliest batch of delayed messages. Posts the destination
    /// refuses are cancelled. Returns the batch size.
    pub fn deliver_due(&mut self) -> usize {
        let batch = self.delays.get_next_and_remove();
        let count = batch.len();
        for DelayedMessage {
            dest,
            message,
            on_cancel,
        } in batch
        {
            if !self.post_message(dest, message) {
                debug!("Delayed post to {} cancelled at delivery", dest);
                self.executor.defer(on_cancel);
            }
        }
        count
    }

    /// The tick counter has wrapped: flush what is left of the current
    /// epoch, then move to the next one.
    pub fn cross_epoch(&mut self) {
        let mut flushed = 0;
        loop {
            let delivered = self.deliver_due();
            if delivered == 0 {
                break;
            }
            flushed += delivered;
        }
        debug!("Tick counter wrapped; flushed {} delayed message(s)", flushed);
        self.delays.wrap();
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            idle: self.idle.len(),
            busy: self.busy.len(),
            dying: self.dying.len(),
            global_queue: self.global.len(),
            delayed: self.delays.len(),
            workers: self.workers,
            busy_workers: self.busy_workers(),
            shutting_down: self.shutting_down,
        }
    }

    pub fn busy_workers(&self) -> usize {
        self.workers - self.free_workers.len()
    }

    pub fn is_idle(&self, id: ObjectId) -> bool {
        self.idle.contains_key(&id)
    }

    pub fn is_busy(&self, id: ObjectId) -> bool {
        self.busy.contains_key(&id)
    }

    pub fn is_dying(&self, id: ObjectId) -> bool {
        self.dying.contains(&id)
    }

    pub fn backlog_len(&self, id: ObjectId) -> usize {
        self.busy.get(&id).map_or(0, |entry| entry.backlog.len())
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut X {
        &mut self.executor
    }

    /// Give up the state once `finish` has run, keeping the executor so its
    /// threads can be joined.
    pub fn into_executor(self) -> X {
        self.executor
    }

    fn accepts(&self, id: ObjectId) -> bool {
        !self.shutting_down
            && !self.dying.contains(&id)
            && (self.idle.contains_key(&id) || self.busy.contains_key(&id))
    }

    fn queued(&self, id: ObjectId) -> usize {
        self.queued_posts.get(&id).copied().unwrap_or(0)
    }

    fn enqueue_post(&mut self, id: ObjectId, message: M) {
        *self.queued_posts.entry(id).or_insert(0) += 1;
        self.global.push(GlobalToken::Post { id, message });
        debug!("Queued post to {} globally ({} waiting)", id, self.global.len());
    }

    fn dequeue_post(&mut self, id: ObjectId) {
        if let Some(count) = self.queued_posts.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.queued_posts.remove(&id);
            }
        }
    }

    fn start_turn(
        &mut self,
        slot: WorkerSlot,
        id: ObjectId,
        message: M,
        handler: Box<dyn Handler<M>>,
    ) {
        self.busy.entry(id).or_insert_with(BusyObject::in_flight);
        debug!("Dispatching {} to worker {}", id, slot);
        self.executor.execute(
            slot,
            Job {
                id,
                message,
                handler,
            },
        );
    }

    /// The object's backlog is empty: dispose it if it is dying and nothing
    /// else is queued for it, otherwise park it as idle.
    fn settle(&mut self, id: ObjectId, mut handler: Box<dyn Handler<M>>) {
        if self.dying.contains(&id) && self.queued(id) == 0 {
            self.dying.remove(&id);
            handler.dispose();
            info!("Object {} removed after draining", id);
        } else {
            self.idle.insert(id, handler);
        }
    }

    fn drain_global(&mut self, slot: WorkerSlot) {
        while self.free_workers.contains(&slot) {
            let Some(token) = self.global.pop() else {
                break;
            };
            match token {
                GlobalToken::Post { id, message } => {
                    self.dequeue_post(id);
                    if let Some(handler) = self.idle.remove(&id) {
                        self.free_workers.remove(&slot);
                        self.start_turn(slot, id, message, handler);
                    } else if let Some(entry) = self.busy.get_mut(&id) {
                        entry.backlog.push_back(message);
                    } else {
                        warn!("Dropping queued post for unknown object {}", id);
                    }
                }
                GlobalToken::Revisit { id } => {
                    match self.busy.get_mut(&id).and_then(BusyObject::next_turn) {
                        Some((message, handler)) => {
                            self.free_workers.remove(&slot);
                            self.start_turn(slot, id, message, handler);
                        }
                        None => warn!("Stale revisit for {}", id),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        id: Option<ObjectId>,
        log: Log,
    }

    impl Probe {
        fn boxed(log: &Log) -> Box<dyn Handler<&'static str>> {
            Box::new(Probe {
                id: None,
                log: log.clone(),
            })
        }

        fn record(&self, event: String) {
            self.log.lock().unwrap().push(event);
        }
    }

    impl Handler<&'static str> for Probe {
        fn welcome(&mut self, _system: &ActorSystem<&'static str>, id: ObjectId) {
            self.id = Some(id);
            self.record(format!("welcome {}", id));
        }

        fn handle(&mut self, message: &'static str) {
            let id = self.id.expect("welcomed");
            self.record(format!("handle {} {}", id, message));
        }

        fn dispose(&mut self) {
            let id = self.id.expect("welcomed");
            self.record(format!("dispose {}", id));
        }
    }

    /// Holds dispatched jobs until the test runs them.
    #[derive(Default)]
    struct Recorder {
        jobs: VecDeque<(WorkerSlot, Job<&'static str>)>,
        deferred: Vec<OnCancel>,
    }

    impl Executor<&'static str> for Recorder {
        fn execute(&mut self, slot: WorkerSlot, job: Job<&'static str>) {
            self.jobs.push_back((slot, job));
        }

        fn defer(&mut self, callback: OnCancel) {
            self.deferred.push(callback);
        }
    }

    type TestState = State<&'static str, Recorder>;

    fn state(workers: usize) -> (TestState, Log) {
        let state = State::new(ActorSystem::disconnected(), Recorder::default(), workers);
        (state, Log::default())
    }

    fn in_flight(state: &TestState) -> Vec<(WorkerSlot, ObjectId, &'static str)> {
        state
            .executor()
            .jobs
            .iter()
            .map(|(slot, job)| (*slot, job.id, job.message))
            .collect()
    }

    /// Run the oldest dispatched job to completion.
    fn run_next(state: &mut TestState) -> bool {
        let (slot, job) = state.executor_mut().jobs.pop_front().expect("a job in flight");
        let Job {
            id,
            message,
            mut handler,
        } = job;
        handler.handle(message);
        state.message_complete(id, slot, handler)
    }

    fn run_all(state: &mut TestState) {
        while !state.executor().jobs.is_empty() {
            run_next(state);
        }
    }

    fn run_deferred(state: &mut TestState) {
        for callback in std::mem::take(&mut state.executor_mut().deferred) {
            callback();
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn counter(count: &Arc<AtomicUsize>) -> OnCancel {
        let count = count.clone();
        Box::new(move || {
            count.fetch_add(1, AtomicOrdering::SeqCst);
        })
    }

    #[test]
    fn test_add_object_welcomes_before_any_message() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let b = state.add_object(Probe::boxed(&log));
        assert_eq!((a, b), (ObjectId::new(0), ObjectId::new(1)));
        assert!(state.is_idle(a));

        assert!(state.post_message(a, "hi"));
        run_all(&mut state);
        assert_eq!(
            entries(&log),
            vec!["welcome #0", "welcome #1", "handle #0 hi"]
        );
        assert!(state.is_idle(a));
    }

    #[test]
    fn test_busy_object_keeps_fifo_backlog() {
        let (mut state, log) = state(4);
        let a = state.add_object(Probe::boxed(&log));

        assert!(state.post_message(a, "m1"));
        assert!(state.is_busy(a));
        assert!(state.post_message(a, "m2"));
        assert!(state.post_message(a, "m3"));
        assert_eq!(state.backlog_len(a), 2);
        // one turn at a time
        assert_eq!(in_flight(&state).len(), 1);

        run_next(&mut state);
        assert_eq!(in_flight(&state).len(), 1);
        run_all(&mut state);

        assert_eq!(
            entries(&log)[1..],
            ["handle #0 m1", "handle #0 m2", "handle #0 m3"]
        );
        assert!(state.is_idle(a));
        assert_eq!(state.busy_workers(), 0);
    }

    #[test]
    fn test_worker_bound() {
        let (mut state, log) = state(2);
        let ids: Vec<_> = (0..3).map(|_| state.add_object(Probe::boxed(&log))).collect();
        for id in &ids {
            assert!(state.post_message(*id, "go"));
        }

        assert_eq!(
            in_flight(&state),
            vec![(0, ids[0], "go"), (1, ids[1], "go")]
        );
        assert_eq!(state.busy_workers(), 2);
        // still idle while its post waits globally
        assert!(state.is_idle(ids[2]));
        assert_eq!(state.stats().global_queue, 1);

        run_next(&mut state);
        assert_eq!(
            in_flight(&state),
            vec![(1, ids[1], "go"), (0, ids[2], "go")]
        );
        assert!(state.is_busy(ids[2]));
        run_all(&mut state);
        assert_eq!(state.busy_workers(), 0);
    }

    #[test]
    fn test_global_queue_preserves_per_object_order() {
        let (mut state, log) = state(1);
        let blocker = state.add_object(Probe::boxed(&log));
        let x = state.add_object(Probe::boxed(&log));

        assert!(state.post_message(blocker, "block"));
        assert!(state.post_message(x, "m1"));
        assert!(state.post_message(x, "m2"));

        // the blocker finishes; x starts m1 while m2 is still queued
        run_next(&mut state);
        assert_eq!(in_flight(&state), vec![(0, x, "m1")]);
        assert!(state.is_busy(x));

        // must not overtake m2
        assert!(state.post_message(x, "m3"));
        assert_eq!(state.backlog_len(x), 0);
        run_all(&mut state);

        let handled: Vec<_> = entries(&log)
            .into_iter()
            .filter(|e| e.starts_with("handle #1"))
            .collect();
        assert_eq!(handled, vec!["handle #1 m1", "handle #1 m2", "handle #1 m3"]);
    }

    #[test]
    fn test_revisit_shares_worker_fairly() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let b = state.add_object(Probe::boxed(&log));

        state.post_message(a, "a1");
        state.post_message(a, "a2");
        state.post_message(b, "b1");

        run_all(&mut state);
        let handled: Vec<_> = entries(&log)
            .into_iter()
            .filter(|e| e.starts_with("handle"))
            .collect();
        // b1 was queued before a's revisit
        assert_eq!(handled, vec!["handle #0 a1", "handle #1 b1", "handle #0 a2"]);
    }

    #[test]
    fn test_remove_idle_disposes_immediately() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        state.remove_object(a);
        assert_eq!(entries(&log), vec!["welcome #0", "dispose #0"]);
        assert!(!state.post_message(a, "late"));
        assert_eq!(state.stats().objects(), 0);
    }

    #[test]
    fn test_remove_busy_drains_before_dispose() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        state.post_message(a, "m1");
        state.post_message(a, "m2");
        state.post_message(a, "m3");

        state.remove_object(a);
        assert!(state.is_busy(a));
        assert!(state.is_dying(a));
        assert!(!state.post_message(a, "rejected"));

        run_all(&mut state);
        assert_eq!(
            entries(&log)[1..],
            ["handle #0 m1", "handle #0 m2", "handle #0 m3", "dispose #0"]
        );
        assert!(!state.is_busy(a) && !state.is_idle(a) && !state.is_dying(a));
    }

    #[test]
    fn test_remove_idle_with_queued_posts_drains_them() {
        let (mut state, log) = state(1);
        let blocker = state.add_object(Probe::boxed(&log));
        let x = state.add_object(Probe::boxed(&log));
        state.post_message(blocker, "block");
        state.post_message(x, "m1");
        state.post_message(x, "m2");

        state.remove_object(x);
        assert!(state.is_idle(x));
        assert!(state.is_dying(x));
        assert!(!state.post_message(x, "m3"));

        run_all(&mut state);
        let tail: Vec<_> = entries(&log).into_iter().skip(3).collect();
        assert_eq!(tail, vec!["handle #1 m1", "handle #1 m2", "dispose #1"]);
        assert!(!state.is_idle(x));
    }

    #[test]
    #[should_panic(expected = "unknown object")]
    fn test_remove_unknown_panics() {
        let (mut state, _log) = state(1);
        state.remove_object(ObjectId::new(77));
    }

    #[test]
    fn test_ids_not_reused_while_live_across_wrap() {
        let (state, log) = state(1);
        let mut state = state.starting_ids_at(u32::MAX - 1);
        let a = state.add_object(Probe::boxed(&log));
        let b = state.add_object(Probe::boxed(&log));
        let c = state.add_object(Probe::boxed(&log));
        let d = state.add_object(Probe::boxed(&log));
        assert_eq!(
            (a, b, c, d),
            (
                ObjectId::new(u32::MAX - 1),
                ObjectId::new(u32::MAX),
                ObjectId::new(0),
                ObjectId::new(1)
            )
        );

        // rewind as if the counter had gone all the way round
        state.remove_object(b);
        state.ids = IdAllocator::starting_at(u32::MAX - 1);
        assert_eq!(state.add_object(Probe::boxed(&log)), b);
        assert_eq!(state.add_object(Probe::boxed(&log)), ObjectId::new(2));
    }

    #[test]
    fn test_shutdown_rejects_posts_and_waits_for_workers() {
        let (mut state, log) = state(2);
        let a = state.add_object(Probe::boxed(&log));
        state.post_message(a, "m1");
        state.post_message(a, "m2");

        assert!(!state.shutdown());
        assert!(!state.post_message(a, "m3"));
        let cancelled = Arc::new(AtomicUsize::new(0));
        assert!(!state.post_message_later(0, 10, a, "later", counter(&cancelled)));
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 1);

        // accepted work still drains
        assert!(!run_next(&mut state));
        assert!(run_next(&mut state));
        assert!(state.is_finished());

        state.finish();
        assert_eq!(
            entries(&log)[1..],
            ["handle #0 m1", "handle #0 m2", "dispose #0"]
        );
    }

    #[test]
    fn test_delay_falling_due_during_shutdown_is_cancelled() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        assert!(state.post_message(a, "job"));
        let cancelled = Arc::new(AtomicUsize::new(0));
        assert!(state.post_message_later(0, 5, a, "late", counter(&cancelled)));

        assert!(!state.shutdown());
        assert_eq!(state.next_wait(5), (0, WaitKind::NextEvent));
        assert_eq!(state.deliver_due(), 1);
        assert_eq!(state.executor().deferred.len(), 1);
        assert_eq!(state.stats().delayed, 0);

        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 1);

        assert!(run_next(&mut state));
        state.finish();
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(entries(&log)[1..], ["handle #0 job", "dispose #0"]);
    }

    #[test]
    fn test_shutdown_when_idle_finishes_at_once() {
        let (mut state, log) = state(2);
        state.add_object(Probe::boxed(&log));
        assert!(state.shutdown());
        state.finish();
        assert_eq!(entries(&log), vec!["welcome #0", "dispose #0"]);
    }

    #[test]
    fn test_delayed_delivery() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let cancelled = Arc::new(AtomicUsize::new(0));
        assert!(state.post_message_later(100, 50, a, "tick", counter(&cancelled)));

        assert_eq!(state.next_wait(100), (50, WaitKind::NextEvent));
        assert_eq!(state.next_wait(150), (0, WaitKind::NextEvent));
        assert_eq!(state.deliver_due(), 1);
        run_all(&mut state);

        assert_eq!(entries(&log)[1..], ["handle #0 tick"]);
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_remove_cancels_delayed_posts_once() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let cancelled = Arc::new(AtomicUsize::new(0));
        state.post_message_later(0, 10, a, "one", counter(&cancelled));
        state.post_message_later(0, 20, a, "two", counter(&cancelled));

        state.remove_object(a);
        // callbacks are deferred, never run inline
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 0);
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 2);

        assert_eq!(state.deliver_due(), 0);
        assert_eq!(entries(&log), vec!["welcome #0", "dispose #0"]);
    }

    #[test]
    fn test_delayed_post_to_unknown_object_is_cancelled() {
        let (mut state, _log) = state(1);
        let cancelled = Arc::new(AtomicUsize::new(0));
        assert!(!state.post_message_later(0, 5, ObjectId::new(9), "x", counter(&cancelled)));
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(state.stats().delayed, 0);
    }

    #[test]
    fn test_remove_busy_cancels_delayed_posts() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let cancelled = Arc::new(AtomicUsize::new(0));
        state.post_message(a, "busy");
        state.post_message_later(0, 1, a, "late", counter(&cancelled));

        // cancel_all on removal already takes the delayed post
        state.remove_object(a);
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(state.deliver_due(), 0);
        run_all(&mut state);
        assert_eq!(entries(&log)[1..], ["handle #0 busy", "dispose #0"]);
    }

    #[test]
    fn test_cross_epoch_flushes_then_wraps() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let noop = || -> OnCancel { Box::new(|| {}) };
        state.post_message_later(0xFFFF_FF00, 0x10, a, "before", noop());
        state.post_message_later(0xFFFF_FF00, 0x200, a, "after", noop());

        state.cross_epoch();
        assert_eq!(state.next_wait(0), (0x100, WaitKind::NextEvent));
        assert_eq!(state.deliver_due(), 1);
        run_all(&mut state);
        assert_eq!(entries(&log)[1..], ["handle #0 before", "handle #0 after"]);
    }

    #[test]
    fn test_finish_cancels_outstanding_delays() {
        let (mut state, log) = state(1);
        let a = state.add_object(Probe::boxed(&log));
        let cancelled = Arc::new(AtomicUsize::new(0));
        state.post_message_later(0, 1000, a, "never", counter(&cancelled));
        assert!(state.shutdown());
        state.finish();
        run_deferred(&mut state);
        assert_eq!(cancelled.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(
            state.stats(),
            DispatcherStats {
                workers: 1,
                shutting_down: true,
                ..Default::default()
            }
        );
    }
}
