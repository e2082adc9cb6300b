#![allow(dead_code)]

use std::sync::mpsc::{Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};
use troupe::{ActorSystem, Handler, ObjectId, Runtime, SystemConfig, TickSource};

/// Upper bound on how long any test waits for something to happen.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn config(workers: usize) -> SystemConfig {
    SystemConfig::default()
        .with_workers(workers)
        .with_thread_name("test")
}

pub fn start<M: Send + 'static>(workers: usize) -> Runtime<M> {
    Runtime::start(config(workers)).expect("runtime starts")
}

pub fn start_with_clock<M, T>(workers: usize, clock: T) -> Runtime<M>
where
    M: Send + 'static,
    T: TickSource,
{
    Runtime::start_with_clock(config(workers), clock).expect("runtime starts")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<M> {
    Welcome(ObjectId),
    Handle(ObjectId, M),
    Dispose(ObjectId),
}

/// Reports every lifecycle call on a channel, optionally sleeping inside
/// `handle` to keep the object busy.
pub struct Reporter<M> {
    id: Option<ObjectId>,
    events: Sender<Event<M>>,
    pause: Duration,
}

impl<M> Reporter<M> {
    pub fn new(events: Sender<Event<M>>) -> Self {
        Self::pausing(events, Duration::ZERO)
    }

    pub fn pausing(events: Sender<Event<M>>, pause: Duration) -> Self {
        Self {
            id: None,
            events,
            pause,
        }
    }

    fn id(&self) -> ObjectId {
        self.id.expect("welcome runs before anything else")
    }
}

impl<M: Send + 'static> Handler<M> for Reporter<M> {
    fn welcome(&mut self, _system: &ActorSystem<M>, id: ObjectId) {
        self.id = Some(id);
        let _ = self.events.send(Event::Welcome(id));
    }

    fn handle(&mut self, message: M) {
        if !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
        let _ = self.events.send(Event::Handle(self.id(), message));
    }

    fn dispose(&mut self) {
        let _ = self.events.send(Event::Dispose(self.id()));
    }
}

pub fn next_event<M>(events: &Receiver<Event<M>>) -> Event<M> {
    events
        .recv_timeout(TIMEOUT)
        .expect("event within the timeout")
}

/// Collect events until `count` have arrived.
pub fn collect<M>(events: &Receiver<Event<M>>, count: usize) -> Vec<Event<M>> {
    (0..count).map(|_| next_event(events)).collect()
}

/// Poll `condition` until it holds or the timeout passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
