//! # Worker Pool
//!
//! A fixed set of OS threads, one per worker slot. The state machine hands a
//! [`Job`] to a specific slot; the worker runs `handle` and posts a
//! `MessageComplete` command back, returning the handler. Workers never touch
//! dispatcher state directly.
//!
//! Cancellation callbacks run on a separate callback thread so they can
//! never re-enter the dispatcher.

use std::cell::Cell;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, debug_span, error, info};

use crate::delay_queue::OnCancel;
use crate::errors::SystemError;
use crate::messages::Command;
use crate::state::{Executor, Job, WorkerSlot};

thread_local! {
    static ON_POOL: Cell<bool> = const { Cell::new(false) };
}

/// True when called from inside a handler's `handle` or a cancellation
/// callback. The dispatcher joins these threads before it answers
/// `Shutdown`.
pub(crate) fn on_pool_thread() -> bool {
    ON_POOL.with(Cell::get)
}

fn mark_pool_thread() {
    ON_POOL.with(|flag| flag.set(true));
}

pub struct WorkerPool<M> {
    senders: Vec<UnboundedSender<Job<M>>>,
    threads: Vec<JoinHandle<()>>,
    callbacks: CallbackRunner,
}

impl<M> WorkerPool<M>
where
    M: Send + 'static,
{
    /// Start `workers` threads named `<name>-worker-<slot>` plus the callback
    /// thread.
    pub fn spawn(
        workers: usize,
        name: &str,
        commands: UnboundedSender<Command<M>>,
    ) -> Result<Self, SystemError> {
        let callbacks = CallbackRunner::spawn(name)?;
        let mut senders = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for slot in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let commands = commands.clone();
            let thread = thread::Builder::new()
                .name(format!("{}-worker-{}", name, slot))
                .spawn(move || run_worker(slot, rx, commands))?;
            senders.push(tx);
            threads.push(thread);
        }

        info!("Started {} worker(s)", workers);
        Ok(Self {
            senders,
            threads,
            callbacks,
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Stop every worker and the callback thread, waiting for queued
    /// callbacks to run.
    pub fn join(self) {
        let Self {
            senders,
            threads,
            callbacks,
        } = self;
        drop(senders);
        for (slot, thread) in threads.into_iter().enumerate() {
            if thread.join().is_err() {
                error!("Worker {} terminated by a panic in a handler", slot);
            }
        }
        callbacks.join();
        debug!("Worker pool joined");
    }
}

impl<M> Executor<M> for WorkerPool<M>
where
    M: Send + 'static,
{
    fn execute(&mut self, slot: WorkerSlot, job: Job<M>) {
        let Some(sender) = self.senders.get(slot) else {
            error!("No worker in slot {}; dropping job for {}", slot, job.id);
            return;
        };
        if let Err(e) = sender.send(job) {
            error!("Worker {} is gone; dropping job for {}", slot, e.0.id);
        }
    }

    fn defer(&mut self, callback: OnCancel) {
        self.callbacks.run(callback);
    }
}

fn run_worker<M: Send + 'static>(
    slot: WorkerSlot,
    mut jobs: UnboundedReceiver<Job<M>>,
    commands: UnboundedSender<Command<M>>,
) {
    mark_pool_thread();
    debug!("Worker {} started", slot);
    while let Some(Job {
        id,
        message,
        mut handler,
    }) = jobs.blocking_recv()
    {
        {
            let span = debug_span!("handle", object = %id, worker = slot);
            let _entered = span.enter();
            handler.handle(message);
        }

        if commands
            .send(Command::MessageComplete { id, slot, handler })
            .is_err()
        {
            error!("Worker {} could not report completion for {}", slot, id);
            break;
        }
    }
    debug!("Worker {} stopped", slot);
}

/// Runs cancellation callbacks in submission order on a dedicated thread.
pub struct CallbackRunner {
    sender: UnboundedSender<OnCancel>,
    thread: JoinHandle<()>,
}

impl CallbackRunner {
    pub fn spawn(name: &str) -> Result<Self, SystemError> {
        let (sender, mut callbacks) = mpsc::unbounded_channel::<OnCancel>();
        let thread = thread::Builder::new()
            .name(format!("{}-callbacks", name))
            .spawn(move || {
                mark_pool_thread();
                while let Some(callback) = callbacks.blocking_recv() {
                    callback();
                }
            })?;
        Ok(Self { sender, thread })
    }

    pub fn run(&self, callback: OnCancel) {
        if let Err(e) = self.sender.send(callback) {
            // The runner died in an earlier callback; keep the exactly-once
            // promise with a one-off thread.
            error!("Callback thread is gone; running cancellation on a fresh thread");
            let callback = e.0;
            let spawned = thread::Builder::new().spawn(move || {
                mark_pool_thread();
                callback()
            });
            if let Err(e) = spawned {
                error!("Failed to run cancellation callback: {}", e);
            }
        }
    }

    /// Run whatever is queued, then stop.
    pub fn join(self) {
        drop(self.sender);
        if self.thread.join().is_err() {
            error!("Callback thread terminated by a panic in a cancellation callback");
        }
    }
}
