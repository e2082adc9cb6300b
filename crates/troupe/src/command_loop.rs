//! # Command Loop
//!
//! The single place where dispatcher state changes. The loop alternates
//! between draining the command channel and sleeping until the next delayed
//! post is due, whichever comes first.
//!
//! Each iteration reads the tick source once. A reading smaller than the last
//! one means the 32-bit counter wrapped; the delay queue then crosses into
//! its next epoch before anything else happens.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

use crate::clock::TickSource;
use crate::completion::Completer;
use crate::delay_queue::WaitKind;
use crate::messages::Command;
use crate::state::{Executor, State};

pub struct CommandLoop<M, X, T> {
    state: State<M, X>,
    commands: UnboundedReceiver<Command<M>>,
    clock: T,
    last_tick: u32,
    shutdown_waiters: Vec<Completer<()>>,
}

/// What is left once the loop has stopped: the finished state, whose
/// executor still has to be joined, and every caller waiting on shutdown.
pub struct LoopExit<M, X> {
    pub state: State<M, X>,
    pub shutdown_waiters: Vec<Completer<()>>,
}

impl<M, X, T> CommandLoop<M, X, T>
where
    M: Send + 'static,
    X: Executor<M>,
    T: TickSource,
{
    pub fn new(state: State<M, X>, commands: UnboundedReceiver<Command<M>>, clock: T) -> Self {
        let last_tick = clock.now();
        Self {
            state,
            commands,
            clock,
            last_tick,
            shutdown_waiters: Vec::new(),
        }
    }

    pub async fn run(mut self) -> LoopExit<M, X> {
        info!("Command loop starting");

        loop {
            let now = self.tick();
            let (wait, kind) = self.state.next_wait(now);
            if wait == 0 && kind == WaitKind::NextEvent {
                let delivered = self.state.deliver_due();
                trace!("Delivered {} delayed message(s)", delivered);
                continue;
            }

            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        warn!("Command channel closed; shutting down");
                        self.state.shutdown();
                        break;
                    };
                    if self.handle(command) {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(u64::from(wait))) => {
                    trace!("Woke after {}ms ({:?})", wait, kind);
                }
            }
        }

        self.reject_pending();
        self.state.finish();
        info!("Command loop stopped: {}", self.state.stats());

        LoopExit {
            state: self.state,
            shutdown_waiters: self.shutdown_waiters,
        }
    }

    /// Read the tick source, crossing into the next epoch if it wrapped.
    fn tick(&mut self) -> u32 {
        let now = self.clock.now();
        if now < self.last_tick {
            debug!("Tick counter wrapped ({} -> {})", self.last_tick, now);
            self.state.cross_epoch();
        }
        self.last_tick = now;
        now
    }

    /// Apply one command. Returns true when the loop should stop.
    fn handle(&mut self, command: Command<M>) -> bool {
        trace!("Command loop received: {}", command.to_log());

        match command {
            Command::AddObject {
                handler,
                response_tx,
            } => {
                let id = self.state.add_object(handler);
                response_tx.complete(id);
                false
            }
            Command::RemoveObject { id, response_tx } => {
                self.state.remove_object(id);
                response_tx.complete(());
                false
            }
            Command::PostMessage {
                id,
                message,
                response_tx,
            } => {
                let accepted = self.state.post_message(id, message);
                match response_tx {
                    Some(tx) => {
                        tx.complete(accepted);
                    }
                    None if !accepted => debug!("Bridged post to {} was rejected", id),
                    None => {}
                }
                false
            }
            Command::PostMessageLater {
                delay,
                id,
                message,
                on_cancel,
            } => {
                let now = self.tick();
                self.state
                    .post_message_later(now, delay, id, message, on_cancel);
                false
            }
            Command::MessageComplete { id, slot, handler } => {
                self.state.message_complete(id, slot, handler)
            }
            Command::GetStats { response_tx } => {
                response_tx.complete(self.state.stats());
                false
            }
            Command::Shutdown { response_tx } => {
                self.shutdown_waiters.push(response_tx);
                self.state.shutdown()
            }
            Command::Wake => false,
        }
    }

    /// Close the channel and answer whatever was sent after the loop decided
    /// to stop.
    fn reject_pending(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            debug!("Rejecting late command: {}", command.to_log());
            match command {
                Command::PostMessage {
                    response_tx: Some(tx),
                    ..
                } => {
                    tx.complete(false);
                }
                Command::PostMessageLater { on_cancel, .. } => {
                    self.state.executor_mut().defer(on_cancel);
                }
                Command::GetStats { response_tx } => {
                    response_tx.complete(self.state.stats());
                }
                Command::Shutdown { response_tx } => {
                    self.shutdown_waiters.push(response_tx);
                }
                Command::RemoveObject { response_tx, .. } => {
                    response_tx.complete(());
                }
                Command::MessageComplete { id, handler, .. } => {
                    warn!("Completion for {} arrived after shutdown", id);
                    drop(handler);
                }
                // dropping the completer reports Stopped
                Command::AddObject { .. } | Command::PostMessage { .. } | Command::Wake => {}
            }
        }
    }
}
