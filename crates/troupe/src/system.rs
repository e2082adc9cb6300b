//! # Actor System
//!
//! The public face of the dispatcher. [`Runtime`] owns the threads;
//! [`ActorSystem`] is the cloneable handle every caller and handler uses to
//! talk to the command loop.
//!
//! Every operation is a command sent over the loop's channel. Blocking
//! operations then wait on a completion token; `_async` variants await the
//! same token from inside a tokio runtime.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info};

use crate::clock::{SystemClock, TickSource};
use crate::command_loop::{CommandLoop, LoopExit};
use crate::completion::{completion, Completer, CompletionToken};
use crate::config::SystemConfig;
use crate::errors::SystemError;
use crate::handler::Handler;
use crate::id::ObjectId;
use crate::messages::Command;
use crate::metrics::DispatcherStats;
use crate::state::State;
use crate::worker::{on_pool_thread, WorkerPool};

/// Handle to a running dispatcher. Cheap to clone; every clone talks to the
/// same command loop.
pub struct ActorSystem<M> {
    commands: UnboundedSender<Command<M>>,
    dispatcher: Arc<OnceLock<ThreadId>>,
}

impl<M> Clone for ActorSystem<M> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<M> fmt::Debug for ActorSystem<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSystem")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl<M> ActorSystem<M>
where
    M: Send + 'static,
{
    /// A handle with no command loop behind it. Every operation fails with
    /// [`SystemError::Stopped`].
    pub fn disconnected() -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            commands,
            dispatcher: Arc::default(),
        }
    }

    /// False once the command loop has stopped.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Registers a handler as a new object.
    ///
    /// ## Purpose
    ///
    /// Allocates a fresh id, calls the handler's `welcome` on the dispatcher
    /// thread and parks the object as idle. The id is returned only after
    /// `welcome` has run.
    ///
    /// ## Parameters
    ///
    /// * `handler` - The object's behavior and private state
    ///
    /// ## Returns
    ///
    /// The new object's id, or [`SystemError::Stopped`] if the dispatcher is
    /// gone. Adding objects after shutdown has been requested still succeeds;
    /// the object just never receives a message.
    pub fn add_object<H>(&self, handler: H) -> Result<ObjectId, SystemError>
    where
        H: Handler<M>,
    {
        self.add_boxed(Box::new(handler))
    }

    pub fn add_boxed(&self, handler: Box<dyn Handler<M>>) -> Result<ObjectId, SystemError> {
        self.blocking(|response_tx| Command::AddObject {
            handler,
            response_tx,
        })
    }

    pub async fn add_object_async<H>(&self, handler: H) -> Result<ObjectId, SystemError>
    where
        H: Handler<M>,
    {
        let handler: Box<dyn Handler<M>> = Box::new(handler);
        self.request(|response_tx| Command::AddObject {
            handler,
            response_tx,
        })?
        .wait_async()
        .await
    }

    /// Removes an object.
    ///
    /// An idle object is disposed before this returns. A busy object stops
    /// accepting posts at once, finishes the messages it already accepted,
    /// and is disposed after its last `handle` call. Delayed posts to the
    /// object are cancelled either way.
    ///
    /// Removing an id that is not registered is a caller bug and stops the
    /// dispatcher.
    pub fn remove_object(&self, id: ObjectId) -> Result<(), SystemError> {
        self.blocking(|response_tx| Command::RemoveObject { id, response_tx })
    }

    pub async fn remove_object_async(&self, id: ObjectId) -> Result<(), SystemError> {
        self.request(|response_tx| Command::RemoveObject { id, response_tx })?
            .wait_async()
            .await
    }

    /// Posts `message` to `id`.
    ///
    /// ## Returns
    ///
    /// `Ok(true)` if the message was accepted and will be handled, in post
    /// order, by the object. `Ok(false)` if the object is unknown, being
    /// removed, or the system is shutting down.
    pub fn post_message(&self, id: ObjectId, message: M) -> Result<bool, SystemError> {
        self.blocking(|response_tx| Command::PostMessage {
            id,
            message,
            response_tx: Some(response_tx),
        })
    }

    pub async fn post_message_async(&self, id: ObjectId, message: M) -> Result<bool, SystemError> {
        self.request(|response_tx| Command::PostMessage {
            id,
            message,
            response_tx: Some(response_tx),
        })?
        .wait_async()
        .await
    }

    /// Posts `message` to `id` once `delay_ms` milliseconds have passed.
    ///
    /// ## Purpose
    ///
    /// Schedules a post without waiting for the dispatcher. Exactly one of
    /// two things eventually happens: the message is posted to the object,
    /// or `on_cancelled` runs. Cancellation happens when the object is
    /// removed first, refuses the post at delivery time, or the system shuts
    /// down. Callbacks run on the runtime's callback thread, or inline on
    /// the caller if the dispatcher has already stopped.
    ///
    /// ## Parameters
    ///
    /// * `delay_ms` - Delay in milliseconds; zero means the next loop turn
    /// * `id` - Destination object
    /// * `message` - The message to deliver
    /// * `on_cancelled` - Runs if the message is never posted
    pub fn post_message_later<F>(
        &self,
        delay_ms: u32,
        id: ObjectId,
        message: M,
        on_cancelled: F,
    ) -> Result<(), SystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        let command = Command::PostMessageLater {
            delay: delay_ms,
            id,
            message,
            on_cancel: Box::new(on_cancelled),
        };
        match self.commands.send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(command)) => {
                debug!("Dispatcher stopped; cancelling delayed post to {}", id);
                if let Command::PostMessageLater { on_cancel, .. } = command {
                    on_cancel();
                }
                Err(SystemError::Stopped)
            }
        }
    }

    pub fn stats(&self) -> Result<DispatcherStats, SystemError> {
        self.blocking(|response_tx| Command::GetStats { response_tx })
    }

    pub async fn stats_async(&self) -> Result<DispatcherStats, SystemError> {
        self.request(|response_tx| Command::GetStats { response_tx })?
            .wait_async()
            .await
    }

    /// Stops accepting posts and waits until all accepted work has been
    /// handled, remaining objects disposed, and pending delayed posts
    /// cancelled.
    ///
    /// Fails with [`SystemError::Reentrant`] from a handler or a
    /// cancellation callback, since the dispatcher would wait for the
    /// calling thread to return.
    pub fn shutdown(&self) -> Result<(), SystemError> {
        if on_pool_thread() {
            return Err(SystemError::Reentrant);
        }
        self.blocking(|response_tx| Command::Shutdown { response_tx })
    }

    pub async fn shutdown_async(&self) -> Result<(), SystemError> {
        self.request(|response_tx| Command::Shutdown { response_tx })?
            .wait_async()
            .await
    }

    /// Make the command loop re-read the clock and recompute its wait.
    pub fn wake(&self) -> Result<(), SystemError> {
        self.send(Command::Wake)
    }

    /// A cloneable, non-blocking way to post to `id` from anywhere,
    /// including `welcome` and threads the dispatcher knows nothing about.
    pub fn bridge(&self, id: ObjectId) -> PostBridge<M> {
        PostBridge {
            id,
            commands: self.commands.clone(),
        }
    }

    fn on_dispatcher_thread(&self) -> bool {
        self.dispatcher.get() == Some(&thread::current().id())
    }

    fn send(&self, command: Command<M>) -> Result<(), SystemError> {
        self.commands.send(command).map_err(|e| {
            debug!("Dispatcher stopped; dropping {}", e.0.to_log());
            SystemError::Stopped
        })
    }

    fn request<T, F>(&self, build: F) -> Result<CompletionToken<T>, SystemError>
    where
        F: FnOnce(Completer<T>) -> Command<M>,
    {
        let (completer, token) = completion();
        self.send(build(completer))?;
        Ok(token)
    }

    fn blocking<T, F>(&self, build: F) -> Result<T, SystemError>
    where
        F: FnOnce(Completer<T>) -> Command<M>,
    {
        if self.on_dispatcher_thread() {
            error!("Blocking call on the dispatcher thread");
            return Err(SystemError::Reentrant);
        }
        self.request(build)?.wait()
    }
}

/// Turns an external completion signal into a post to one object.
///
/// Sending never blocks and never reports whether the object accepted the
/// message; a rejected post is logged and dropped.
pub struct PostBridge<M> {
    id: ObjectId,
    commands: UnboundedSender<Command<M>>,
}

impl<M> Clone for PostBridge<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            commands: self.commands.clone(),
        }
    }
}

impl<M> PostBridge<M> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Queue `message` for the object. Returns false if the dispatcher has
    /// stopped.
    pub fn complete(&self, message: M) -> bool {
        self.commands
            .send(Command::PostMessage {
                id: self.id,
                message,
                response_tx: None,
            })
            .is_ok()
    }
}

/// Owns the dispatcher thread, the worker pool and the callback thread.
///
/// Dropping a runtime shuts it down and waits for its threads, the same as
/// [`Runtime::shutdown`].
pub struct Runtime<M> {
    system: ActorSystem<M>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<M> Runtime<M>
where
    M: Send + 'static,
{
    pub fn start(config: SystemConfig) -> anyhow::Result<Self> {
        Self::start_with_clock(config, SystemClock::new())
    }

    /// Start the runtime with a custom tick source.
    ///
    /// ## Parameters
    ///
    /// * `config` - Worker count and thread naming
    /// * `clock` - The millisecond counter delayed posts are scheduled
    ///   against
    ///
    /// ## Returns
    ///
    /// The running runtime, or an error if the config is invalid or a thread
    /// could not be started.
    pub fn start_with_clock<T>(config: SystemConfig, clock: T) -> anyhow::Result<Self>
    where
        T: TickSource,
    {
        config.validate()?;
        info!(
            "Starting runtime '{}' with {} worker(s)",
            config.thread_name, config.workers
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let dispatcher_thread = Arc::new(OnceLock::new());
        let system = ActorSystem {
            commands: commands_tx.clone(),
            dispatcher: dispatcher_thread.clone(),
        };

        let pool = WorkerPool::spawn(config.workers, &config.thread_name, commands_tx)?;
        let state = State::new(system.clone(), pool, config.workers);
        let command_loop = CommandLoop::new(state, commands_rx, clock);
        let tokio_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let dispatcher = thread::Builder::new()
            .name(format!("{}-dispatcher", config.thread_name))
            .spawn(move || {
                let _ = dispatcher_thread.set(thread::current().id());
                let LoopExit {
                    state,
                    shutdown_waiters,
                } = tokio_runtime.block_on(command_loop.run());

                state.into_executor().join();
                for waiter in shutdown_waiters {
                    waiter.complete(());
                }
                info!("Dispatcher stopped");
            })?;

        Ok(Self {
            system,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn system(&self) -> ActorSystem<M> {
        self.system.clone()
    }

    /// Shut down and wait for every runtime thread to exit.
    ///
    /// Must not be called from a handler: the dispatcher would wait for
    /// that handler to return.
    pub fn shutdown(mut self) -> Result<(), SystemError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SystemError> {
        let Some(dispatcher) = self.dispatcher.take() else {
            return Ok(());
        };

        // The dispatcher may already be gone if it was shut down through
        // the handle; joining is enough then.
        let (response_tx, _token) = completion();
        let _ = self.system.send(Command::Shutdown { response_tx });

        dispatcher.join().map_err(|_| {
            error!("Dispatcher thread panicked");
            SystemError::Stopped
        })
    }
}

impl<M> Drop for Runtime<M> {
    fn drop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        let (response_tx, _token) = completion();
        let _ = self.system.commands.send(Command::Shutdown { response_tx });
        if dispatcher.join().is_err() {
            error!("Dispatcher thread panicked");
        }
    }
}
