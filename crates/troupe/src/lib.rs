//! # Troupe
//!
//! Troupe is an in-process actor dispatcher. Objects are plain Rust values
//! implementing [`Handler`]; they are addressed by [`ObjectId`] and driven
//! one message at a time on a fixed pool of worker threads.
//!
//! ## Core Features
//!
//! * **Per-object FIFO**: messages reach an object in the order its posts
//!   were accepted, and never two at once
//! * **Bounded concurrency**: at most `workers` handlers run at the same time,
//!   with busy objects served fairly from a global queue
//! * **Delayed posts**: millisecond timers on a 32-bit wrapping tick counter,
//!   each ending in exactly one of delivery or cancellation
//! * **Draining removal and shutdown**: removed or stopped objects finish the
//!   work they already accepted before they are disposed
//!
//! ## Architecture
//!
//! * `Runtime`: starts and joins the dispatcher, worker and callback threads
//! * `ActorSystem`: the cloneable handle used to add, remove and post
//! * `CommandLoop`: the single thread that owns all dispatcher state
//! * `State`: the object state machine, tested without threads
//! * `DelayQueue`: pending delayed posts, keyed by wraparound epoch
//!
//! ## Example Usage
//!
//! ```no_run
//! use troupe::{from_fn, Runtime, SystemConfig};
//!
//! let runtime = Runtime::start(SystemConfig::default().with_workers(2))?;
//! let system = runtime.system();
//!
//! let id = system.add_object(from_fn(|line: String| println!("{}", line)))?;
//! system.post_message(id, "hello".to_string())?;
//! system.post_message_later(500, id, "later".to_string(), || {})?;
//!
//! runtime.shutdown()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod clock;
pub mod command_loop;
pub mod completion;
pub mod config;
pub mod delay_queue;
pub mod errors;
pub mod handler;
pub mod id;
pub mod logging;
pub mod messages;
pub mod metrics;
pub mod priority_queue;
pub mod state;
pub mod system;
pub mod worker;

pub use clock::{ManualClock, SystemClock, TickSource};
pub use completion::{completion, Completer, CompletionToken};
pub use config::SystemConfig;
pub use delay_queue::{DelayQueue, OnCancel, WaitKind, MAX_WAIT};
pub use errors::SystemError;
pub use handler::{
    from_fn, Context, FnHandler, Handler, Routable, RouteTable, RouteTableBuilder, RoutedHandler,
};
pub use id::ObjectId;
pub use logging::setup_global_logging;
pub use metrics::DispatcherStats;
pub use priority_queue::StablePriorityQueue;
pub use system::{ActorSystem, PostBridge, Runtime};
