//! # Handlers
//!
//! A handler is the user-supplied half of an object: private state plus the
//! three lifecycle hooks the dispatcher drives.
//!
//! * `welcome` runs once, on the dispatcher thread, while the object is being
//!   registered. The handler learns its own id here, before any message.
//! * `handle` runs on a worker thread, once per delivered message. The
//!   dispatcher never runs two `handle` calls for the same object at once.
//! * `dispose` runs once when the object is removed and its accepted backlog
//!   has drained, or when the system shuts down.
//!
//! ## Panics
//!
//! The dispatcher does not catch panics. A panic escaping `handle` ends the
//! worker thread that was running it; that worker slot is never returned, the
//! object stays busy, and a later shutdown will wait for it forever. Handlers
//! that can fail must deal with the failure themselves. `dispose` is assumed
//! not to panic.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{error, warn};

use crate::id::ObjectId;
use crate::system::ActorSystem;

pub trait Handler<M>: Send + 'static {
    /// Called once at registration, on the dispatcher thread.
    ///
    /// Blocking entry points of `system` fail with `SystemError::Reentrant`
    /// from here; keep a clone of the handle and use it from `handle`, or
    /// post through a [`PostBridge`](crate::system::PostBridge).
    fn welcome(&mut self, system: &ActorSystem<M>, id: ObjectId) {
        let _ = (system, id);
    }

    fn handle(&mut self, message: M);

    fn dispose(&mut self) {}
}

/// Adapter turning a closure into a handler.
pub struct FnHandler<F> {
    f: F,
}

pub fn from_fn<M, F>(f: F) -> FnHandler<F>
where
    F: FnMut(M) + Send + 'static,
{
    FnHandler { f }
}

impl<M, F> Handler<M> for FnHandler<F>
where
    F: FnMut(M) + Send + 'static,
{
    fn handle(&mut self, message: M) {
        (self.f)(message)
    }
}

/// Messages that can be routed by kind.
pub trait Routable {
    type Kind: Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// What a routed handler knows about itself once welcomed.
pub struct Context<M> {
    pub id: ObjectId,
    pub system: ActorSystem<M>,
}

type Route<S, M> = Box<dyn Fn(&mut S, &Context<M>, M) + Send + Sync>;
type DisposeHook<S> = Box<dyn Fn(&mut S) + Send + Sync>;

struct Routes<S, M: Routable> {
    routes: HashMap<M::Kind, Route<S, M>>,
    fallback: Option<Route<S, M>>,
    on_dispose: Option<DisposeHook<S>>,
}

/// Collects routes before the table is frozen.
pub struct RouteTableBuilder<S, M: Routable> {
    routes: Routes<S, M>,
}

impl<S, M> RouteTableBuilder<S, M>
where
    M: Routable,
{
    pub fn new() -> Self {
        Self {
            routes: Routes {
                routes: HashMap::new(),
                fallback: None,
                on_dispose: None,
            },
        }
    }

    /// Register the closure for one message kind. A later registration for
    /// the same kind replaces the earlier one.
    pub fn route<F>(mut self, kind: M::Kind, f: F) -> Self
    where
        F: Fn(&mut S, &Context<M>, M) + Send + Sync + 'static,
    {
        if self.routes.routes.insert(kind, Box::new(f)).is_some() {
            warn!("Route registered twice; keeping the later one");
        }
        self
    }

    /// Closure for messages whose kind has no route.
    pub fn fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &Context<M>, M) + Send + Sync + 'static,
    {
        self.routes.fallback = Some(Box::new(f));
        self
    }

    pub fn on_dispose<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        self.routes.on_dispose = Some(Box::new(f));
        self
    }

    pub fn build(self) -> RouteTable<S, M> {
        RouteTable {
            inner: Arc::new(self.routes),
        }
    }
}

impl<S, M: Routable> Default for RouteTableBuilder<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable kind → closure table, shared by every handler built from it.
pub struct RouteTable<S, M: Routable> {
    inner: Arc<Routes<S, M>>,
}

impl<S, M: Routable> Clone for RouteTable<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, M: Routable> RouteTable<S, M> {
    pub fn builder() -> RouteTableBuilder<S, M> {
        RouteTableBuilder::new()
    }

    pub fn handles(&self, kind: &M::Kind) -> bool {
        self.inner.routes.contains_key(kind)
    }

    /// Run the route for `message`. Returns false if neither a route nor a
    /// fallback exists.
    pub fn dispatch(&self, state: &mut S, context: &Context<M>, message: M) -> bool {
        let kind = message.kind();
        match self.inner.routes.get(&kind).or(self.inner.fallback.as_ref()) {
            Some(route) => {
                route(state, context, message);
                true
            }
            None => {
                warn!("No route for message kind {:?} on {}", kind, context.id);
                false
            }
        }
    }

    fn dispose(&self, state: &mut S) {
        if let Some(hook) = &self.inner.on_dispose {
            hook(state);
        }
    }
}

/// A handler whose behavior is a shared [`RouteTable`] over private state.
pub struct RoutedHandler<S, M: Routable> {
    state: S,
    table: RouteTable<S, M>,
    context: Option<Context<M>>,
}

impl<S, M: Routable> RoutedHandler<S, M> {
    pub fn new(state: S, table: RouteTable<S, M>) -> Self {
        Self {
            state,
            table,
            context: None,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S, M> Handler<M> for RoutedHandler<S, M>
where
    S: Send + 'static,
    M: Routable + Send + 'static,
{
    fn welcome(&mut self, system: &ActorSystem<M>, id: ObjectId) {
        self.context = Some(Context {
            id,
            system: system.clone(),
        });
    }

    fn handle(&mut self, message: M) {
        let Some(context) = &self.context else {
            error!("Routed handler received a message before welcome");
            return;
        };
        self.table.dispatch(&mut self.state, context, message);
    }

    fn dispose(&mut self) {
        self.table.dispose(&mut self.state);
    }
}
