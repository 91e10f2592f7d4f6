//! The continuation handed to every handler.
//!
//! A handler finishes its part of the work and then *proceeds*: it consumes
//! its [`Next`] with one of four outcomes.
//!
//! ```text
//! next.run()           continue with the next matching layer
//! next.error(err)      continue in error mode; only error handlers run
//! next.skip_route()    leave the current route, as if it had succeeded
//! next.exit_router()   leave the router that owns the current route
//! ```
//!
//! `Next` is consumed by value, so proceeding twice does not compile.
//! Dropping it without proceeding ends the chain: the handler is assumed to
//! have produced the response itself.
//!
//! # Nesting depth
//!
//! Each continuation's future is awaited inside the future of the handler that
//! called it, so a long chain builds a deep poll stack whether or not its
//! handlers ever suspend. Every `proceed` increments a depth counter carried
//! by the continuation; once it passes [`MAX_SYNC_DEPTH`] the rest of the
//! chain is spawned as a fresh Tokio task and awaited from here, which resets
//! the counter. Dispatch therefore needs a Tokio runtime.

use std::fmt;
use std::future::Future;

use tracing::{error, trace};

use crate::error::Error;
use crate::handler::BoxFuture;

/// Nested continuations allowed on one task before the chain is moved to a
/// fresh task.
pub const MAX_SYNC_DEPTH: usize = 100;

/// What a handler asks the pipeline to do next.
#[derive(Debug)]
pub enum Control {
    /// Carry on with the next matching layer.
    Continue,
    /// Switch to error mode, carrying this error.
    Error(Error),
    /// Skip the remaining layers of the current route.
    Route,
    /// Abort the router that owns the current route.
    Router,
}

impl Control {
    /// Folds a pending error back into a control value.
    pub(crate) fn from_error(err: Option<Error>) -> Self {
        err.map_or(Self::Continue, Self::Error)
    }
}

impl From<Error> for Control {
    fn from(err: Error) -> Self {
        Self::Error(err)
    }
}

type Continuation = Box<dyn FnOnce(Control, usize) -> BoxFuture + Send + 'static>;

/// The continuation passed to every handler. See the [module docs](self).
#[must_use = "dropping `Next` ends the handler chain"]
pub struct Next {
    cont: Continuation,
    depth: usize,
}

impl Next {
    /// A continuation that ends the chain by calling `f`.
    ///
    /// Use this to supply a custom terminal handler to
    /// [`App::handle_with`](crate::App::handle_with):
    ///
    /// ```rust,no_run
    /// # use sluice::{App, Control, Next, Request, Response, Method};
    /// # async fn demo(app: App) {
    /// let req = Request::new(Method::Get, "/");
    /// let res = Response::new();
    /// let done = Next::new(|control| async move {
    ///     if let Control::Error(err) = control {
    ///         eprintln!("unhandled: {err}");
    ///     }
    /// });
    /// app.handle_with(req, res, done).await;
    /// # }
    /// ```
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Control) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            cont: Box::new(move |control, _depth| Box::pin(f(control))),
            depth: 0,
        }
    }

    /// A continuation that receives the nesting depth it runs at, so it can
    /// pass it on to the continuations it creates.
    pub(crate) fn chain<F>(depth: usize, f: F) -> Self
    where
        F: FnOnce(Control, usize) -> BoxFuture + Send + 'static,
    {
        Self { cont: Box::new(f), depth }
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Re-bases this continuation at the caller's current depth.
    pub(crate) fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Hands control to the next stage with `control`.
    pub fn proceed(self, control: Control) -> BoxFuture {
        let depth = self.depth + 1;
        if depth <= MAX_SYNC_DEPTH {
            return (self.cont)(control, depth);
        }

        trace!(depth, "continuation depth exceeded, deferring to a fresh task");
        let cont = self.cont;
        Box::pin(async move {
            if let Err(e) = tokio::spawn(async move { cont(control, 0).await }).await {
                error!("deferred continuation failed: {e}");
            }
        })
    }

    /// Continue with the next matching layer.
    pub fn run(self) -> BoxFuture {
        self.proceed(Control::Continue)
    }

    /// Continue in error mode.
    pub fn error(self, err: impl Into<Error>) -> BoxFuture {
        self.proceed(Control::Error(err.into()))
    }

    /// Skip the rest of the current route's handlers.
    pub fn skip_route(self) -> BoxFuture {
        self.proceed(Control::Route)
    }

    /// Leave the router that owns the current route.
    pub fn exit_router(self) -> BoxFuture {
        self.proceed(Control::Router)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("depth", &self.depth).finish_non_exhaustive()
    }
}
