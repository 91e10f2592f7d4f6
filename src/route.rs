//! Per-path handler stacks.
//!
//! A [`Route`] owns the handlers registered for one path pattern, each tagged
//! with the method it answers. Dispatch walks them in registration order:
//!
//! ```text
//! app.route("/book")
//!     .get(load_book)          GET, HEAD   load_book → show_book
//!     .get(show_book)          POST        save_book
//!     .post(save_book)         others      falls through to the next layer
//! ```
//!
//! HEAD requests run the GET handlers unless the route has HEAD handlers of
//! its own.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::handler::{BoxFuture, Handle, IntoHandles};
use crate::layer::{Endpoint, Layer};
use crate::method::Method;
use crate::next::{Control, Next};
use crate::request::Request;
use crate::response::Response;

/// The handlers registered for one path.
///
/// Obtained from [`App::route`](crate::App::route). Cloning yields another
/// handle to the same route.
#[derive(Clone)]
pub struct Route {
    inner: Arc<RouteInner>,
}

struct RouteInner {
    path: String,
    stack: RwLock<Vec<Arc<Layer>>>,
    /// In registration order.
    methods: RwLock<Vec<Method>>,
    all: AtomicBool,
}

impl Route {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            inner: Arc::new(RouteInner {
                path: path.to_owned(),
                stack: RwLock::new(Vec::new()),
                methods: RwLock::new(Vec::new()),
                all: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Whether a request with `method` has any handler here.
    pub fn handles_method(&self, method: Method) -> bool {
        if self.inner.all.load(Ordering::SeqCst) {
            return true;
        }
        let methods = self.inner.methods.read();
        methods.contains(&method)
            || (method == Method::Head && !methods.contains(&Method::Head) && methods.contains(&Method::Get))
    }

    /// Methods with explicit handlers in registration order, upper-case,
    /// HEAD implied by GET.
    pub fn allowed_methods(&self) -> Vec<&'static str> {
        let methods = self.inner.methods.read();
        let mut allowed: Vec<_> = methods.iter().map(|m| m.as_str()).collect();
        if methods.contains(&Method::Get) && !methods.contains(&Method::Head) {
            allowed.push(Method::Head.as_str());
        }
        allowed
    }

    // ── registration ──────────────────────────────────────────────────────────

    /// Appends handlers for `method`.
    ///
    /// # Panics
    ///
    /// Panics if a handle is a mounted application; use
    /// [`Route::try_on`] to get the error instead.
    pub fn on(self, method: Method, handlers: impl IntoHandles) -> Self {
        self.try_on(Some(method), handlers).unwrap_or_else(|e| panic!("{e}"));
        self
    }

    /// Appends handlers that answer every method.
    pub fn all(self, handlers: impl IntoHandles) -> Self {
        self.try_on(None, handlers).unwrap_or_else(|e| panic!("{e}"));
        self
    }

    pub fn get(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Get, handlers)
    }

    pub fn post(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Post, handlers)
    }

    pub fn put(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Put, handlers)
    }

    pub fn delete(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Delete, handlers)
    }

    pub fn patch(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Patch, handlers)
    }

    pub fn head(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Head, handlers)
    }

    pub fn options(self, handlers: impl IntoHandles) -> Self {
        self.on(Method::Options, handlers)
    }

    /// Appends handlers for `method`, or for every method when `None`.
    ///
    /// Nothing is registered if any handle is rejected.
    pub fn try_on(&self, method: Option<Method>, handlers: impl IntoHandles) -> Result<()> {
        let name = method.map_or_else(|| "all".to_owned(), Method::lowercase);
        let mut layers = Vec::new();
        for handle in handlers.into_handles() {
            let endpoint = match handle {
                Handle::Request(h) => Endpoint::Request(h),
                Handle::Error(h) => Endpoint::Error(h),
                Handle::App(_) => {
                    return Err(Error::config(format!(
                        "Route.{name}() requires a callback function but got a {}",
                        handle.kind()
                    )));
                }
            };
            layers.push(Arc::new(Layer::for_method(method, endpoint)));
        }

        debug!(method = %name, path = %self.inner.path, handlers = layers.len(), "route");
        match method {
            Some(m) => {
                let mut methods = self.inner.methods.write();
                if !methods.contains(&m) {
                    methods.push(m);
                }
            }
            None => self.inner.all.store(true, Ordering::SeqCst),
        }
        self.inner.stack.write().extend(layers);
        Ok(())
    }

    // ── dispatch ──────────────────────────────────────────────────────────────

    /// Runs the matching handlers, then hands `done` a result:
    ///
    /// - `Continue`, or the pending error, once the stack is exhausted
    /// - `Continue` when a handler skips the route
    /// - `Router` when a handler exits the router
    pub(crate) fn dispatch(&self, req: Request, res: Response, done: Next) -> BoxFuture {
        let stack = self.inner.stack.read().clone();
        if stack.is_empty() {
            return done.run();
        }

        let mut method = req.method();
        if method == Method::Head && !self.inner.methods.read().contains(&Method::Head) {
            method = Method::Get;
        }
        req.set_route(self.clone());

        let depth = done.depth();
        let walk = Arc::new(RouteWalk { stack, method, req, res });
        walk.step(0, Control::Continue, depth, done)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.inner.path)
            .field("methods", &self.allowed_methods())
            .finish_non_exhaustive()
    }
}

/// One request's pass through a route.
struct RouteWalk {
    stack: Vec<Arc<Layer>>,
    method: Method,
    req: Request,
    res: Response,
}

impl RouteWalk {
    fn step(self: Arc<Self>, idx: usize, control: Control, depth: usize, done: Next) -> BoxFuture {
        let err = match control {
            Control::Continue => None,
            Control::Error(e) => Some(e),
            Control::Route => return done.at_depth(depth).run(),
            Control::Router => return done.at_depth(depth).exit_router(),
        };

        let found = self.stack[idx.min(self.stack.len())..]
            .iter()
            .position(|layer| layer.handles_method(self.method))
            .map(|offset| idx + offset);
        let Some(idx) = found else {
            return done.at_depth(depth).proceed(Control::from_error(err));
        };

        let layer = Arc::clone(&self.stack[idx]);
        let (req, res) = (self.req.clone(), self.res.clone());
        let walk = Arc::clone(&self);
        let next = Next::chain(depth, move |control, depth| walk.step(idx + 1, control, depth, done));

        match err {
            Some(err) => layer.handle_error(err, req, res, next),
            None => layer.handle_request(req, res, next),
        }
    }
}
