//! Handler traits and type erasure.
//!
//! # How async handlers are stored
//!
//! A stack holds handlers of *different* types in a single `Vec<Layer>`.
//! Rust collections can only hold one concrete type, so each handler is
//! hidden behind a trait object and stored uniformly:
//!
//! ```text
//! async fn auth(req: Request, res: Response, next: Next) { … }   ← user writes this
//!        ↓ app.middleware(auth)
//! auth.into_boxed_handler()                                     ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(auth))                                     ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(req, res, next)  at request time                 ← one vtable dispatch
//! ```
//!
//! There are three shapes: request handlers `(Request, Response, Next)`,
//! error handlers `(Error, Request, Response, Next)` and parameter handlers
//! `(Request, Response, Next, String)`. Closures cannot be told apart by
//! arity, so error handlers are wrapped explicitly with [`Handle::error`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::application::App;
use crate::error::Error;
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future driving one stage of the chain.
///
/// `Send + 'static` lets the depth guard move the rest of a chain onto a
/// freshly spawned task.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request, res: Response, next: Next) -> BoxFuture;
}

#[doc(hidden)]
pub trait ErasedErrorHandler {
    fn call(&self, err: Error, req: Request, res: Response, next: Next) -> BoxFuture;
}

#[doc(hidden)]
pub trait ErasedParamHandler {
    fn call(&self, req: Request, res: Response, next: Next, value: String) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

#[doc(hidden)]
pub type BoxedErrorHandler = Arc<dyn ErasedErrorHandler + Send + Sync + 'static>;

#[doc(hidden)]
pub type BoxedParamHandler = Arc<dyn ErasedParamHandler + Send + Sync + 'static>;

// ── Public handler traits ─────────────────────────────────────────────────────

/// Implemented for every `async fn(Request, Response, Next)`.
///
/// Sealed: only the blanket impl below satisfies it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

/// Implemented for every `async fn(Error, Request, Response, Next)`.
pub trait ErrorHandler: private::SealedError + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_error_handler(self) -> BoxedErrorHandler;
}

/// Implemented for every `async fn(Request, Response, Next, String)`.
///
/// The last argument is the captured value of the named path parameter.
pub trait ParamHandler: private::SealedParam + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_param_handler(self) -> BoxedParamHandler;
}

mod private {
    pub trait Sealed {}
    pub trait SealedError {}
    pub trait SealedParam {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut> private::Sealed for F
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

impl<F, Fut> private::SealedError for F
where
    F: Fn(Error, Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> ErrorHandler for F
where
    F: Fn(Error, Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_error_handler(self) -> BoxedErrorHandler {
        Arc::new(FnHandler(self))
    }
}

impl<F, Fut> private::SealedParam for F
where
    F: Fn(Request, Response, Next, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> ParamHandler for F
where
    F: Fn(Request, Response, Next, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_param_handler(self) -> BoxedParamHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype bridging a concrete closure to the erased traits.
struct FnHandler<F>(F);

impl<F, Fut> ErasedHandler for FnHandler<F>
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: Request, res: Response, next: Next) -> BoxFuture {
        Box::pin((self.0)(req, res, next))
    }
}

impl<F, Fut> ErasedErrorHandler for FnHandler<F>
where
    F: Fn(Error, Request, Response, Next) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, err: Error, req: Request, res: Response, next: Next) -> BoxFuture {
        Box::pin((self.0)(err, req, res, next))
    }
}

impl<F, Fut> ErasedParamHandler for FnHandler<F>
where
    F: Fn(Request, Response, Next, String) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: Request, res: Response, next: Next, value: String) -> BoxFuture {
        Box::pin((self.0)(req, res, next, value))
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Anything that can be placed on a stack.
#[derive(Clone)]
pub enum Handle {
    /// A normal handler.
    Request(BoxedHandler),
    /// An error handler; only invoked while an error is pending.
    Error(BoxedErrorHandler),
    /// A nested application. Mounted when passed to
    /// [`App::middleware_at`](crate::App::middleware_at); rejected by routes.
    App(App),
}

impl Handle {
    pub fn request(handler: impl Handler) -> Self {
        Self::Request(handler.into_boxed_handler())
    }

    pub fn error(handler: impl ErrorHandler) -> Self {
        Self::Error(handler.into_boxed_error_handler())
    }

    /// Name of the handle's kind, used in registration errors.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "Function",
            Self::Error(_) => "ErrorFunction",
            Self::App(_) => "Application",
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// Conversion into a flat list of [`Handle`]s.
///
/// Registration methods accept a single handler, an [`App`], a `Handle`, or
/// nested `Vec`s of any of these; nested lists are flattened in order.
pub trait IntoHandles {
    fn into_handles(self) -> Vec<Handle>;
}

impl<H: Handler> IntoHandles for H {
    fn into_handles(self) -> Vec<Handle> {
        vec![Handle::request(self)]
    }
}

impl IntoHandles for Handle {
    fn into_handles(self) -> Vec<Handle> {
        vec![self]
    }
}

impl IntoHandles for App {
    fn into_handles(self) -> Vec<Handle> {
        vec![Handle::App(self)]
    }
}

impl<T: IntoHandles> IntoHandles for Vec<T> {
    fn into_handles(self) -> Vec<Handle> {
        self.into_iter().flat_map(IntoHandles::into_handles).collect()
    }
}
