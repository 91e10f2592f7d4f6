//! One entry of a handler stack.

use tracing::trace;

use crate::error::Error;
use crate::handler::{BoxFuture, BoxedErrorHandler, BoxedHandler};
use crate::matcher::{PathMatch, PathPattern};
use crate::method::Method;
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;

/// What a layer runs when it is reached.
pub(crate) enum Endpoint {
    Request(BoxedHandler),
    Error(BoxedErrorHandler),
    /// Hands the request to a route's own stack.
    Route(Route),
}

/// A handler with an optional path guard and method filter.
///
/// Router stacks guard layers by path; route stacks guard them by method.
pub(crate) struct Layer {
    pattern: Option<PathPattern>,
    method: Option<Method>,
    endpoint: Endpoint,
}

impl Layer {
    /// A layer that matches every path.
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self { pattern: None, method: None, endpoint }
    }

    pub(crate) fn at(pattern: PathPattern, endpoint: Endpoint) -> Self {
        Self { pattern: Some(pattern), method: None, endpoint }
    }

    /// A route stack entry; `None` accepts every method.
    pub(crate) fn for_method(method: Option<Method>, endpoint: Endpoint) -> Self {
        Self { pattern: None, method, endpoint }
    }

    pub(crate) fn matches(&self, path: &str) -> Option<PathMatch> {
        match &self.pattern {
            Some(pattern) => pattern.matches(path),
            None => Some(PathMatch::default()),
        }
    }

    /// Whether the layer takes part for `method`, already normalised by the
    /// owning route.
    pub(crate) fn handles_method(&self, method: Method) -> bool {
        self.method.is_none_or(|m| m == method)
    }

    pub(crate) fn route(&self) -> Option<&Route> {
        match &self.endpoint {
            Endpoint::Route(route) => Some(route),
            _ => None,
        }
    }

    /// Normal pass. Error handlers are passed over.
    pub(crate) fn handle_request(&self, req: Request, res: Response, next: Next) -> BoxFuture {
        trace!(path = self.path(), "handle request");
        match &self.endpoint {
            Endpoint::Request(handler) => handler.call(req, res, next),
            Endpoint::Route(route) => route.dispatch(req, res, next),
            Endpoint::Error(_) => next.run(),
        }
    }

    /// Error pass. Only error handlers run; everything else forwards `err`.
    pub(crate) fn handle_error(&self, err: Error, req: Request, res: Response, next: Next) -> BoxFuture {
        trace!(path = self.path(), "handle error");
        match &self.endpoint {
            Endpoint::Error(handler) => handler.call(err, req, res, next),
            _ => next.error(err),
        }
    }

    fn path(&self) -> &str {
        self.pattern.as_ref().map_or("/", PathPattern::source)
    }
}
