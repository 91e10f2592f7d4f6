//! The main handler stack of an application.
//!
//! Every registration appends a [`Layer`]: middleware and mounted
//! applications match a path *prefix*, routes match their whole path. A
//! request walks the stack once, in order:
//!
//! ```text
//! stack[0]  query           /        prefix
//! stack[1]  init            /        prefix
//! stack[2]  auth            /admin   prefix   ← sees /admin/users as /users
//! stack[3]  route /users    /users   exact    → Route::dispatch
//! stack[4]  not_found       /        prefix
//! ```
//!
//! While an error is pending only error handlers run and route layers are
//! passed over.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::handler::{BoxFuture, BoxedParamHandler};
use crate::layer::{Endpoint, Layer};
use crate::matcher::{PathMatch, PathPattern, PatternOptions};
use crate::method::Method;
use crate::next::{Control, Next};
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;

pub(crate) struct Router {
    stack: RwLock<Vec<Arc<Layer>>>,
    routes: RwLock<HashMap<String, Route>>,
    params: RwLock<HashMap<String, Vec<BoxedParamHandler>>>,
    case_sensitive: bool,
    strict: bool,
}

impl Router {
    pub(crate) fn new(case_sensitive: bool, strict: bool) -> Self {
        Self {
            stack: RwLock::new(Vec::new()),
            routes: RwLock::new(HashMap::new()),
            params: RwLock::new(HashMap::new()),
            case_sensitive,
            strict,
        }
    }

    fn pattern(&self, path: &str, end: bool) -> Result<PathPattern> {
        PathPattern::new(
            path,
            PatternOptions { end, strict: self.strict, case_sensitive: self.case_sensitive },
        )
    }

    /// Appends a layer that runs for every path.
    pub(crate) fn push(&self, endpoint: Endpoint) {
        self.stack.write().push(Arc::new(Layer::new(endpoint)));
    }

    /// Appends a layer that runs for every path under `path`.
    pub(crate) fn use_at(&self, path: &str, endpoint: Endpoint) -> Result<()> {
        debug!(path, "use");
        if path == "/" {
            self.push(endpoint);
            return Ok(());
        }
        let layer = Layer::at(self.pattern(path, false)?, endpoint);
        self.stack.write().push(Arc::new(layer));
        Ok(())
    }

    /// The route for `path`, created and appended on first use.
    pub(crate) fn route(&self, path: &str) -> Result<Route> {
        if let Some(route) = self.routes.read().get(path) {
            return Ok(route.clone());
        }

        let mut routes = self.routes.write();
        if let Some(route) = routes.get(path) {
            return Ok(route.clone());
        }
        let pattern = self.pattern(path, true)?;
        let route = Route::new(path);
        self.stack.write().push(Arc::new(Layer::at(pattern, Endpoint::Route(route.clone()))));
        routes.insert(path.to_owned(), route.clone());
        debug!(path, "new route");
        Ok(route)
    }

    pub(crate) fn param(&self, name: &str, handler: BoxedParamHandler) {
        debug!(name, "param");
        self.params.write().entry(name.to_owned()).or_default().push(handler);
    }

    /// Walks the stack for one request, then hands `done` the outcome.
    pub(crate) fn handle(self: &Arc<Self>, req: Request, res: Response, done: Next) -> BoxFuture {
        let depth = done.depth();
        let walk = Arc::new(Walk {
            router: Arc::clone(self),
            stack: self.stack.read().clone(),
            parent_url: req.base_url(),
            parent_params: req.params(),
            param_called: Mutex::new(HashMap::new()),
            req,
            res,
        });
        walk.next(Cursor::default(), Control::Continue, depth, done)
    }
}

/// Where a walk stands between two layers.
#[derive(Default)]
struct Cursor {
    idx: usize,
    /// Prefix removed from the URL for the current layer, and whether a
    /// slash was added in its place.
    removed: Option<(String, bool)>,
    /// Methods of routes that matched an unanswered OPTIONS request.
    options: Vec<&'static str>,
}

/// One request's pass through a router.
struct Walk {
    router: Arc<Router>,
    stack: Vec<Arc<Layer>>,
    req: Request,
    res: Response,
    parent_url: String,
    parent_params: HashMap<String, String>,
    /// Last value each param handler list ran with, and how it ended.
    param_called: Mutex<HashMap<String, ParamCall>>,
}

struct ParamCall {
    value: String,
    outcome: ParamOutcome,
}

enum ParamOutcome {
    Passed,
    Skipped,
    Failed(Error),
}

impl Walk {
    fn next(self: Arc<Self>, mut cursor: Cursor, control: Control, depth: usize, done: Next) -> BoxFuture {
        if let Some((removed, slash_added)) = cursor.removed.take() {
            self.req.restore_prefix(&removed, slash_added);
            self.req.set_base_url(self.parent_url.clone());
        }

        let layer_error = match control {
            Control::Continue | Control::Route => None,
            Control::Error(e) => Some(e),
            Control::Router => return self.finish(cursor, None, depth, done),
        };

        let path = self.req.path();
        let method = self.req.method();
        let found = loop {
            let Some(layer) = self.stack.get(cursor.idx).cloned() else { break None };
            cursor.idx += 1;

            let Some(matched) = layer.matches(&path) else { continue };
            let Some(route) = layer.route() else { break Some((layer, matched)) };
            if layer_error.is_some() {
                continue;
            }
            let handles = route.handles_method(method);
            if !handles && method == Method::Options {
                for allowed in route.allowed_methods() {
                    if !cursor.options.contains(&allowed) {
                        cursor.options.push(allowed);
                    }
                }
            }
            if handles || method == Method::Head {
                break Some((layer, matched));
            }
        };

        let Some((layer, matched)) = found else {
            return self.finish(cursor, layer_error, depth, done);
        };
        trace!(path = %path, idx = cursor.idx - 1, "layer matched");

        if let Some(route) = layer.route() {
            self.req.set_route(route.clone());
        }
        let PathMatch { params, prefix } = matched;
        self.req.set_params(params.iter().cloned().collect());

        let step = Step { layer, prefix, cursor, layer_error };
        self.call_params(Arc::new(params), 0, step, depth, done)
    }

    /// Runs the param handlers for the `i`th captured parameter, then the
    /// next parameter's, then enters the layer.
    fn call_params(
        self: Arc<Self>,
        params: Arc<Vec<(String, String)>>,
        i: usize,
        step: Step,
        depth: usize,
        done: Next,
    ) -> BoxFuture {
        let Some((name, value)) = params.get(i).cloned() else {
            return self.enter(step, depth, done);
        };
        let handlers = self.router.params.read().get(&name).cloned().unwrap_or_default();
        if handlers.is_empty() {
            return self.call_params(params, i + 1, step, depth, done);
        }

        match self.replay(&name, &value) {
            Some(Control::Continue) => return self.call_params(params, i + 1, step, depth, done),
            Some(control) => {
                trace!(param = %name, "replaying param outcome");
                return self.settle_params(step, control, depth, done);
            }
            None => {}
        }

        self.param_called
            .lock()
            .insert(name, ParamCall { value, outcome: ParamOutcome::Passed });
        self.call_param_handler(params, i, Arc::new(handlers), 0, step, depth, done)
    }

    #[allow(clippy::too_many_arguments)]
    fn call_param_handler(
        self: Arc<Self>,
        params: Arc<Vec<(String, String)>>,
        i: usize,
        handlers: Arc<Vec<BoxedParamHandler>>,
        j: usize,
        step: Step,
        depth: usize,
        done: Next,
    ) -> BoxFuture {
        let Some(handler) = handlers.get(j).cloned() else {
            return self.call_params(params, i + 1, step, depth, done);
        };
        let Some((name, value)) = params.get(i).cloned() else {
            return self.enter(step, depth, done);
        };

        let (req, res) = (self.req.clone(), self.res.clone());
        let walk = Arc::clone(&self);
        let next = Next::chain(depth, move |control, depth| match control {
            Control::Continue => walk.call_param_handler(params, i, handlers, j + 1, step, depth, done),
            control => {
                walk.record(&name, &control);
                walk.settle_params(step, control, depth, done)
            }
        });
        handler.call(req, res, next, value)
    }

    /// The recorded outcome for `name`, if it applies to `value`. Failures
    /// apply to any value, as the walk has already left the happy path.
    fn replay(&self, name: &str, value: &str) -> Option<Control> {
        let called = self.param_called.lock();
        let call = called.get(name)?;
        match &call.outcome {
            ParamOutcome::Failed(err) => Some(Control::Error(err.duplicate())),
            _ if call.value != value => None,
            ParamOutcome::Passed => Some(Control::Continue),
            ParamOutcome::Skipped => Some(Control::Route),
        }
    }

    fn record(&self, name: &str, control: &Control) {
        let outcome = match control {
            Control::Continue | Control::Router => return,
            Control::Route => ParamOutcome::Skipped,
            Control::Error(err) => ParamOutcome::Failed(err.duplicate()),
        };
        if let Some(call) = self.param_called.lock().get_mut(name) {
            call.outcome = outcome;
        }
    }

    /// Continues the walk after the param handlers ended with `control`.
    fn settle_params(self: Arc<Self>, step: Step, control: Control, depth: usize, done: Next) -> BoxFuture {
        match control {
            Control::Continue => self.enter(step, depth, done),
            Control::Error(err) => {
                let err = step.layer_error.unwrap_or(err);
                self.next(step.cursor, Control::Error(err), depth, done)
            }
            Control::Route => {
                let control = Control::from_error(step.layer_error);
                self.next(step.cursor, control, depth, done)
            }
            Control::Router => self.next(step.cursor, Control::Router, depth, done),
        }
    }

    /// Runs the matched layer, with its prefix stripped for non-route layers.
    fn enter(self: Arc<Self>, step: Step, depth: usize, done: Next) -> BoxFuture {
        let Step { layer, prefix, mut cursor, layer_error } = step;
        let (req, res) = (self.req.clone(), self.res.clone());

        if layer.route().is_none() && !prefix.is_empty() {
            let slash_added = req.strip_prefix(&prefix);
            req.set_base_url(format!("{}{}", self.parent_url, prefix.trim_end_matches('/')));
            cursor.removed = Some((prefix, slash_added));
        }

        let walk = Arc::clone(&self);
        let next = Next::chain(depth, move |control, depth| walk.next(cursor, control, depth, done));
        match layer_error {
            Some(err) => layer.handle_error(err, req, res, next),
            None => layer.handle_request(req, res, next),
        }
    }

    fn finish(self: Arc<Self>, cursor: Cursor, err: Option<Error>, depth: usize, done: Next) -> BoxFuture {
        self.req.set_base_url(self.parent_url.clone());
        self.req.set_params(self.parent_params.clone());

        if err.is_none() && self.req.method() == Method::Options && !cursor.options.is_empty() {
            let allow = cursor.options.join(",");
            debug!(allow = %allow, "automatic OPTIONS response");
            self.res.set("allow", &allow).text(allow.clone());
            return Box::pin(async {});
        }

        done.at_depth(depth).proceed(Control::from_error(err))
    }
}

/// A matched layer waiting for its param handlers.
struct Step {
    layer: Arc<Layer>,
    prefix: String,
    cursor: Cursor,
    layer_error: Option<Error>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handle, ParamHandler};
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    fn logger(log: &Log, label: &'static str) -> Endpoint {
        let log = Arc::clone(log);
        let Handle::Request(h) = Handle::request(move |req: Request, _: Response, next: Next| {
            log.lock().unwrap().push(format!("{label} {} {}", req.base_url(), req.url()));
            next.run()
        }) else {
            unreachable!()
        };
        Endpoint::Request(h)
    }

    async fn run(router: &Arc<Router>, req: Request) -> (Control, Response) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let done = Next::new(move |control| async move {
            let _ = tx.send(control);
        });
        let res = Response::new();
        router.handle(req, res.clone(), done).await;
        (rx.await.unwrap_or(Control::Continue), res)
    }

    #[tokio::test]
    async fn prefixes_are_stripped_and_restored() {
        let log = Log::default();
        let router = Arc::new(Router::new(false, false));
        router.use_at("/admin", logger(&log, "admin")).unwrap();
        router.use_at("/", logger(&log, "root")).unwrap();

        let req = Request::new(Method::Get, "/admin/users?page=2");
        let (control, _) = run(&router, req.clone()).await;

        assert!(matches!(control, Control::Continue));
        assert_eq!(*log.lock().unwrap(), ["admin /admin /users?page=2", "root  /admin/users?page=2"]);
        assert_eq!(req.url(), "/admin/users?page=2");
        assert_eq!(req.base_url(), "");
    }

    #[tokio::test]
    async fn unmatched_requests_reach_done_without_error() {
        let router = Arc::new(Router::new(false, false));
        router.route("/books").unwrap().get(|_: Request, res: Response, _: Next| async move {
            res.text("books");
        });
        let (control, res) = run(&router, Request::new(Method::Get, "/authors")).await;
        assert!(matches!(control, Control::Continue));
        assert!(!res.finished());
    }

    #[tokio::test]
    async fn one_route_per_path() {
        let router = Arc::new(Router::new(false, false));
        let first = router.route("/books").unwrap();
        let second = router.route("/books").unwrap();
        first.get(|_: Request, res: Response, _: Next| async move { res.text("a") });
        assert!(second.handles_method(Method::Get));
        assert_eq!(router.stack.read().len(), 1);
    }

    #[tokio::test]
    async fn param_handlers_run_once_per_value() {
        let log = Log::default();
        let router = Arc::new(Router::new(false, false));
        let seen = Arc::clone(&log);
        let handler = move |_: Request, _: Response, next: Next, id: String| {
            seen.lock().unwrap().push(format!("param {id}"));
            next.run()
        };
        router.param("id", handler.into_boxed_param_handler());
        let hits = Arc::clone(&log);
        router.route("/users/{id}").unwrap().all(move |req: Request, _: Response, next: Next| {
            hits.lock().unwrap().push(format!("route {}", req.param("id").unwrap_or_default()));
            next.run()
        });
        router.use_at("/users/{id}", logger(&log, "mw")).unwrap();

        run(&router, Request::new(Method::Get, "/users/7")).await;
        assert_eq!(*log.lock().unwrap(), ["param 7", "route 7", "mw /users/7 /"]);
    }

    #[tokio::test]
    async fn skipped_params_skip_later_layers_too() {
        let log = Log::default();
        let router = Arc::new(Router::new(false, false));
        let seen = Arc::clone(&log);
        let handler = move |_: Request, _: Response, next: Next, id: String| {
            seen.lock().unwrap().push(format!("param {id}"));
            next.skip_route()
        };
        router.param("id", handler.into_boxed_param_handler());
        for (path, label) in [("/u/{id}", "first"), ("/{p}/{id}", "second")] {
            let hits = Arc::clone(&log);
            router.route(path).unwrap().get(move |_: Request, _: Response, next: Next| {
                hits.lock().unwrap().push(label.to_owned());
                next.run()
            });
        }

        let (control, _) = run(&router, Request::new(Method::Get, "/u/1")).await;
        assert!(matches!(control, Control::Continue));
        assert_eq!(*log.lock().unwrap(), ["param 1"]);
    }

    #[tokio::test]
    async fn options_lists_allowed_methods() {
        let router = Arc::new(Router::new(false, false));
        let noop = |_: Request, _: Response, next: Next| next.run();
        router.route("/books").unwrap().get(noop).post(noop);
        let (_, res) = run(&router, Request::new(Method::Options, "/books")).await;
        assert_eq!(res.header("allow").as_deref(), Some("GET,POST,HEAD"));
        assert_eq!(res.body(), "GET,POST,HEAD");
    }
}
