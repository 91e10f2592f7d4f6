//! Applications: settings, a handler stack, views, and mounting.
//!
//! ```rust,no_run
//! use sluice::{App, Next, Request, Response};
//!
//! #[tokio::main]
//! async fn main() -> sluice::Result<()> {
//!     let admin = App::new()
//!         .get("/", |_: Request, res: Response, _: Next| async move { res.text("admin home") });
//!
//!     let app = App::new()
//!         .middleware(|req: Request, _: Response, next: Next| async move {
//!             tracing::info!(url = %req.url(), "request");
//!             next.run().await
//!         })
//!         .mount("/admin", admin)
//!         .get("/users/{id}", |req: Request, res: Response, _: Next| async move {
//!             res.text(format!("user {}", req.param("id").unwrap_or_default()));
//!         });
//!
//!     app.listen("0.0.0.0:3000").await
//! }
//! ```
//!
//! # Mounting
//!
//! A mounted application keeps its own stack and settings but falls back to
//! its parent's for every setting, template engine and capability it does
//! not define itself. Requests entering it have the mount path stripped from
//! [`Request::url`] and appended to [`Request::base_url`]; both are restored
//! on the way out.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{Error, Result};
use crate::final_handler::FinalHandler;
use crate::handler::{BoxFuture, ErrorHandler, Handle, IntoHandles, ParamHandler};
use crate::inherit::Inherited;
use crate::layer::Endpoint;
use crate::method::Method;
use crate::middleware;
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;
use crate::router::Router;
use crate::server::Server;
use crate::settings::{Settings, truthy};
use crate::view::{Engine, EngineLoader, View, ViewFactory, ViewOptions};

/// Environment variable that seeds the `env` setting.
pub const ENV_VAR: &str = "SLUICE_ENV";

/// Named values shared by every request or response bound to an application.
///
/// A mounted application's capabilities fall back to its parent's.
pub struct Capabilities {
    table: Arc<Inherited<Value>>,
}

impl Capabilities {
    fn new() -> Self {
        Self { table: Arc::new(Inherited::new()) }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.table.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.table.set(key, value);
    }

    fn inherit_from(&self, parent: &Capabilities) {
        self.table.set_parent(Arc::clone(&parent.table));
    }
}

/// An application. Cloning yields another handle to the same application.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    settings: Settings,
    router: OnceLock<Arc<Router>>,
    mountpath: RwLock<String>,
    parent: RwLock<Weak<AppInner>>,
    engines: Arc<Inherited<Engine>>,
    engine_loader: RwLock<Option<EngineLoader>>,
    locals: RwLock<Map<String, Value>>,
    request: Capabilities,
    response: Capabilities,
    cache: Mutex<HashMap<String, Arc<View>>>,
}

/// A non-owning handle, for layers an application installs on itself.
#[derive(Clone)]
pub(crate) struct WeakApp(Weak<AppInner>);

impl WeakApp {
    pub(crate) fn upgrade(&self) -> Option<App> {
        self.0.upgrade().map(|inner| App { inner })
    }
}

impl App {
    /// A new application with the default configuration.
    pub fn new() -> Self {
        let app = Self {
            inner: Arc::new(AppInner {
                settings: Settings::new(),
                router: OnceLock::new(),
                mountpath: RwLock::new("/".to_owned()),
                parent: RwLock::new(Weak::new()),
                engines: Arc::new(Inherited::new()),
                engine_loader: RwLock::new(None),
                locals: RwLock::new(Map::new()),
                request: Capabilities::new(),
                response: Capabilities::new(),
                cache: Mutex::new(HashMap::new()),
            }),
        };
        app.default_configuration();
        app
    }

    fn default_configuration(&self) {
        let env = env::var(ENV_VAR).unwrap_or_else(|_| "development".to_owned());
        let views = env::current_dir().unwrap_or_default().join("views");

        let defaults = [
            ("x-powered-by", json!(true)),
            ("etag", json!("weak")),
            ("env", json!(env)),
            ("query parser", json!("extended")),
            ("subdomain offset", json!(2)),
            ("trust proxy", json!(false)),
            ("views", json!(views.to_string_lossy())),
            ("jsonp callback name", json!("callback")),
        ];
        let production = env == "production";
        for (key, value) in defaults.into_iter().chain(production.then(|| ("view cache", json!(true)))) {
            if let Err(e) = self.inner.settings.set_default(key, value) {
                debug!(setting = key, "default rejected: {e}");
            }
        }

        debug!(env = %env, "booting in {env} mode");
    }

    pub(crate) fn downgrade(&self) -> WeakApp {
        WeakApp(Arc::downgrade(&self.inner))
    }

    /// The router, built with the routing settings in effect on first use.
    fn router(&self) -> &Arc<Router> {
        self.inner.router.get_or_init(|| {
            let router = Router::new(
                self.enabled("case sensitive routing"),
                self.enabled("strict routing"),
            );
            for handle in [middleware::query(self.downgrade()), middleware::init(self.downgrade())] {
                if let Handle::Request(h) = handle {
                    router.push(Endpoint::Request(h));
                }
            }
            Arc::new(router)
        })
    }

    // ── settings ──────────────────────────────────────────────────────────────

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Looks a setting up here, then through every ancestor.
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.inner.settings.get(key)
    }

    /// Writes a setting.
    ///
    /// # Panics
    ///
    /// Panics if a setting with a derived function gets a value it does not
    /// accept. [`App::try_set`] returns the error instead.
    pub fn set(self, key: &str, value: Value) -> Self {
        self.try_set(key, value).unwrap_or_else(|e| panic!("{e}"));
        self
    }

    pub fn try_set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.settings.set(key, value)
    }

    pub fn enable(self, key: &str) -> Self {
        self.set(key, Value::Bool(true))
    }

    pub fn disable(self, key: &str) -> Self {
        self.set(key, Value::Bool(false))
    }

    pub fn enabled(&self, key: &str) -> bool {
        self.inner.settings.enabled(key)
    }

    pub fn disabled(&self, key: &str) -> bool {
        self.inner.settings.disabled(key)
    }

    // ── middleware and mounting ───────────────────────────────────────────────

    /// Appends handlers that run for every request.
    pub fn middleware(self, handlers: impl IntoHandles) -> Self {
        self.middleware_at("/", handlers)
    }

    /// Appends handlers that run for requests under `path`. An [`App`] among
    /// them is mounted there.
    ///
    /// # Panics
    ///
    /// Panics if `handlers` is empty or `path` is not a valid pattern.
    pub fn middleware_at(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.try_middleware_at(path, handlers).unwrap_or_else(|e| panic!("{e}"));
        self
    }

    pub fn try_middleware_at(&self, path: &str, handlers: impl IntoHandles) -> Result<()> {
        let handles = handlers.into_handles();
        if handles.is_empty() {
            return Err(Error::config("app.use() requires a middleware function"));
        }

        let router = self.router();
        for handle in handles {
            match handle {
                Handle::Request(h) => router.use_at(path, Endpoint::Request(h))?,
                Handle::Error(h) => router.use_at(path, Endpoint::Error(h))?,
                Handle::App(child) => self.try_mount(path, child)?,
            }
        }
        Ok(())
    }

    /// Mounts `child` at `path`.
    pub fn mount(self, path: &str, child: App) -> Self {
        self.middleware_at(path, child)
    }

    /// Appends an error handler that runs for every request.
    pub fn catch(self, handler: impl ErrorHandler) -> Self {
        self.middleware(Handle::error(handler))
    }

    fn try_mount(&self, path: &str, child: App) -> Result<()> {
        if Arc::ptr_eq(&self.inner, &child.inner) || self.has_ancestor(&child) {
            return Err(Error::config("an application cannot be mounted inside itself"));
        }
        debug!(path, "mount app");

        *child.inner.mountpath.write() = path.to_owned();
        *child.inner.parent.write() = Arc::downgrade(&self.inner);

        let mounted = child.clone();
        let handle = Handle::request(move |req: Request, res: Response, next: Next| -> BoxFuture {
            let outer = req.app();
            let depth = next.depth();
            let (back_req, back_res) = (req.clone(), res.clone());
            let done = Next::chain(depth, move |control, depth| {
                if let Some(app) = outer {
                    back_req.set_app(app.clone());
                    back_res.set_app(app);
                }
                next.at_depth(depth).proceed(control)
            });
            mounted.handle_with(req, res, done)
        });
        if let Handle::Request(h) = handle {
            self.router().use_at(path, Endpoint::Request(h))?;
        }

        child.on_mount(self);
        Ok(())
    }

    /// Links the mounted application's tables to its new parent's.
    fn on_mount(&self, parent: &App) {
        self.inner.settings.inherit_from(&parent.inner.settings);
        self.inner.request.inherit_from(&parent.inner.request);
        self.inner.response.inherit_from(&parent.inner.response);
        self.inner.engines.set_parent(Arc::clone(&parent.inner.engines));
    }

    fn has_ancestor(&self, candidate: &App) -> bool {
        let mut current = self.parent();
        while let Some(app) = current {
            if Arc::ptr_eq(&app.inner, &candidate.inner) {
                return true;
            }
            current = app.parent();
        }
        false
    }

    /// The application this one is mounted in.
    pub fn parent(&self) -> Option<App> {
        self.inner.parent.read().upgrade().map(|inner| App { inner })
    }

    /// The path this application is mounted at; `/` until mounted.
    pub fn mountpath(&self) -> String {
        self.inner.mountpath.read().clone()
    }

    /// The full mount path through every ancestor; empty for the top level.
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}{}", parent.path(), self.mountpath()),
            None => String::new(),
        }
    }

    // ── routes ────────────────────────────────────────────────────────────────

    /// The route for `path`, created on first use.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid pattern; see [`App::try_route`].
    pub fn route(&self, path: &str) -> Route {
        self.try_route(path).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_route(&self, path: &str) -> Result<Route> {
        self.router().route(path)
    }

    pub fn on(self, method: Method, path: &str, handlers: impl IntoHandles) -> Self {
        self.route(path).on(method, handlers);
        self
    }

    /// Handlers for `path` that answer every method.
    pub fn all(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.route(path).all(handlers);
        self
    }

    pub fn get(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Get, path, handlers)
    }

    pub fn post(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Post, path, handlers)
    }

    pub fn put(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Put, path, handlers)
    }

    pub fn delete(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Delete, path, handlers)
    }

    pub fn patch(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Patch, path, handlers)
    }

    pub fn head(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Head, path, handlers)
    }

    pub fn options(self, path: &str, handlers: impl IntoHandles) -> Self {
        self.on(Method::Options, path, handlers)
    }

    /// Runs `handler` before any route capturing the parameter `name`, once
    /// per distinct value per request.
    pub fn param(self, name: &str, handler: impl ParamHandler) -> Self {
        self.router().param(name, handler.into_boxed_param_handler());
        self
    }

    /// [`App::param`] for several names sharing one handler.
    pub fn params(self, names: &[&str], handler: impl ParamHandler) -> Self {
        let handler = handler.into_boxed_param_handler();
        for name in names {
            self.router().param(name, Arc::clone(&handler));
        }
        self
    }

    // ── capabilities and locals ───────────────────────────────────────────────

    /// Capabilities of requests bound to this application.
    pub fn request(&self) -> &Capabilities {
        &self.inner.request
    }

    /// Capabilities of responses bound to this application.
    pub fn response(&self) -> &Capabilities {
        &self.inner.response
    }

    /// Render locals shared by every view of this application.
    pub fn locals(&self) -> Map<String, Value> {
        self.inner.locals.read().clone()
    }

    pub fn local(self, key: impl Into<String>, value: Value) -> Self {
        self.inner.locals.write().insert(key.into(), value);
        self
    }

    // ── views ─────────────────────────────────────────────────────────────────

    /// Registers `engine` for files with extension `ext` (with or without the
    /// leading dot).
    pub fn engine(self, ext: &str, engine: Engine) -> Self {
        let ext = if ext.starts_with('.') { ext.to_owned() } else { format!(".{ext}") };
        debug!(ext = %ext, "engine");
        self.inner.engines.set(ext, engine);
        self
    }

    /// Supplies engines for extensions that were never registered.
    pub fn engine_loader(self, loader: EngineLoader) -> Self {
        *self.inner.engine_loader.write() = Some(loader);
        self
    }

    /// Replaces [`View::new`] as the way this application builds views.
    pub fn view_factory(self, factory: ViewFactory) -> Self {
        self.inner.settings.set_view_factory(factory);
        self
    }

    fn loader(&self) -> Option<EngineLoader> {
        if let Some(loader) = self.inner.engine_loader.read().clone() {
            return Some(loader);
        }
        self.parent()?.loader()
    }

    fn view_roots(&self) -> Vec<PathBuf> {
        match self.setting("views") {
            Some(Value::String(root)) => vec![PathBuf::from(root)],
            Some(Value::Array(roots)) => {
                roots.iter().filter_map(Value::as_str).map(PathBuf::from).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Renders the view `name`.
    ///
    /// Options are the application's [locals](App::locals), then the entries
    /// of an `_locals` object in `options`, then `options` itself, plus a
    /// `settings` snapshot. Views are cached by name when `options.cache` is
    /// truthy, or when it is absent and `view cache` is enabled.
    pub async fn render(&self, name: &str, options: Value) -> Result<String> {
        let mut options = match options {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(Error::config(format!("render options must be an object, got {other}"))),
        };

        let mut merged = self.locals();
        if let Some(Value::Object(locals)) = options.remove("_locals") {
            merged.extend(locals);
        }
        merged.extend(options);
        merged
            .entry("settings")
            .or_insert_with(|| Value::Object(self.inner.settings.snapshot()));

        let cache = merged.get("cache").map_or_else(|| self.enabled("view cache"), truthy);
        let view = self.lookup_view(name, cache)?;
        view.render(Value::Object(merged)).await
    }

    fn lookup_view(&self, name: &str, cache: bool) -> Result<Arc<View>> {
        if cache && let Some(view) = self.inner.cache.lock().get(name) {
            return Ok(Arc::clone(view));
        }

        let roots = self.view_roots();
        let default_engine = self.setting("view engine").and_then(|v| v.as_str().map(str::to_owned));
        let loader = self.loader();
        let options = ViewOptions::new(default_engine.as_deref(), &roots, &self.inner.engines, loader.as_ref());

        let view = match self.inner.settings.view_factory() {
            Some(factory) => factory(name, &options)?,
            None => View::new(name, &options)?,
        };
        if view.path().is_none() {
            return Err(view.lookup_error());
        }

        let view = Arc::new(view);
        if cache {
            self.inner.cache.lock().insert(name.to_owned(), Arc::clone(&view));
        }
        Ok(view)
    }

    // ── dispatch ──────────────────────────────────────────────────────────────

    /// Dispatches one request, finishing with a [`FinalHandler`] for the
    /// current `env`.
    pub async fn handle(&self, req: Request, res: Response) {
        let env = self
            .setting("env")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "development".to_owned());
        let done = FinalHandler::new(env).into_next(req.clone(), res.clone());
        self.handle_with(req, res, done).await;
    }

    /// Dispatches one request, handing the outcome to `done`.
    pub fn handle_with(&self, req: Request, res: Response, done: Next) -> BoxFuture {
        match self.inner.router.get() {
            Some(router) => router.handle(req, res, done),
            None => done.run(),
        }
    }

    /// Serves the application over HTTP until SIGTERM or Ctrl-C.
    pub async fn listen(self, addr: &str) -> Result<()> {
        Server::bind(addr)?.serve(self).await
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("mountpath", &self.mountpath())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
