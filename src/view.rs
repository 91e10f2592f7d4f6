//! View lookup and rendering.
//!
//! A [`View`] binds a logical template name to a concrete file and the
//! template engine registered for its extension. sluice does not render
//! templates itself; an [`Engine`] is any async function of
//! `(file path, options) -> Result<String, BoxError>`.
//!
//! Lookup tries, for each root in order:
//!
//! ```text
//! <root>/<name>.<ext>
//! <root>/<name>/index.<ext>
//! ```
//!
//! and keeps the first file that exists.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{BoxError, Error, Result};
use crate::inherit::Inherited;

/// The future an engine returns.
pub type RenderFuture = BoxFuture<'static, Result<String, BoxError>>;

/// A template engine's render function.
pub type Engine = Arc<dyn Fn(PathBuf, Value) -> RenderFuture + Send + Sync>;

/// Obtains an engine for an extension (without the dot) that was never
/// registered with [`App::engine`](crate::App::engine).
pub type EngineLoader = Arc<dyn Fn(&str) -> Option<Engine> + Send + Sync>;

/// Builds a [`View`]; the value of the `view` setting.
pub type ViewFactory = Arc<dyn Fn(&str, &ViewOptions<'_>) -> Result<View> + Send + Sync>;

/// Wraps an async function as an [`Engine`].
///
/// ```rust
/// use sluice::view::engine;
///
/// let echo = engine(|path, options| async move {
///     Ok(format!("{} with {options}", path.display()))
/// });
/// ```
pub fn engine<F, Fut>(f: F) -> Engine
where
    F: Fn(PathBuf, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
{
    Arc::new(move |path: PathBuf, options: Value| -> RenderFuture { Box::pin(f(path, options)) })
}

/// Everything a view needs from its application to resolve itself.
pub struct ViewOptions<'a> {
    pub default_engine: Option<&'a str>,
    pub roots: &'a [PathBuf],
    engines: &'a Inherited<Engine>,
    loader: Option<&'a EngineLoader>,
}

impl<'a> ViewOptions<'a> {
    pub(crate) fn new(
        default_engine: Option<&'a str>,
        roots: &'a [PathBuf],
        engines: &'a Inherited<Engine>,
        loader: Option<&'a EngineLoader>,
    ) -> Self {
        Self { default_engine, roots, engines, loader }
    }

    /// The same options searching `roots` instead.
    pub fn with_roots<'b>(&'b self, roots: &'b [PathBuf]) -> ViewOptions<'b> {
        ViewOptions {
            default_engine: self.default_engine,
            roots,
            engines: self.engines,
            loader: self.loader,
        }
    }

    fn engine_for(&self, ext: &str) -> Result<Engine> {
        if let Some(engine) = self.engines.get(ext) {
            return Ok(engine);
        }

        let module = ext.trim_start_matches('.');
        let Some(loader) = self.loader else {
            return Err(Error::config(format!("No view engine is registered for \"{ext}\"")));
        };
        debug!(module, "loading view engine");
        let engine = loader(module).ok_or_else(|| {
            Error::config(format!("Module \"{module}\" does not provide a view engine."))
        })?;
        self.engines.set(ext, Arc::clone(&engine));
        Ok(engine)
    }
}

/// A resolved template.
pub struct View {
    name: String,
    ext: String,
    roots: Vec<PathBuf>,
    path: Option<PathBuf>,
    engine: Engine,
}

impl View {
    /// Resolves `name` against `options`.
    ///
    /// Fails if neither the name nor the default engine supplies an
    /// extension, or if no engine can be found for it. A file that cannot be
    /// found is not an error here; [`View::path`] is `None` instead.
    pub fn new(name: &str, options: &ViewOptions<'_>) -> Result<Self> {
        let (ext, file_name) = match Path::new(name).extension() {
            Some(ext) => (format!(".{}", ext.to_string_lossy()), name.to_owned()),
            None => {
                let default = options.default_engine.ok_or_else(|| {
                    Error::config("No default engine was specified and no extension was provided.")
                })?;
                let ext = if default.starts_with('.') { default.to_owned() } else { format!(".{default}") };
                let file_name = format!("{name}{ext}");
                (ext, file_name)
            }
        };

        let engine = options.engine_for(&ext)?;
        let path = lookup(&file_name, &ext, options.roots);
        debug!(name, path = ?path, "lookup");

        Ok(Self { name: name.to_owned(), ext, roots: options.roots.to_vec(), path, engine })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The extension, with its leading dot.
    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// The file the view resolved to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The lookup failure for this view.
    pub(crate) fn lookup_error(&self) -> Error {
        Error::Lookup { name: self.name.clone(), roots: self.roots.clone() }
    }

    /// Runs the engine on the resolved file.
    ///
    /// Engine failures, including panics raised while the engine is called
    /// or polled, come back as [`Error::Render`].
    pub async fn render(&self, options: Value) -> Result<String> {
        let path = self.path.clone().ok_or_else(|| self.lookup_error())?;
        debug!(path = %path.display(), "render");

        let engine = Arc::clone(&self.engine);
        let rendering = catch_unwind(AssertUnwindSafe(move || engine(path, options)))
            .map_err(|panic| Error::Render(panic_message(panic).into()))?;

        match AssertUnwindSafe(rendering).catch_unwind().await {
            Ok(Ok(html)) => Ok(html),
            Ok(Err(e)) => Err(Error::Render(e)),
            Err(panic) => Err(Error::Render(panic_message(panic).into())),
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("ext", &self.ext)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn lookup(file_name: &str, ext: &str, roots: &[PathBuf]) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        let loc = root.join(file_name);
        let dir = loc.parent()?;
        let file = loc.file_name()?.to_str()?;
        resolve(dir, file, ext)
    })
}

fn resolve(dir: &Path, file: &str, ext: &str) -> Option<PathBuf> {
    let path = dir.join(file);
    trace!(path = %path.display(), "stat");
    if path.is_file() {
        return Some(path);
    }

    let stem = file.strip_suffix(ext).unwrap_or(file);
    let path = dir.join(stem).join(format!("index{ext}"));
    trace!(path = %path.display(), "stat");
    path.is_file().then_some(path)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(msg) => (*msg).to_owned(),
            Err(_) => "view engine panicked".to_owned(),
        },
    }
}
