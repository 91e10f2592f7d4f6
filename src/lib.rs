//! # sluice
//!
//! A composable request pipeline. An [`App`] holds an ordered stack of
//! handlers; every request walks it front to back until a handler answers
//! or an error reaches the end.
//!
//! ## The contract
//!
//! Handlers are async functions of `(Request, Response, Next)`. Each one
//! either answers through the shared [`Response`] and drops its [`Next`],
//! or hands control on:
//!
//! - `next.run()` to the next matching handler
//! - `next.error(err)` to the next error handler
//! - `next.skip_route()` past the rest of the current route
//! - `next.exit_router()` out of the current application
//!
//! `Next` is consumed by the call, so a handler cannot hand control on
//! twice.
//!
//! Applications nest: [`App::mount`] installs one application under a path
//! of another, and the mounted one inherits every setting, template engine
//! and capability it does not set itself.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use sluice::{App, Error, Handle, Next, Request, Response};
//!
//! #[tokio::main]
//! async fn main() -> sluice::Result<()> {
//!     let app = App::new()
//!         .get("/users/{id}", get_user)
//!         .post("/users", create_user)
//!         .catch(|err: Error, _: Request, res: Response, _: Next| async move {
//!             res.status(err.status()).text(err.to_string());
//!         });
//!
//!     app.listen("0.0.0.0:3000").await
//! }
//!
//! async fn get_user(req: Request, res: Response, _: Next) {
//!     let id = req.param("id").unwrap_or_default();
//!     res.json(&serde_json::json!({ "id": id }));
//! }
//!
//! async fn create_user(req: Request, res: Response, next: Next) {
//!     if req.body().is_empty() {
//!         return next.error(Error::http(StatusCode::BAD_REQUEST, "empty body")).await;
//!     }
//!     res.status(StatusCode::CREATED).set("location", "/users/99").text("created");
//! }
//! ```
//!
//! ## Views
//!
//! sluice finds templates and hands them to the [engine](view::Engine)
//! registered for their extension; it does not implement a template
//! language. See [`App::render`] and the [`view`] module.

mod application;
mod error;
mod final_handler;
mod handler;
mod inherit;
mod layer;
mod matcher;
mod method;
mod middleware;
mod next;
mod request;
mod response;
mod route;
mod router;
mod server;
mod settings;

pub mod view;

pub use application::{App, Capabilities, ENV_VAR};
pub use error::{BoxError, Error, Result};
pub use final_handler::FinalHandler;
pub use handler::{BoxFuture, ErrorHandler, Handle, Handler, IntoHandles, ParamHandler};
pub use method::Method;
pub use next::{Control, MAX_SYNC_DEPTH, Next};
pub use request::Request;
pub use response::{ContentType, Response};
pub use route::Route;
pub use server::{Server, serve_listener};
pub use settings::{EtagFn, QueryParserFn, Settings, TrustFn};
pub use view::{Engine, View};
