//! Minimal sluice demo: JSON endpoints, a mounted admin app and an error
//! handler.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42
//!   curl http://localhost:3000/admin
//!   curl -X OPTIONS -i http://localhost:3000/users/42

use http::StatusCode;
use serde_json::json;
use sluice::{App, Error, Next, Request, Response};

#[tokio::main]
async fn main() -> sluice::Result<()> {
    tracing_subscriber::fmt::init();

    let admin = App::new()
        .middleware(require_token)
        .get("/", |req: Request, res: Response, _: Next| async move {
            res.json(&json!({ "area": "admin", "base": req.base_url() }));
        });

    let app = App::new()
        .param("id", load_user)
        .get("/users/{id}", get_user)
        .post("/users", create_user)
        .delete("/users/{id}", delete_user)
        .mount("/admin", admin)
        .catch(|err: Error, _: Request, res: Response, _: Next| async move {
            res.status(err.status()).json(&json!({ "error": err.to_string() }));
        });

    app.listen("0.0.0.0:3000").await
}

// Runs once per distinct `{id}` before any route that captures it.
async fn load_user(_req: Request, _res: Response, next: Next, id: String) {
    if id.parse::<u64>().is_err() {
        return next.error(Error::http(StatusCode::NOT_FOUND, format!("no user {id}"))).await;
    }
    next.run().await;
}

async fn get_user(req: Request, res: Response, _: Next) {
    let id = req.param("id").unwrap_or_default();
    res.json(&json!({ "id": id, "name": "alice" }));
}

// req.body() is raw bytes; parse with serde_json::from_slice or anything else.
async fn create_user(req: Request, res: Response, next: Next) {
    if req.body().is_empty() {
        return next.error(Error::http(StatusCode::BAD_REQUEST, "empty body")).await;
    }
    res.status(StatusCode::CREATED)
        .set("location", "/users/99")
        .json(&json!({ "id": "99", "name": "new_user" }));
}

async fn delete_user(_req: Request, res: Response, _: Next) {
    res.send_status(StatusCode::NO_CONTENT);
}

async fn require_token(req: Request, _res: Response, next: Next) {
    match req.header("authorization") {
        Some(_) => next.run().await,
        None => next.error(Error::http(StatusCode::UNAUTHORIZED, "missing token")).await,
    }
}
