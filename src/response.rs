//! The response handle.
//!
//! Handlers write to a shared [`Response`] and finish it with one of the
//! body methods. A finished response ignores further writes; the transport
//! converts it with [`Response::to_http`] once the chain settles.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::application::App;
use crate::error::{Error, Result};
use crate::method::Method;
use crate::request::Request;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`Response::bytes`].
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    Html,         // text/html; charset=utf-8
    Javascript,   // text/javascript; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Pdf,          // application/pdf
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::Html        => "text/html; charset=utf-8",
            Self::Javascript  => "text/javascript; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Pdf         => "application/pdf",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing response.
///
/// ```rust
/// use http::StatusCode;
/// use sluice::Response;
///
/// let res = Response::new();
/// res.status(StatusCode::CREATED)
///     .set("location", "/users/42")
///     .json(&serde_json::json!({ "id": 42 }));
/// assert!(res.finished());
/// ```
#[derive(Clone)]
pub struct Response {
    inner: Arc<Mutex<ResponseState>>,
}

struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    finished: bool,
    locals: Map<String, Value>,
    app: Option<App>,
    req: Option<Request>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResponseState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                finished: false,
                locals: Map::new(),
                app: None,
                req: None,
            })),
        }
    }

    pub fn status(&self, code: StatusCode) -> &Self {
        self.inner.lock().status = code;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.inner.lock().status
    }

    /// Sets a header, replacing any previous value. Invalid names or values
    /// are dropped with a warning.
    pub fn set(&self, name: &str, value: &str) -> &Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.inner.lock().headers.insert(name, value);
            }
            _ => warn!(header = name, "ignoring invalid response header"),
        }
        self
    }

    /// Appends a header value, keeping existing ones.
    pub fn append(&self, name: &str, value: &str) -> &Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.inner.lock().headers.append(name, value);
            }
            _ => warn!(header = name, "ignoring invalid response header"),
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<String> {
        let state = self.inner.lock();
        state.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
    }

    pub fn headers(&self) -> HeaderMap {
        self.inner.lock().headers.clone()
    }

    pub fn body(&self) -> Bytes {
        self.inner.lock().body.clone()
    }

    /// Response-scoped template locals.
    pub fn locals(&self) -> Map<String, Value> {
        self.inner.lock().locals.clone()
    }

    pub fn set_local(&self, key: impl Into<String>, value: Value) -> &Self {
        self.inner.lock().locals.insert(key.into(), value);
        self
    }

    /// `true` once a body method has run.
    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// The application the response is currently bound to.
    pub fn app(&self) -> Option<App> {
        self.inner.lock().app.clone()
    }

    /// The request this response answers.
    pub fn req(&self) -> Option<Request> {
        self.inner.lock().req.clone()
    }

    /// Looks `key` up in the bound application's response capabilities.
    pub fn capability(&self, key: &str) -> Option<Value> {
        self.app()?.response().get(key)
    }

    // ── body methods ──────────────────────────────────────────────────────────

    /// Sends raw bytes; `application/octet-stream` unless a content type is set.
    pub fn send(&self, body: impl Into<Bytes>) {
        self.finish(ContentType::OctetStream.as_str(), body.into());
    }

    pub fn bytes(&self, content_type: ContentType, body: impl Into<Bytes>) {
        self.finish(content_type.as_str(), body.into());
    }

    pub fn text(&self, body: impl Into<String>) {
        self.finish(ContentType::Text.as_str(), Bytes::from(body.into()));
    }

    pub fn html(&self, body: impl Into<String>) {
        self.finish(ContentType::Html.as_str(), Bytes::from(body.into()));
    }

    pub fn json(&self, value: &Value) {
        self.finish(ContentType::Json.as_str(), Bytes::from(value.to_string()));
    }

    /// JSON, wrapped in a call to the callback named by the query parameter
    /// given in the `jsonp callback name` setting when the request has one.
    pub fn jsonp(&self, value: &Value) {
        let Some(callback) = self.jsonp_callback() else {
            return self.json(value);
        };
        let body = value
            .to_string()
            .replace('\u{2028}', "\\u2028")
            .replace('\u{2029}', "\\u2029");
        if self.header("content-type").is_none() {
            self.set("x-content-type-options", "nosniff");
        }
        self.finish(
            ContentType::Javascript.as_str(),
            Bytes::from(format!("/**/ typeof {callback} === 'function' && {callback}({body});")),
        );
    }

    /// Sets `code` and sends its reason phrase as the body.
    pub fn send_status(&self, code: StatusCode) {
        self.status(code);
        let reason = code.canonical_reason().map_or_else(|| code.as_str().to_owned(), str::to_owned);
        self.text(reason);
    }

    /// `302 Found` to `location`.
    pub fn redirect(&self, location: &str) {
        self.status(StatusCode::FOUND).set("location", location);
        self.text(format!("Found. Redirecting to {location}"));
    }

    /// Renders `view` through the bound application with `locals` merged over
    /// [`Response::locals`], then sends the result as HTML.
    pub async fn render(&self, view: &str, locals: Value) -> Result<()> {
        let app = self
            .app()
            .ok_or_else(|| Error::config("response is not bound to an application"))?;
        let mut merged = self.locals();
        if let Value::Object(extra) = locals {
            merged.extend(extra);
        }
        let html = app.render(view, Value::Object(merged)).await?;
        self.html(html);
        Ok(())
    }

    fn jsonp_callback(&self) -> Option<String> {
        let req = self.req()?;
        let name = req
            .app()
            .and_then(|app| app.setting("jsonp callback name"))
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "callback".to_owned());
        let raw = match req.query().get(&name)? {
            Value::String(s) => s.clone(),
            Value::Array(values) => values.first()?.as_str()?.to_owned(),
            _ => return None,
        };
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '_' | '$' | '.'))
            .collect();
        (!cleaned.is_empty()).then_some(cleaned)
    }

    fn finish(&self, content_type: &'static str, body: Bytes) {
        let req = self.req();
        let etag_fn = self.app().and_then(|app| app.settings().etag_fn());

        let mut state = self.inner.lock();
        if state.finished {
            warn!("response already finished, ignoring body");
            return;
        }
        state.finished = true;

        if !state.headers.contains_key(header::CONTENT_TYPE) {
            state.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        if let Some(etag_fn) = etag_fn
            && !body.is_empty()
            && !state.headers.contains_key(header::ETAG)
            && let Ok(tag) = HeaderValue::try_from(etag_fn(&body))
        {
            state.headers.insert(header::ETAG, tag);
        }

        if let Some(req) = &req
            && is_fresh(req, &state)
        {
            debug!("conditional request is fresh");
            state.status = StatusCode::NOT_MODIFIED;
        }

        if matches!(state.status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED) {
            state.headers.remove(header::CONTENT_TYPE);
            state.headers.remove(header::CONTENT_LENGTH);
            state.headers.remove(header::TRANSFER_ENCODING);
            state.body = Bytes::new();
            return;
        }

        state.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        let head = req.is_some_and(|r| r.method() == Method::Head);
        state.body = if head { Bytes::new() } else { body };
    }

    // ── transport side ────────────────────────────────────────────────────────

    /// Converts the current state into an [`http::Response`].
    pub fn to_http(&self) -> http::Response<Full<Bytes>> {
        let state = self.inner.lock();
        let mut out = http::Response::new(Full::new(state.body.clone()));
        *out.status_mut() = state.status;
        *out.headers_mut() = state.headers.clone();
        out
    }

    pub(crate) fn set_app(&self, app: App) {
        self.inner.lock().app = Some(app);
    }

    pub(crate) fn set_req(&self, req: Request) {
        self.inner.lock().req = Some(req);
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Response")
            .field("status", &state.status)
            .field("finished", &state.finished)
            .finish_non_exhaustive()
    }
}

/// Whether a conditional GET or HEAD can be answered with `304`.
fn is_fresh(req: &Request, state: &ResponseState) -> bool {
    if !matches!(req.method(), Method::Get | Method::Head) {
        return false;
    }
    let ok = state.status.is_success() || state.status == StatusCode::NOT_MODIFIED;
    if !ok {
        return false;
    }
    if req.header("cache-control").is_some_and(|v| v.contains("no-cache")) {
        return false;
    }
    let Some(wanted) = req.header("if-none-match") else { return false };
    if wanted.trim() == "*" {
        return true;
    }
    let Some(etag) = state.headers.get(header::ETAG).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let bare = |tag: &str| tag.trim().trim_start_matches("W/").to_owned();
    wanted.split(',').any(|candidate| bare(candidate) == bare(etag))
}
