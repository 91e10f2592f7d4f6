//! The request handle.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::application::App;
use crate::method::Method;
use crate::route::Route;
use crate::settings::TrustFn;

/// An incoming request.
///
/// Cloning is cheap and every clone sees the same state, so the request can
/// be passed down the chain while earlier handlers still hold it. The router
/// and the built-in layers update it as it travels: the path relative to the
/// current mount point, the captured params, the parsed query and the
/// application it is currently bound to.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Mutex<RequestState>>,
}

struct RequestState {
    method: Method,
    original_url: String,
    url: String,
    base_url: String,
    headers: HeaderMap,
    body: Bytes,
    params: HashMap<String, String>,
    query: Option<Value>,
    route: Option<Route>,
    app: Option<App>,
    remote_addr: Option<SocketAddr>,
    encrypted: bool,
}

impl Request {
    /// A request for `url` (path and optional query string).
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            inner: Arc::new(Mutex::new(RequestState {
                method,
                original_url: url.clone(),
                url,
                base_url: String::new(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
                params: HashMap::new(),
                query: None,
                route: None,
                app: None,
                remote_addr: None,
                encrypted: false,
            })),
        }
    }

    /// Adds a header. Invalid names or values are ignored.
    pub fn with_header(self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name), HeaderValue::try_from(value))
        {
            self.inner.lock().headers.append(name, value);
        }
        self
    }

    pub fn with_headers(self, headers: HeaderMap) -> Self {
        self.inner.lock().headers = headers;
        self
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        self.inner.lock().body = body.into();
        self
    }

    /// The peer address of the connection the request arrived on.
    pub fn with_remote_addr(self, addr: SocketAddr) -> Self {
        self.inner.lock().remote_addr = Some(addr);
        self
    }

    /// Marks the connection as TLS-terminated by the transport itself.
    pub fn with_encrypted(self, encrypted: bool) -> Self {
        self.inner.lock().encrypted = encrypted;
        self
    }

    pub fn method(&self) -> Method {
        self.inner.lock().method
    }

    /// The URL relative to the current mount point, query included.
    pub fn url(&self) -> String {
        self.inner.lock().url.clone()
    }

    /// The path relative to the current mount point.
    pub fn path(&self) -> String {
        let state = self.inner.lock();
        split_query(&state.url).0.to_owned()
    }

    /// The URL as the transport received it.
    pub fn original_url(&self) -> String {
        self.inner.lock().original_url.clone()
    }

    /// The path the current mount point was matched at.
    pub fn base_url(&self) -> String {
        self.inner.lock().base_url.clone()
    }

    /// Raw query string, without the `?`.
    pub fn query_string(&self) -> Option<String> {
        let state = self.inner.lock();
        split_query(&state.url).1.map(str::to_owned)
    }

    /// The parsed query; an empty object before the query layer runs or when
    /// query parsing is disabled.
    pub fn query(&self) -> Value {
        self.inner.lock().query.clone().unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Case-insensitive header lookup.
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

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<String> {
        self.inner.lock().params.get(key).cloned()
    }

    pub fn params(&self) -> HashMap<String, String> {
        self.inner.lock().params.clone()
    }

    /// The route currently dispatching this request.
    pub fn route(&self) -> Option<Route> {
        self.inner.lock().route.clone()
    }

    /// The application the request is currently bound to.
    pub fn app(&self) -> Option<App> {
        self.inner.lock().app.clone()
    }

    /// Looks `key` up in the bound application's request capabilities.
    pub fn capability(&self, key: &str) -> Option<Value> {
        self.app()?.request().get(key)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().remote_addr
    }

    // ── trust-proxy aware accessors ───────────────────────────────────────────

    /// The client address: the socket peer, or the nearest untrusted entry of
    /// `X-Forwarded-For` when the peer is a trusted proxy.
    pub fn ip(&self) -> Option<IpAddr> {
        self.trusted_chain().last().copied()
    }

    /// Forwarded client addresses, farthest first, when the peer is trusted.
    pub fn ips(&self) -> Vec<IpAddr> {
        let mut chain = self.trusted_chain();
        if chain.is_empty() {
            return chain;
        }
        chain.remove(0);
        chain.reverse();
        chain
    }

    /// `"https"` or `"http"`, honouring `X-Forwarded-Proto` from trusted peers.
    pub fn protocol(&self) -> String {
        let own = if self.inner.lock().encrypted { "https" } else { "http" };
        if !self.peer_trusted() {
            return own.to_owned();
        }
        self.header("x-forwarded-proto")
            .and_then(|v| v.split(',').next().map(|p| p.trim().to_owned()))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| own.to_owned())
    }

    pub fn secure(&self) -> bool {
        self.protocol() == "https"
    }

    /// Host name without port, honouring `X-Forwarded-Host` from trusted peers.
    pub fn hostname(&self) -> Option<String> {
        let forwarded = self
            .peer_trusted()
            .then(|| self.header("x-forwarded-host"))
            .flatten()
            .and_then(|v| v.split(',').next().map(|h| h.trim().to_owned()));
        let host = forwarded.or_else(|| self.header("host"))?;
        Some(strip_port(&host).to_owned())
    }

    /// Subdomains, nearest the root first, skipping `subdomain offset` labels.
    pub fn subdomains(&self) -> Vec<String> {
        let Some(host) = self.hostname() else { return Vec::new() };
        if host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok() {
            return Vec::new();
        }
        let offset = self
            .app()
            .and_then(|app| app.setting("subdomain offset"))
            .and_then(|v| v.as_u64())
            .unwrap_or(2);
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        host.rsplit('.').skip(offset).map(str::to_owned).collect()
    }

    fn trust_fn(&self) -> Option<TrustFn> {
        self.app()?.settings().trust_fn()
    }

    fn peer_trusted(&self) -> bool {
        match (self.remote_addr(), self.trust_fn()) {
            (Some(peer), Some(trust)) => trust(peer.ip(), 0),
            _ => false,
        }
    }

    /// Socket peer followed by `X-Forwarded-For` entries nearest first, cut
    /// after the first address that is not a trusted proxy.
    fn trusted_chain(&self) -> Vec<IpAddr> {
        let Some(peer) = self.remote_addr() else { return Vec::new() };
        let mut chain = vec![peer.ip()];
        if let Some(forwarded) = self.header("x-forwarded-for") {
            chain.extend(forwarded.rsplit(',').filter_map(|a| a.trim().parse::<IpAddr>().ok()));
        }
        let Some(trust) = self.trust_fn() else {
            chain.truncate(1);
            return chain;
        };
        if let Some(cut) = (0..chain.len() - 1).find(|&i| !trust(chain[i], i)) {
            chain.truncate(cut + 1);
        }
        chain
    }

    // ── router bookkeeping ────────────────────────────────────────────────────

    pub(crate) fn set_params(&self, params: HashMap<String, String>) {
        self.inner.lock().params = params;
    }

    pub(crate) fn set_query(&self, query: Value) {
        self.inner.lock().query = Some(query);
    }

    pub(crate) fn has_query(&self) -> bool {
        self.inner.lock().query.is_some()
    }

    pub(crate) fn set_route(&self, route: Route) {
        self.inner.lock().route = Some(route);
    }

    pub(crate) fn set_app(&self, app: App) {
        self.inner.lock().app = Some(app);
    }

    pub(crate) fn set_base_url(&self, base_url: String) {
        self.inner.lock().base_url = base_url;
    }

    /// Removes `prefix` from the front of the URL. Returns whether a leading
    /// slash had to be added to what was left.
    pub(crate) fn strip_prefix(&self, prefix: &str) -> bool {
        let mut state = self.inner.lock();
        let rest = state.url.get(prefix.len()..).unwrap_or_default().to_owned();
        let slash_added = !rest.starts_with('/');
        state.url = if slash_added { format!("/{rest}") } else { rest };
        slash_added
    }

    /// Undoes [`Request::strip_prefix`].
    pub(crate) fn restore_prefix(&self, prefix: &str, slash_added: bool) {
        let mut state = self.inner.lock();
        let rest = if slash_added { &state.url[1..] } else { &state.url[..] };
        state.url = format!("{prefix}{rest}");
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Request")
            .field("method", &state.method)
            .field("url", &state.url)
            .field("base_url", &state.base_url)
            .finish_non_exhaustive()
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_excludes_the_query() {
        let req = Request::new(Method::Get, "/search?q=rust");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string().as_deref(), Some("q=rust"));
    }

    #[test]
    fn prefix_round_trip_restores_the_url() {
        let req = Request::new(Method::Get, "/admin?x=1");
        let added = req.strip_prefix("/admin");
        assert!(added);
        assert_eq!(req.url(), "/?x=1");
        assert_eq!(req.path(), "/");
        req.restore_prefix("/admin", added);
        assert_eq!(req.url(), "/admin?x=1");
    }

    #[test]
    fn untrusted_peers_are_the_client() {
        let req = Request::new(Method::Get, "/")
            .with_remote_addr("10.0.0.1:5000".parse().unwrap())
            .with_header("x-forwarded-for", "203.0.113.9");
        assert_eq!(req.ip(), Some("10.0.0.1".parse().unwrap()));
        assert!(req.ips().is_empty());
    }

    #[test]
    fn trusted_peers_reveal_forwarded_clients() {
        let app = App::new().set("trust proxy", json!("loopback, 10.0.0.0/8"));
        let req = Request::new(Method::Get, "/")
            .with_remote_addr("10.0.0.1:5000".parse().unwrap())
            .with_header("x-forwarded-for", "203.0.113.9, 10.0.0.7")
            .with_header("x-forwarded-proto", "https")
            .with_header("x-forwarded-host", "shop.eu.example.com:8443");
        req.set_app(app);

        assert_eq!(req.ip(), Some("203.0.113.9".parse().unwrap()));
        assert_eq!(req.ips(), vec!["203.0.113.9".parse::<IpAddr>().unwrap(), "10.0.0.7".parse().unwrap()]);
        assert_eq!(req.protocol(), "https");
        assert_eq!(req.hostname().as_deref(), Some("shop.eu.example.com"));
        assert_eq!(req.subdomains(), vec!["eu", "shop"]);
    }
}
