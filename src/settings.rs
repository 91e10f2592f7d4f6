//! Application settings.
//!
//! A settings store is a string-keyed table of JSON values that falls back
//! to the parent application's store once mounted. A few settings compile a
//! derived function when written; the function is stored under a derived key
//! and inherited the same way:
//!
//! | Setting        | Accepted values                                   | Derived key       |
//! |----------------|---------------------------------------------------|-------------------|
//! | `etag`         | `"weak"`, `"strong"`, `true`, `false`             | `etag fn`         |
//! | `query parser` | `"extended"`, `"simple"`, `true`, `false`         | `query parser fn` |
//! | `trust proxy`  | bool, hop count, IP/CIDR list or preset names     | `trust proxy fn`  |
//!
//! Other recognised settings are plain values read where they apply:
//! `env`, `views`, `view engine`, `view cache`, `case sensitive routing`,
//! `strict routing`, `jsonp callback name`, `subdomain offset`,
//! `x-powered-by`. The `view` setting holds a [`ViewFactory`] and is written
//! with [`App::view_factory`](crate::App::view_factory).

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ipnet::IpNet;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::inherit::Inherited;
use crate::view::ViewFactory;

/// Computes an `ETag` header value for a response body.
pub type EtagFn = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Parses a raw query string into a JSON object.
pub type QueryParserFn = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Decides whether the address `hops` steps from the socket is a trusted proxy.
pub type TrustFn = Arc<dyn Fn(IpAddr, usize) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Setting {
    Value(Value),
    Etag(Option<EtagFn>),
    QueryParser(Option<QueryParserFn>),
    Trust(TrustFn),
    View(ViewFactory),
}

/// The settings store of one application.
///
/// Explicit values live in the store's own table. Built-in defaults live in
/// a table underneath it, which is replaced by the parent's chain when the
/// owning application is mounted:
///
/// ```text
/// unmounted:  own ──▶ defaults
/// mounted:    own ──▶ parent own ──▶ … ──▶ root defaults
/// ```
///
/// A mounted application therefore sees every value it has not set itself
/// through its parent, including `trust proxy`.
pub struct Settings {
    table: Arc<Inherited<Setting>>,
    defaults: Arc<Inherited<Setting>>,
}

impl Settings {
    pub(crate) fn new() -> Self {
        let defaults = Arc::new(Inherited::new());
        let table = Arc::new(Inherited::new());
        table.set_parent(Arc::clone(&defaults));
        Self { table, defaults }
    }

    /// Looks `key` up here, then through every ancestor store.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.table.get(key)? {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Writes `key` locally, recompiling its derived function if it has one.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        debug!(setting = key, value = %value, "set");
        write(&self.table, key, value)
    }

    /// Writes a built-in default, which explicit values anywhere up the
    /// chain shadow.
    pub(crate) fn set_default(&self, key: &str, value: Value) -> Result<()> {
        write(&self.defaults, key, value)
    }

    /// `true` unless the setting is missing, `false`, `null`, `0` or `""`.
    pub fn enabled(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| truthy(&v))
    }

    pub fn disabled(&self, key: &str) -> bool {
        !self.enabled(key)
    }

    pub fn enable(&self, key: &str) -> Result<()> {
        self.set(key, Value::Bool(true))
    }

    pub fn disable(&self, key: &str) -> Result<()> {
        self.set(key, Value::Bool(false))
    }

    /// Every visible plain value, for exposing to templates.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.table
            .flatten()
            .into_iter()
            .filter_map(|(k, v)| match v {
                Setting::Value(v) => Some((k, v)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn etag_fn(&self) -> Option<EtagFn> {
        match self.table.get("etag fn")? {
            Setting::Etag(f) => f,
            _ => None,
        }
    }

    pub(crate) fn query_parser_fn(&self) -> Option<QueryParserFn> {
        match self.table.get("query parser fn")? {
            Setting::QueryParser(f) => f,
            _ => None,
        }
    }

    pub(crate) fn trust_fn(&self) -> Option<TrustFn> {
        match self.table.get("trust proxy fn")? {
            Setting::Trust(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn view_factory(&self) -> Option<ViewFactory> {
        match self.table.get("view")? {
            Setting::View(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn set_view_factory(&self, factory: ViewFactory) {
        self.table.set("view", Setting::View(factory));
    }

    /// Links this store under `parent`, called when the owning application
    /// is mounted. Own values keep shadowing the parent's.
    pub(crate) fn inherit_from(&self, parent: &Settings) {
        self.table.set_parent(Arc::clone(&parent.table));
    }
}

fn write(table: &Inherited<Setting>, key: &str, value: Value) -> Result<()> {
    match key {
        "etag" => {
            let f = compile_etag(&value)?;
            table.set("etag fn", Setting::Etag(f));
        }
        "query parser" => {
            let f = compile_query_parser(&value)?;
            table.set("query parser fn", Setting::QueryParser(f));
        }
        "trust proxy" => {
            let f = compile_trust(&value)?;
            table.set("trust proxy fn", Setting::Trust(f));
        }
        _ => {}
    }
    table.set(key, Setting::Value(value));
    Ok(())
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ── etag ──────────────────────────────────────────────────────────────────────

pub(crate) fn compile_etag(value: &Value) -> Result<Option<EtagFn>> {
    let weak = match value {
        Value::Bool(true) => true,
        Value::Bool(false) => return Ok(None),
        Value::String(s) if s == "weak" => true,
        Value::String(s) if s == "strong" => false,
        other => return Err(Error::config(format!("unknown value for etag function: {other}"))),
    };
    Ok(Some(Arc::new(move |body: &[u8]| etag(body, weak))))
}

fn etag(body: &[u8], weak: bool) -> String {
    let digest = STANDARD_NO_PAD.encode(Sha256::digest(body));
    let tag = format!("\"{:x}-{}\"", body.len(), &digest[..27]);
    if weak { format!("W/{tag}") } else { tag }
}

// ── query parser ──────────────────────────────────────────────────────────────

pub(crate) fn compile_query_parser(value: &Value) -> Result<Option<QueryParserFn>> {
    let f: QueryParserFn = match value {
        Value::Bool(false) => return Ok(None),
        Value::Bool(true) => Arc::new(parse_extended),
        Value::String(s) if s == "extended" => Arc::new(parse_extended),
        Value::String(s) if s == "simple" => Arc::new(parse_simple),
        other => {
            return Err(Error::config(format!("unknown value for query parser function: {other}")));
        }
    };
    Ok(Some(f))
}

/// Flat `key=value` pairs; repeated keys collect into an array.
pub(crate) fn parse_simple(query: &str) -> Value {
    let mut out = Map::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        push_value(&mut out, k.into_owned(), Value::String(v.into_owned()));
    }
    Value::Object(out)
}

const MAX_QUERY_DEPTH: usize = 5;

/// Like [`parse_simple`] but expands bracketed keys: `a[b]=1` becomes
/// `{"a":{"b":"1"}}` and `a[]=1&a[]=2` becomes `{"a":["1","2"]}`.
pub(crate) fn parse_extended(query: &str) -> Value {
    let mut out = Map::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        let segments = key_segments(&k);
        insert_nested(&mut out, &segments, Value::String(v.into_owned()));
    }
    Value::Object(out)
}

fn key_segments(key: &str) -> Vec<String> {
    let Some(open) = key.find('[').filter(|&i| i > 0) else {
        return vec![key.to_owned()];
    };
    let mut segments = vec![key[..open].to_owned()];
    let mut rest = &key[open..];
    while segments.len() <= MAX_QUERY_DEPTH {
        let Some(inner) = rest.strip_prefix('[') else { break };
        let Some(close) = inner.find(']') else { break };
        segments.push(inner[..close].to_owned());
        rest = &inner[close + 1..];
    }
    if !rest.is_empty() {
        // Whatever could not be parsed stays a literal key segment.
        segments.push(rest.to_owned());
    }
    segments
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[String], value: Value) {
    match segments {
        [] => {}
        [last] => push_value(map, last.clone(), value),
        [head, next, ..] if next.is_empty() && segments.len() == 2 => {
            let slot = map.entry(head.clone()).or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(items) => items.push(value),
                other => *other = Value::Array(vec![other.take(), value]),
            }
        }
        [head, rest @ ..] => {
            let slot = map.entry(head.clone()).or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                insert_nested(inner, rest, value);
            }
        }
    }
}

fn push_value(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        None => {
            map.insert(key, value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => *existing = Value::Array(vec![existing.take(), value]),
    }
}

// ── trust proxy ───────────────────────────────────────────────────────────────

pub(crate) fn compile_trust(value: &Value) -> Result<TrustFn> {
    match value {
        Value::Bool(all) => {
            let all = *all;
            Ok(Arc::new(move |_: IpAddr, _: usize| all))
        }
        Value::Null => Ok(Arc::new(|_: IpAddr, _: usize| false)),
        Value::Number(n) => {
            let hops = n
                .as_u64()
                .ok_or_else(|| Error::config(format!("invalid trust proxy hop count: {n}")))?;
            let hops = usize::try_from(hops).unwrap_or(usize::MAX);
            Ok(Arc::new(move |_: IpAddr, i: usize| i < hops))
        }
        Value::String(list) => compile_subnets(list.split(',').map(str::trim)),
        Value::Array(items) => {
            let names = items
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| Error::config(format!("invalid trust proxy entry: {v}")))
                })
                .collect::<Result<Vec<_>>>()?;
            compile_subnets(names.into_iter().map(str::trim))
        }
        Value::Object(_) => Err(Error::config(format!("unknown value for trust proxy: {value}"))),
    }
}

fn compile_subnets<'a>(entries: impl Iterator<Item = &'a str>) -> Result<TrustFn> {
    let mut subnets = Vec::new();
    for entry in entries.filter(|e| !e.is_empty()) {
        match entry {
            "loopback" => subnets.extend(parse_all(&["127.0.0.1/8", "::1/128"])?),
            "linklocal" => subnets.extend(parse_all(&["169.254.0.0/16", "fe80::/10"])?),
            "uniquelocal" => subnets.extend(parse_all(&[
                "10.0.0.0/8",
                "172.16.0.0/12",
                "192.168.0.0/16",
                "fc00::/7",
            ])?),
            other => subnets.push(parse_subnet(other)?),
        }
    }
    Ok(Arc::new(move |addr: IpAddr, _: usize| {
        let addr = unmap(addr);
        subnets.iter().any(|net| net.contains(&addr))
    }))
}

fn parse_all(entries: &[&str]) -> Result<Vec<IpNet>> {
    entries.iter().map(|e| parse_subnet(e)).collect()
}

/// A CIDR block, or a single address as a full-length block.
fn parse_subnet(entry: &str) -> Result<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::config(format!("invalid IP address: {entry}")))
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form.
fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        v4 => v4,
    }
}
