//! Single-pattern path matching on top of [`matchit`].
//!
//! Patterns use `{name}` for a named segment. A pattern is either matched
//! exactly (route paths) or as a prefix (middleware and mounted apps), in
//! which case the matched prefix is reported so the router can strip it.

use matchit::Router as MatchitRouter;

use crate::error::{Error, Result};

const REST: &str = "__sluice_rest";

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PatternOptions {
    /// Match the whole path rather than a prefix.
    pub end: bool,
    /// Treat `/users` and `/users/` as different paths.
    pub strict: bool,
    /// Treat `/Users` and `/users` as different paths.
    pub case_sensitive: bool,
}

/// A successful match.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PathMatch {
    /// Captured parameters in pattern order.
    pub params: Vec<(String, String)>,
    /// The matched part of the path; the whole path for exact patterns.
    pub prefix: String,
}

pub(crate) struct PathPattern {
    source: String,
    options: PatternOptions,
    exact: MatchitRouter<()>,
    nested: Option<MatchitRouter<()>>,
    catch_all: bool,
}

impl PathPattern {
    pub(crate) fn new(path: &str, options: PatternOptions) -> Result<Self> {
        let source = if options.case_sensitive { path.to_owned() } else { fold_pattern(path) };
        let catch_all = !options.end && (source.is_empty() || source == "/");

        let mut exact = MatchitRouter::new();
        let base = match source.as_str() {
            "" => "/".to_owned(),
            s if !options.strict => trim_trailing_slash(s).to_owned(),
            s => s.to_owned(),
        };
        exact
            .insert(base.clone(), ())
            .map_err(|e| Error::config(format!("invalid path `{path}`: {e}")))?;

        let nested = if options.end || catch_all {
            None
        } else {
            let mut nested = MatchitRouter::new();
            let pattern = format!("{}/{{*{REST}}}", base.trim_end_matches('/'));
            nested
                .insert(pattern, ())
                .map_err(|e| Error::config(format!("invalid path `{path}`: {e}")))?;
            Some(nested)
        };

        Ok(Self { source: path.to_owned(), options, exact, nested, catch_all })
    }

    pub(crate) fn source(&self) -> &str {
        &self.source
    }

    /// Matches `path` (the request path relative to the current mount point).
    pub(crate) fn matches(&self, path: &str) -> Option<PathMatch> {
        if self.catch_all {
            return Some(PathMatch::default());
        }

        let folded;
        let subject = if self.options.case_sensitive {
            path
        } else {
            folded = fold_case(path);
            folded.as_str()
        };

        if let Some(m) = self.match_exact(path, subject) {
            return Some(m);
        }

        let nested = self.nested.as_ref()?;
        let matched = nested.at(subject).ok()?;
        let mut params = Vec::new();
        let mut rest_len = 0;
        for (key, value) in matched.params.iter() {
            if key == REST {
                rest_len = value.len();
            } else {
                params.push((key.to_owned(), original(path, subject, value).to_owned()));
            }
        }
        // `rest` excludes the slash that separates it from the prefix.
        let prefix = path[..path.len() - rest_len - 1].to_owned();
        Some(PathMatch { params, prefix })
    }

    /// Prefix patterns accept one trailing slash in any mode; exact patterns
    /// only when routing is not strict.
    fn match_exact(&self, path: &str, subject: &str) -> Option<PathMatch> {
        let trimmed = trim_trailing_slash(subject);
        let lenient = !self.options.strict || !self.options.end;
        let candidate = match self.exact.at(subject) {
            Ok(m) => Some((m, subject)),
            Err(_) if lenient && trimmed.len() < subject.len() => {
                self.exact.at(trimmed).ok().map(|m| (m, trimmed))
            }
            Err(_) => None,
        };
        let (matched, used) = candidate?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), original(path, subject, v).to_owned()))
            .collect();
        Some(PathMatch { params, prefix: path[..used.len()].to_owned() })
    }
}

/// Maps a slice of the case-folded subject back onto the original path.
///
/// ASCII folding keeps byte offsets, so the same range indexes both.
fn original<'a>(path: &'a str, subject: &str, value: &str) -> &'a str {
    let start = value.as_ptr() as usize - subject.as_ptr() as usize;
    &path[start..start + value.len()]
}

fn fold_case(path: &str) -> String {
    path.to_ascii_lowercase()
}

/// Folds the static parts of a pattern; parameter names keep their case.
fn fold_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut in_param = false;
    for c in pattern.chars() {
        match c {
            '{' => in_param = true,
            '}' => in_param = false,
            _ => {}
        }
        out.push(if in_param { c } else { c.to_ascii_lowercase() });
    }
    out
}

fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 { path.strip_suffix('/').unwrap_or(path) } else { path }
}
