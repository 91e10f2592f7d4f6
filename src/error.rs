//! Unified error type.

use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

/// A boxed error from user code: handlers, template engines, loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout sluice.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type carried through the handler chain and returned by sluice's
/// fallible operations.
///
/// Any value handed to [`Next::error`](crate::Next::error) travels down the
/// stack as one of these until an error-handling layer consumes it or it
/// reaches the terminal handler.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad registration arguments, unknown setting values, missing view engines.
    #[error("{0}")]
    Config(String),

    /// A view could not be found in any of the searched roots.
    #[error("Failed to lookup view \"{name}\" in views {}", describe_roots(.roots))]
    Lookup { name: String, roots: Vec<PathBuf> },

    /// A handler failure that already knows which status it should produce.
    #[error("{message}")]
    Http { status: StatusCode, message: String },

    /// A template engine failed or panicked while rendering.
    #[error("render failed: {0}")]
    Render(#[source] BoxError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] BoxError),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// An error that makes the terminal handler answer with `status`.
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http { status, message: message.into() }
    }

    /// Wraps any error type from user code.
    pub fn other(err: impl Into<BoxError>) -> Self {
        Self::Other(err.into())
    }

    /// The response status the terminal handler uses for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Http { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A copy with the same message and status. Boxed sources are flattened
    /// into [`Error::Http`].
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Config(message) => Self::Config(message.clone()),
            Self::Lookup { name, roots } => Self::Lookup { name: name.clone(), roots: roots.clone() },
            Self::Http { status, message } => Self::Http { status: *status, message: message.clone() },
            other => Self::Http { status: other.status(), message: other.to_string() },
        }
    }
}

fn describe_roots(roots: &[PathBuf]) -> String {
    match roots {
        [] => "directory \"\"".to_owned(),
        [only] => format!("directory \"{}\"", only.display()),
        [init @ .., last] => {
            let head = init
                .iter()
                .map(|r| r.display().to_string())
                .collect::<Vec<_>>()
                .join("\", \"");
            format!("directories \"{head}\" or \"{}\"", last.display())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_message_names_single_root() {
        let err = Error::Lookup { name: "index".into(), roots: vec!["/views".into()] };
        assert_eq!(err.to_string(), r#"Failed to lookup view "index" in views directory "/views""#);
    }

    #[test]
    fn lookup_message_names_every_root() {
        let err = Error::Lookup {
            name: "index".into(),
            roots: vec!["/a".into(), "/b".into(), "/c".into()],
        };
        assert_eq!(
            err.to_string(),
            r#"Failed to lookup view "index" in views directories "/a", "/b" or "/c""#,
        );
    }

    #[test]
    fn http_errors_carry_their_status() {
        assert_eq!(Error::http(StatusCode::FORBIDDEN, "nope").status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::config("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn duplicates_keep_message_and_status() {
        let err = Error::http(StatusCode::FORBIDDEN, "nope").duplicate();
        assert_eq!((err.status(), err.to_string()), (StatusCode::FORBIDDEN, "nope".to_owned()));

        let io = Error::from(std::io::Error::other("disk gone")).duplicate();
        assert!(matches!(io, Error::Http { .. }));
        assert_eq!((io.status(), io.to_string()), (StatusCode::INTERNAL_SERVER_ERROR, "disk gone".to_owned()));
    }
}
