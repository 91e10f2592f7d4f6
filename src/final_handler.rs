//! The terminal handler used when [`App::handle`](crate::App::handle) is not
//! given one.

use http::StatusCode;
use tracing::error;

use crate::error::Error;
use crate::next::{Control, Next};
use crate::request::Request;
use crate::response::Response;

/// Answers whatever reaches the end of the outermost stack.
///
/// - an error becomes its [`Error::status`], with the message as the body
///   outside `production`
/// - no error means nothing matched: `404 Cannot <METHOD> <path>`
/// - an already finished response is left alone
#[derive(Clone, Debug)]
pub struct FinalHandler {
    env: String,
}

impl FinalHandler {
    pub fn new(env: impl Into<String>) -> Self {
        Self { env: env.into() }
    }

    /// A continuation that finishes `res` for `req`.
    pub fn into_next(self, req: Request, res: Response) -> Next {
        Next::new(move |control| async move { self.finish(control, &req, &res) })
    }

    pub fn finish(&self, control: Control, req: &Request, res: &Response) {
        let err = match control {
            Control::Error(err) => Some(err),
            Control::Continue | Control::Route | Control::Router => None,
        };

        if let Some(err) = &err
            && self.env != "test"
        {
            error!(method = %req.method(), url = %req.original_url(), "unhandled error: {err}");
        }

        if res.finished() {
            return;
        }

        let (status, body) = match err {
            Some(err) => self.describe(&err),
            None => {
                let url = req.original_url();
                let path = url.split('?').next().unwrap_or_default();
                (StatusCode::NOT_FOUND, format!("Cannot {} {path}", req.method()))
            }
        };

        res.status(status)
            .set("content-security-policy", "default-src 'none'")
            .set("x-content-type-options", "nosniff");
        res.text(body);
    }

    fn describe(&self, err: &Error) -> (StatusCode, String) {
        let status = match err.status() {
            s if s.is_client_error() || s.is_server_error() => s,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = if self.env == "production" {
            status.canonical_reason().unwrap_or("Error").to_owned()
        } else {
            err.to_string()
        };
        (status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    #[test]
    fn nothing_matched_is_not_found() {
        let res = Response::new();
        FinalHandler::new("test").finish(
            Control::Continue,
            &Request::new(Method::Post, "/missing?x=1"),
            &res,
        );
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.body(), "Cannot POST /missing");
    }

    #[test]
    fn production_hides_error_details() {
        let req = Request::new(Method::Get, "/");
        let err = || Error::http(StatusCode::BAD_REQUEST, "secret detail");

        let res = Response::new();
        FinalHandler::new("production").finish(Control::Error(err()), &req, &res);
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body(), "Bad Request");

        let res = Response::new();
        FinalHandler::new("test").finish(Control::Error(err()), &req, &res);
        assert_eq!(res.body(), "secret detail");
    }

    #[test]
    fn finished_responses_are_left_alone() {
        let res = Response::new();
        res.text("done");
        FinalHandler::new("test").finish(Control::Continue, &Request::new(Method::Get, "/"), &res);
        assert_eq!(res.status_code(), StatusCode::OK);
    }
}
