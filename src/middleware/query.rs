use tracing::trace;

use crate::application::WeakApp;
use crate::handler::{BoxFuture, Handle};
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;

/// Fills [`Request::query`] unless an outer application already did.
pub(crate) fn query(app: WeakApp) -> Handle {
    Handle::request(move |req: Request, _: Response, next: Next| -> BoxFuture {
        if !req.has_query()
            && let Some(parse) = app.upgrade().and_then(|app| app.settings().query_parser_fn())
        {
            let raw = req.query_string().unwrap_or_default();
            trace!(query = %raw, "parse query");
            req.set_query(parse(&raw));
        }
        next.run()
    })
}
