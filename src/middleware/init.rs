use crate::application::WeakApp;
use crate::handler::{BoxFuture, Handle};
use crate::next::Next;
use crate::request::Request;
use crate::response::Response;

/// Binds the request and response to the dispatching application and links
/// them to each other.
pub(crate) fn init(app: WeakApp) -> Handle {
    Handle::request(move |req: Request, res: Response, next: Next| -> BoxFuture {
        if let Some(app) = app.upgrade() {
            if app.enabled("x-powered-by") {
                res.set("x-powered-by", "Sluice");
            }
            req.set_app(app.clone());
            res.set_app(app);
        }
        res.set_req(req);
        next.run()
    })
}
