#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use sluice::{App, Handle, Method, Next, Request, Response};

/// Dispatches `req` through `app` with the default terminal handler.
pub async fn send(app: &App, req: Request) -> Response {
    let res = Response::new();
    app.handle(req, res.clone()).await;
    res
}

pub async fn get(app: &App, url: &str) -> Response {
    send(app, Request::new(Method::Get, url)).await
}

pub fn body(res: &Response) -> String {
    String::from_utf8_lossy(&res.body()).into_owned()
}

/// Shared list of labels handlers push as they run.
#[derive(Clone, Default)]
pub struct Trail(Arc<Mutex<Vec<String>>>);

impl Trail {
    pub fn push(&self, label: impl Into<String>) {
        self.0.lock().unwrap().push(label.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// A handler that records `label` and continues.
    pub fn mark(&self, label: &'static str) -> Handle {
        let trail = self.clone();
        Handle::request(move |_: Request, _: Response, next: Next| {
            trail.push(label);
            next.run()
        })
    }

    /// A handler that records `label` and answers with it.
    pub fn answer(&self, label: &'static str) -> Handle {
        let trail = self.clone();
        Handle::request(move |_: Request, res: Response, _: Next| {
            trail.push(label);
            res.text(label);
            async {}
        })
    }
}
