mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use http::StatusCode;
use serde_json::json;
use sluice::{App, Control, Error, Handle, Method, Next, Request, Response};

use common::{Trail, body, get, send};

#[tokio::test]
async fn unmatched_method_falls_through_without_error() {
    let trail = Trail::default();
    let app = App::new().get("/books", trail.answer("books"));

    let (tx, rx) = tokio::sync::oneshot::channel();
    let done = Next::new(move |control| async move {
        let _ = tx.send(matches!(control, Control::Continue));
    });
    app.handle_with(Request::new(Method::Post, "/books"), Response::new(), done).await;
    assert!(rx.await.unwrap());

    let res = send(&app, Request::new(Method::Post, "/books")).await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(body(&res), "Cannot POST /books");
    assert!(trail.entries().is_empty());
}

#[tokio::test]
async fn empty_application_goes_straight_to_the_terminal_handler() {
    let res = get(&App::new(), "/").await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(body(&res), "Cannot GET /");
}

#[tokio::test]
async fn head_uses_get_unless_head_is_registered() {
    let trail = Trail::default();
    let app = App::new().get("/page", trail.answer("get"));
    let res = send(&app, Request::new(Method::Head, "/page")).await;
    assert_eq!(trail.entries(), ["get"]);
    assert!(res.body().is_empty());
    assert_eq!(res.header("content-length").as_deref(), Some("3"));

    let trail = Trail::default();
    let app = App::new()
        .get("/page", trail.answer("get"))
        .head("/page", trail.answer("head"));
    send(&app, Request::new(Method::Head, "/page")).await;
    assert_eq!(trail.entries(), ["head"]);
}

#[tokio::test]
async fn skip_route_moves_past_the_remaining_route_handlers() {
    let trail = Trail::default();
    let skip = {
        let trail = trail.clone();
        Handle::request(move |_: Request, _: Response, next: Next| {
            trail.push("skip");
            next.skip_route()
        })
    };
    let app = App::new()
        .get("/docs", vec![skip, trail.answer("never")])
        .middleware(trail.answer("fallback"));

    let res = get(&app, "/docs").await;
    assert_eq!(trail.entries(), ["skip", "fallback"]);
    assert_eq!(body(&res), "fallback");
}

#[tokio::test]
async fn exit_router_stops_the_main_stack() {
    let trail = Trail::default();
    let leave = |_: Request, _: Response, next: Next| next.exit_router();
    let app = App::new()
        .get("/", leave)
        .middleware(trail.answer("after"));

    let res = get(&app, "/").await;
    assert!(trail.entries().is_empty());
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exit_router_in_a_mounted_app_returns_to_the_parent() {
    let trail = Trail::default();
    let leave = |_: Request, _: Response, next: Next| next.exit_router();
    let admin = App::new()
        .get("/", leave)
        .middleware(trail.answer("admin fallback"));
    let app = App::new()
        .mount("/admin", admin)
        .middleware(trail.answer("parent"));

    let res = get(&app, "/admin").await;
    assert_eq!(trail.entries(), ["parent"]);
    assert_eq!(body(&res), "parent");
}

#[tokio::test]
async fn repeated_registrations_run_in_order() {
    let trail = Trail::default();
    let app = App::new()
        .get("/", trail.mark("first"))
        .get("/", trail.mark("second"))
        .get("/", trail.answer("third"));

    let res = get(&app, "/").await;
    assert_eq!(trail.entries(), ["first", "second", "third"]);
    assert_eq!(body(&res), "third");
}

#[tokio::test]
async fn long_synchronous_chains_complete() {
    let hits = Arc::new(AtomicUsize::new(0));
    let chain: Vec<Handle> = (0..1_500)
        .map(|_| {
            let hits = Arc::clone(&hits);
            Handle::request(move |_: Request, _: Response, next: Next| {
                hits.fetch_add(1, Ordering::SeqCst);
                next.run()
            })
        })
        .collect();
    let app = App::new()
        .middleware(chain)
        .get("/", |_: Request, res: Response, _: Next| async move { res.text("end") });

    let res = get(&app, "/").await;
    assert_eq!(hits.load(Ordering::SeqCst), 1_500);
    assert_eq!(body(&res), "end");
}

#[tokio::test]
async fn one_hundred_fifty_route_handlers_complete() {
    let hits = Arc::new(AtomicUsize::new(0));
    let chain: Vec<Handle> = (0..150)
        .map(|_| {
            let hits = Arc::clone(&hits);
            Handle::request(move |_: Request, _: Response, next: Next| {
                hits.fetch_add(1, Ordering::SeqCst);
                next.run()
            })
        })
        .collect();
    let app = App::new().get("/", chain).get("/", |_: Request, res: Response, _: Next| async move {
        res.text("done");
    });

    let res = get(&app, "/").await;
    assert_eq!(hits.load(Ordering::SeqCst), 150);
    assert_eq!(body(&res), "done");
}

#[tokio::test]
async fn errors_skip_to_the_next_error_handler() {
    let trail = Trail::default();
    let fail = |_: Request, _: Response, next: Next| {
        next.error(Error::http(StatusCode::UNPROCESSABLE_ENTITY, "bad input"))
    };
    let recorded = trail.clone();
    let app = App::new()
        .middleware(fail)
        .get("/", trail.answer("route"))
        .middleware(trail.mark("plain"))
        .catch(move |err: Error, _: Request, res: Response, _: Next| {
            recorded.push(format!("caught {err}"));
            res.status(err.status()).text("handled");
            async {}
        });

    let res = get(&app, "/").await;
    assert_eq!(trail.entries(), ["caught bad input"]);
    assert_eq!(res.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body(&res), "handled");
}

#[tokio::test]
async fn unhandled_errors_reach_the_terminal_handler() {
    let fail = |_: Request, _: Response, next: Next| {
        next.error(Error::http(StatusCode::FORBIDDEN, "no entry"))
    };
    let res = get(&App::new().middleware(fail), "/").await;
    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(body(&res), "no entry");
}

#[tokio::test]
async fn error_handlers_can_recover() {
    let trail = Trail::default();
    let fail = |_: Request, _: Response, next: Next| next.error(Error::config("boom"));
    let recover = |_: Error, _: Request, _: Response, next: Next| next.run();
    let app = App::new()
        .middleware(fail)
        .catch(recover)
        .middleware(trail.answer("recovered"));

    let res = get(&app, "/").await;
    assert_eq!(body(&res), "recovered");
}

#[tokio::test]
async fn param_handlers_run_before_the_route() {
    let trail = Trail::default();
    let loader = trail.clone();
    let app = App::new()
        .param("id", move |_: Request, _: Response, next: Next, id: String| {
            loader.push(format!("load {id}"));
            next.run()
        })
        .get("/users/{id}", |req: Request, res: Response, _: Next| async move {
            res.text(format!("user {}", req.param("id").unwrap_or_default()));
        });

    let res = get(&app, "/users/42").await;
    assert_eq!(trail.entries(), ["load 42"]);
    assert_eq!(body(&res), "user 42");
}

#[tokio::test]
async fn param_handler_errors_skip_the_route() {
    let app = App::new()
        .params(&["id", "slug"], |_: Request, _: Response, next: Next, value: String| {
            next.error(Error::http(StatusCode::NOT_FOUND, format!("no such thing: {value}")))
        })
        .get("/posts/{slug}", |_: Request, res: Response, _: Next| async move { res.text("post") });

    let res = get(&app, "/posts/hello").await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(body(&res), "no such thing: hello");
}

#[tokio::test]
async fn mounting_strips_and_restores_the_prefix() {
    let trail = Trail::default();
    let inner = trail.clone();
    let admin = App::new().get("/users", move |req: Request, _: Response, next: Next| {
        inner.push(format!("{} {} {}", req.base_url(), req.url(), req.original_url()));
        next.run()
    });
    let outer = trail.clone();
    let app = App::new()
        .mount("/admin", admin.clone())
        .middleware(move |req: Request, res: Response, _: Next| {
            let bound = req.app().map(|app| app.mountpath()).unwrap_or_default();
            outer.push(format!("{} {} bound to {bound}", req.base_url(), req.url()));
            res.text("outer");
            async {}
        });

    get(&app, "/admin/users?page=2").await;
    assert_eq!(
        trail.entries(),
        ["/admin /users?page=2 /admin/users?page=2", " /admin/users?page=2 bound to /"]
    );
}

#[tokio::test]
async fn mounted_apps_are_bound_while_they_dispatch() {
    let admin = App::new().get("/", |req: Request, res: Response, _: Next| async move {
        let path = req.app().map(|app| app.path()).unwrap_or_default();
        res.text(path);
    });
    let app = App::new().mount("/admin", admin);

    let res = get(&app, "/admin").await;
    assert_eq!(body(&res), "/admin");
}

#[tokio::test]
async fn mounted_settings_delegate_until_shadowed() {
    let admin = App::new();
    let _app = App::new()
        .set("views", json!("/srv/views"))
        .mount("/admin", admin.clone());

    assert_eq!(admin.setting("views"), Some(json!("/srv/views")));
    let admin = admin.set("views", json!("/srv/admin-views"));
    assert_eq!(admin.setting("views"), Some(json!("/srv/admin-views")));
}

#[tokio::test]
async fn mounted_apps_inherit_trust_proxy() {
    let admin = App::new().get("/", |req: Request, res: Response, _: Next| async move {
        res.text(req.ip().map(|ip| ip.to_string()).unwrap_or_default());
    });
    let app = App::new().set("trust proxy", json!(true)).mount("/admin", admin);

    let req = Request::new(Method::Get, "/admin")
        .with_remote_addr("127.0.0.1:4000".parse().unwrap())
        .with_header("x-forwarded-for", "198.51.100.4");
    let res = send(&app, req).await;
    assert_eq!(body(&res), "198.51.100.4");
}

#[tokio::test]
async fn capabilities_resolve_through_the_bound_app() {
    let admin = App::new().get("/", |req: Request, res: Response, _: Next| async move {
        let greeting = req.capability("greeting").and_then(|v| v.as_str().map(str::to_owned));
        res.text(greeting.unwrap_or_default());
    });
    let app = App::new();
    app.request().set("greeting", json!("hello from the parent"));
    let app = app.mount("/admin", admin);

    let res = get(&app, "/admin").await;
    assert_eq!(body(&res), "hello from the parent");
}

#[tokio::test]
async fn options_requests_list_allowed_methods() {
    let noop = |_: Request, res: Response, _: Next| async move { res.text("") };
    let app = App::new().get("/books", noop).put("/books", noop);

    let res = send(&app, Request::new(Method::Options, "/books")).await;
    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.header("allow").as_deref(), Some("GET,PUT,HEAD"));
}

#[tokio::test]
async fn query_strings_are_parsed_with_the_configured_parser() {
    let echo = |req: Request, res: Response, _: Next| async move { res.json(&req.query()) };

    let app = App::new().get("/search", echo);
    let res = get(&app, "/search?filter[lang]=rust&page=2").await;
    assert_eq!(body(&res), r#"{"filter":{"lang":"rust"},"page":"2"}"#);

    let app = App::new().set("query parser", json!("simple")).get("/search", echo);
    let res = get(&app, "/search?filter[lang]=rust").await;
    assert_eq!(body(&res), r#"{"filter[lang]":"rust"}"#);

    let app = App::new().disable("query parser").get("/search", echo);
    let res = get(&app, "/search?page=2").await;
    assert_eq!(body(&res), "{}");
}

#[tokio::test]
async fn powered_by_header_follows_the_setting() {
    let ok = |_: Request, res: Response, _: Next| async move { res.text("ok") };
    let res = get(&App::new().get("/", ok), "/").await;
    assert_eq!(res.header("x-powered-by").as_deref(), Some("Sluice"));

    let res = get(&App::new().disable("x-powered-by").get("/", ok), "/").await;
    assert!(res.header("x-powered-by").is_none());
}

#[tokio::test]
async fn etags_answer_conditional_requests() {
    let ok = |_: Request, res: Response, _: Next| async move { res.text("cached body") };
    let app = App::new().get("/", ok);

    let first = get(&app, "/").await;
    let tag = first.header("etag").unwrap();
    assert!(tag.starts_with("W/\"b-"));

    let req = Request::new(Method::Get, "/").with_header("if-none-match", &tag);
    let second = send(&app, req).await;
    assert_eq!(second.status_code(), StatusCode::NOT_MODIFIED);
    assert!(second.body().is_empty());
}

#[tokio::test]
async fn case_and_strictness_follow_routing_settings() {
    let ok = |_: Request, res: Response, _: Next| async move { res.text("ok") };

    let app = App::new().get("/Users", ok);
    assert_eq!(get(&app, "/users/").await.status_code(), StatusCode::OK);

    let app = App::new()
        .enable("case sensitive routing")
        .enable("strict routing")
        .get("/Users", ok);
    assert_eq!(get(&app, "/users").await.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/Users/").await.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/Users").await.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn trailing_slashes_in_patterns_are_optional_unless_strict() {
    let ok = |_: Request, res: Response, _: Next| async move { res.text("ok") };

    let app = App::new().get("/users/", ok);
    assert_eq!(get(&app, "/users").await.status_code(), StatusCode::OK);
    assert_eq!(get(&app, "/users/").await.status_code(), StatusCode::OK);

    let app = App::new().enable("strict routing").get("/users/", ok);
    assert_eq!(get(&app, "/users").await.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/users/").await.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn strict_middleware_prefixes_match_a_trailing_slash() {
    let trail = Trail::default();
    let app = App::new().enable("strict routing").middleware_at("/admin", trail.answer("admin"));

    let res = get(&app, "/admin/").await;
    assert_eq!(body(&res), "admin");
    assert_eq!(get(&app, "/admin/users").await.status_code(), StatusCode::OK);
    assert_eq!(trail.entries(), ["admin", "admin"]);
}

#[tokio::test]
async fn param_outcomes_are_replayed_for_later_routes() {
    let trail = Trail::default();
    let guard = trail.clone();
    let app = App::new()
        .param("id", move |_: Request, _: Response, next: Next, id: String| {
            guard.push(format!("param {id}"));
            next.skip_route()
        })
        .get("/u/{id}", trail.answer("first"))
        .get("/{p}/{id}", trail.answer("second"));

    let res = get(&app, "/u/1").await;
    assert_eq!(trail.entries(), ["param 1"]);
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn param_errors_are_replayed_for_later_layers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let app = App::new()
        .param("id", move |_: Request, _: Response, next: Next, _: String| {
            counted.fetch_add(1, Ordering::SeqCst);
            next.error(Error::http(StatusCode::FORBIDDEN, "locked"))
        })
        .get("/u/{id}", |_: Request, res: Response, _: Next| async move { res.text("user") })
        .middleware_at(
            "/u/{id}",
            Handle::error(|err: Error, _: Request, _: Response, next: Next| next.error(err)),
        );

    let res = get(&app, "/u/1").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(body(&res), "locked");
}

#[test]
#[should_panic(expected = "Route.post() requires a callback function but got a Application")]
fn routes_reject_applications() {
    let _ = App::new().post("/", App::new());
}
