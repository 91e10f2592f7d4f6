use std::net::SocketAddr;

use serde_json::json;
use sluice::{App, Next, Request, Response, serve_listener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<sluice::Result<()>>,
}

async fn start(app: App) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve_listener(listener, app, async move {
        let _ = stopped.await;
    }));
    Running { addr, stop, task }
}

/// Sends one raw HTTP/1.1 request and returns the full response text.
async fn raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    out
}

fn app() -> App {
    App::new()
        .set("env", json!("test"))
        .get("/hello/{name}", |req: Request, res: Response, _: Next| async move {
            res.text(format!("hello {}", req.param("name").unwrap_or_default()));
        })
        .post("/echo", |req: Request, res: Response, _: Next| async move {
            res.send(req.body());
        })
        .get("/ip", |req: Request, res: Response, _: Next| async move {
            res.text(req.ip().map(|ip| ip.to_string()).unwrap_or_default());
        })
}

#[tokio::test]
async fn serves_routes_over_http() {
    let server = start(app()).await;

    let reply = raw(server.addr, "GET /hello/ada HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(reply.contains("x-powered-by: Sluice\r\n"), "{reply}");
    assert!(reply.ends_with("\r\n\r\nhello ada"), "{reply}");

    let reply = raw(
        server.addr,
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nping!",
    )
    .await;
    assert!(reply.ends_with("\r\n\r\nping!"), "{reply}");

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unmatched_requests_get_the_terminal_404() {
    let server = start(app()).await;
    let reply = raw(server.addr, "DELETE /hello/ada HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{reply}");
    assert!(reply.ends_with("Cannot DELETE /hello/ada"), "{reply}");

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_methods_are_rejected_before_dispatch() {
    let server = start(app()).await;
    let reply = raw(server.addr, "BREW /pot HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{reply}");

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn requests_carry_the_peer_address() {
    let server = start(app()).await;
    let reply = raw(server.addr, "GET /ip HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
    assert!(reply.ends_with("\r\n\r\n127.0.0.1"), "{reply}");

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let server = start(app()).await;
    let addr = server.addr;
    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}
