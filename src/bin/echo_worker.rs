//! Sample worker speaking the hivegate launch contract
//!
//! Serves HTTP on the transport its supervisor assigned and answers every
//! request with a JSON echo. Routing facts for the `ready` message come from
//! the app's `[config]` table (`router`, `server_name`, `bind`, `kind`); an
//! empty table makes it a daemon.
//!
//! Environment knobs used by tests:
//! - ECHO_FAIL: `init` or `impl` reports that exit reason and quits before ready
//! - ECHO_CRASH_ONCE_FILE: exit with status 3 unless this file exists, creating it first
//! - ECHO_READY_DELAY_MS: wait before reporting ready (default: 0)

use anyhow::Context;
use hivegate::descriptor::{ReadyInfo, Target};
use hivegate::supervisor::ExitReason;
use hivegate::worker::Worker;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

struct EchoState {
    app_id: String,
    pid: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hive_echo_worker=debug".parse()?))
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let worker = Worker::connect().context("not started by a hivegate supervisor")?;
    let app_id = worker.app_id().to_string();

    match std::env::var("ECHO_FAIL").as_deref() {
        Ok("init") => return fail(&worker, ExitReason::AppInitError).await,
        Ok("impl") => return fail(&worker, ExitReason::AppImplementationError).await,
        _ => {}
    }
    if let Ok(marker) = std::env::var("ECHO_CRASH_ONCE_FILE") {
        if std::fs::metadata(&marker).is_err() {
            std::fs::write(&marker, b"crashed")?;
            error!(app_id, "Crashing once on purpose");
            std::process::exit(3);
        }
    }

    let target = worker.target().context("no transport assigned")?;
    let state = Arc::new(EchoState {
        app_id: app_id.clone(),
        pid: std::process::id(),
    });
    let server = match &target {
        Target::Port(port) => {
            let listener = TcpListener::bind(("127.0.0.1", *port)).await?;
            tokio::spawn(serve_tcp(listener, Arc::clone(&state)))
        }
        Target::Sock(path) => {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            tokio::spawn(serve_unix(listener, Arc::clone(&state)))
        }
    };
    info!(app_id, target = %target, "Echo worker listening");

    if let Some(delay) = std::env::var("ECHO_READY_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let info: ReadyInfo = serde_json::from_value(worker.launch().config.clone()).unwrap_or_default();
    worker.ready(info).await?;

    worker.stopped().await;
    info!(app_id, "Echo worker stopping");
    server.abort();
    if let Target::Sock(path) = &target {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

async fn fail(worker: &Worker, reason: ExitReason) -> anyhow::Result<()> {
    error!(app_id = worker.app_id(), ?reason, "Failing on purpose");
    worker.report_exit(reason).await?;
    std::process::exit(1);
}

async fn serve_tcp(listener: TcpListener, state: Arc<EchoState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(stream, Arc::clone(&state)));
            }
            Err(e) => error!(error = %e, "Accept failed"),
        }
    }
}

async fn serve_unix(listener: UnixListener, state: Arc<EchoState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(stream, Arc::clone(&state)));
            }
            Err(e) => error!(error = %e, "Accept failed"),
        }
    }
}

async fn serve_connection<S>(stream: S, state: Arc<EchoState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "Connection closed with error");
    }
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<EchoState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.headers().contains_key(hyper::header::UPGRADE) {
        return Ok(upgrade(req));
    }
    if req.uri().path() == "/health" {
        return Ok(text(StatusCode::OK, "ok"));
    }

    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.into())))
        .collect();
    let body = serde_json::json!({
        "app_id": state.app_id,
        "pid": state.pid,
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "headers": headers,
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())).map_err(|never| match never {}).boxed())
        .expect("valid response builder"))
}

/// Switch to a raw byte echo
fn upgrade(req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let protocol = req
        .headers()
        .get(hyper::header::UPGRADE)
        .cloned()
        .unwrap_or_else(|| hyper::header::HeaderValue::from_static("echo"));
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 4096];
                loop {
                    match io.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if io.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => debug!(error = %e, "Upgrade failed"),
        }
    });
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, protocol)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn text(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
