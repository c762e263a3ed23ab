//! Thin HTTP front-end.
//!
//! axum runs on its own tokio runtime in a dedicated thread. Every request
//! is turned into a [`Request`] and sent to the host thread, which owns the
//! runtime and answers through a oneshot channel. Dispatch is therefore
//! serialized no matter how many connections are open.
//!
//! Bodies larger than the host can stage are refused with 413 before
//! they reach the host thread.

use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::Router;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::runtime::{HostError, Request, Response};

/// Requests queued in front of the host thread before senders wait.
pub const QUEUE_DEPTH: usize = 256;

/// One request handed to the host thread.
pub struct HostJob {
    pub request: Request,
    pub reply: oneshot::Sender<Result<Response, HostError>>,
}

#[derive(Clone)]
struct ServerState {
    jobs: mpsc::Sender<HostJob>,
}

/// Binds `listen` and serves on a background thread until Ctrl-C.
/// Request bodies over `max_body` bytes are answered with 413.
///
/// Binding happens on the calling thread so a bind failure is reported
/// before anything is served. When the server stops, the job sender is
/// dropped and the host thread's receive loop ends.
pub fn spawn(
    listen: SocketAddr,
    jobs: mpsc::Sender<HostJob>,
    max_body: usize,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(listen)?;
    listener.set_nonblocking(true)?;
    let bound = listener.local_addr()?;

    let handle = std::thread::Builder::new()
        .name("http".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Cannot start HTTP runtime: {e}");
                    return;
                }
            };
            runtime.block_on(async move {
                if let Err(e) = serve(listener, jobs, max_body, shutdown_signal()).await {
                    error!("HTTP server error: {e}");
                }
            });
        })?;

    info!("Listening on http://{bound}");
    Ok(handle)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections");
}

async fn serve(
    listener: TcpListener,
    jobs: mpsc::Sender<HostJob>,
    max_body: usize,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let app = router(jobs, max_body);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(jobs: mpsc::Sender<HostJob>, max_body: usize) -> Router {
    Router::new()
        .fallback(forward)
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(ServerState { jobs })
}

async fn forward(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let request = to_request(&method, &uri, &headers, body);
    let (reply, answer) = oneshot::channel();

    if state.jobs.send(HostJob { request, reply }).await.is_err() {
        warn!("Host thread is gone, rejecting {method} {}", uri.path());
        return plain(StatusCode::SERVICE_UNAVAILABLE);
    }
    match answer.await {
        Ok(result) => to_http(result),
        Err(_) => plain(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Converts the incoming request into the host's representation.
/// Header values that are not visible ASCII are dropped.
fn to_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Request {
    let mut request = Request::new(method.as_str(), uri.path());
    if let Some(query) = uri.query() {
        request = request.with_query_string(query);
    }
    for (name, value) in headers {
        match value.to_str() {
            Ok(v) => request = request.with_header(name.as_str(), v),
            Err(_) => debug!("Dropping non-text header {name}"),
        }
    }
    request.with_body(body.to_vec())
}

fn plain(status: StatusCode) -> axum::response::Response {
    let mut response = axum::response::Response::new(Body::from(
        status.canonical_reason().unwrap_or_default(),
    ));
    *response.status_mut() = status;
    response
}

/// Maps a dispatch result to HTTP. Failure details stay in the log.
fn to_http(result: Result<Response, HostError>) -> axum::response::Response {
    let res = match result {
        Ok(res) => res,
        Err(HostError::NoRoute { .. }) => return plain(StatusCode::NOT_FOUND),
        Err(HostError::Destroyed) => return plain(StatusCode::SERVICE_UNAVAILABLE),
        Err(_) => return plain(StatusCode::INTERNAL_SERVER_ERROR),
    };

    let status = match res.status {
        None => StatusCode::OK,
        Some(code) => match StatusCode::from_u16(code) {
            Ok(s) => s,
            Err(_) => {
                warn!("Handler set invalid status {code}");
                return plain(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
    };

    let mut response = axum::response::Response::new(Body::from(res.body));
    *response.status_mut() = status;
    let out = response.headers_mut();
    for (name, value) in &res.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.append(name, value);
            }
            _ => warn!("Dropping invalid response header '{name}'"),
        }
    }
    response
}
