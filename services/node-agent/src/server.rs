//! Kubelet-compatible HTTP surface.
//!
//! Health endpoints are always served. Everything backed by the provider
//! answers 503 until the agent is ready.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, RawQuery, Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use vk_errdefs::{Error, ErrorKind};

use crate::provider::Provider;
use crate::workload::WorkloadKey;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// A tagged error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.0.kind())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            kind: self.0.kind().as_str().to_string(),
            message: self.0.report().to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(after) = self.0.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&after.as_secs().max(1).to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// Router
// =============================================================================

#[derive(Clone)]
pub struct ServerState {
    pub provider: Arc<dyn Provider>,
    pub ready: watch::Receiver<bool>,
    /// Parent of every per-request provider cancellation.
    pub cancel: CancellationToken,
}

pub fn router(state: ServerState) -> Router {
    let provider_routes = Router::new()
        .route("/pods", get(pods))
        .route("/runningpods/", get(pods))
        .route(
            "/containerLogs/{namespace}/{pod}/{container}",
            get(container_logs),
        )
        .route("/exec/{namespace}/{pod}/{container}", any(exec))
        .route("/attach/{namespace}/{pod}/{container}", any(attach))
        .route("/portForward/{namespace}/{pod}", any(port_forward))
        .route("/stats/summary", get(stats_summary))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_ready));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(provider_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_ready(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    if *state.ready.borrow() {
        next.run(request).await
    } else {
        ApiError(Error::transient("agent is not ready")).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ServerState>) -> Response {
    if *state.ready.borrow() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Pod list as the kubelet returns it.
pub type PodList = k8s_openapi::List<Pod>;

async fn pods(State(state): State<ServerState>) -> ApiResult<Json<PodList>> {
    let cancel = state.cancel.child_token();
    let mut items: Vec<Pod> = state.provider.list_workloads(&cancel).await?;
    items.sort_by_key(WorkloadKey::of);
    Ok(Json(PodList {
        items,
        ..Default::default()
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    tail_lines: Option<u32>,
}

async fn container_logs(
    State(state): State<ServerState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let key = WorkloadKey::new(namespace, pod);
    let cancel = state.cancel.child_token();
    let logs = state
        .provider
        .get_logs(&key, &container, query.tail_lines, &cancel)
        .await?;
    let mut response = logs.into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Non-interactive exec. `command` repeats once per argument.
async fn exec(
    State(state): State<ServerState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
) -> ApiResult<Json<ExecResponse>> {
    let command = query_values(query.as_deref().unwrap_or(""), "command");
    if command.is_empty() {
        return Err(Error::invalid_input("exec requires at least one command argument").into());
    }

    let key = WorkloadKey::new(namespace, pod);
    let cancel = state.cancel.child_token();
    let output = state
        .provider
        .exec_in_container(&key, &container, &command, &cancel)
        .await?;
    Ok(Json(ExecResponse {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    }))
}

async fn attach(Path((namespace, pod, container)): Path<(String, String, String)>) -> ApiError {
    ApiError(Error::unsupported(format!(
        "attach to {namespace}/{pod}/{container} is not supported"
    )))
}

async fn port_forward(Path((namespace, pod)): Path<(String, String)>) -> ApiError {
    ApiError(Error::unsupported(format!(
        "port forwarding to {namespace}/{pod} is not supported"
    )))
}

async fn stats_summary(State(state): State<ServerState>) -> ApiResult<Json<serde_json::Value>> {
    let cancel = state.cancel.child_token();
    Ok(Json(state.provider.stats_summary(&cancel).await?))
}

/// All values of `name` in a urlencoded query string, in order.
fn query_values(query: &str, name: &str) -> Vec<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .filter(|(key, _)| percent_decode(key) == name)
        .map(|(_, value)| percent_decode(value))
        .collect()
}

fn percent_decode(input: &str) -> String {
    let hex = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                    continue;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// =============================================================================
// Serving
// =============================================================================

/// Serve `router` on `listener` until cancelled. TLS when an acceptor is
/// given, plain HTTP otherwise.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) -> vk_errdefs::Result<()> {
    let addr = listener.local_addr()?;
    let Some(acceptor) = tls else {
        warn!(addr = %addr, "No TLS certificate configured, serving plain HTTP");
        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        return Ok(());
    };

    info!(addr = %addr, "Serving kubelet API over TLS");
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        connections.spawn(serve_tls_connection(acceptor, router, stream, peer));
    }

    connections.shutdown().await;
    info!("Kubelet API stopped");
    Ok(())
}

async fn serve_tls_connection(
    acceptor: TlsAcceptor,
    router: Router,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
    };
    let service = TowerToHyperService::new(router);
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %peer, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::workload::tests::pod;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use rstest::rstest;
    use tower::ServiceExt;

    fn state(ready: bool) -> (ServerState, Arc<MockProvider>, watch::Sender<bool>) {
        let provider = Arc::new(MockProvider::new("vk-1", "Linux", "10.0.0.5", 10250));
        let (tx, rx) = watch::channel(ready);
        (
            ServerState {
                provider: provider.clone(),
                ready: rx,
                cancel: CancellationToken::new(),
            },
            provider,
            tx,
        )
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .clone()
            .oneshot(HttpRequest::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[rstest]
    #[case(ErrorKind::NotFound, 404)]
    #[case(ErrorKind::InvalidInput, 400)]
    #[case(ErrorKind::Unsupported, 501)]
    #[case(ErrorKind::Unauthorized, 401)]
    #[case(ErrorKind::Forbidden, 403)]
    #[case(ErrorKind::Conflict, 409)]
    #[case(ErrorKind::Transient, 503)]
    #[case(ErrorKind::Timeout, 503)]
    #[case(ErrorKind::Fatal, 500)]
    fn test_status_mapping(#[case] kind: ErrorKind, #[case] code: u16) {
        assert_eq!(status_for(kind).as_u16(), code);
    }

    #[tokio::test]
    async fn test_provider_routes_wait_for_ready() {
        let (state, _, ready) = state(false);
        let router = router(state);

        assert_eq!(get(&router, "/healthz").await.0, StatusCode::OK);
        assert_eq!(get(&router, "/readyz").await.0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get(&router, "/pods").await.0, StatusCode::SERVICE_UNAVAILABLE);

        ready.send_replace(true);
        assert_eq!(get(&router, "/readyz").await.0, StatusCode::OK);
        assert_eq!(get(&router, "/pods").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pods_and_logs_come_from_provider() {
        let (state, provider, _ready) = state(true);
        let cancel = CancellationToken::new();
        provider
            .create_workload(&pod("default", "web", "nginx"), &cancel)
            .await
            .unwrap();
        let router = router(state);

        let (status, body) = get(&router, "/pods").await;
        assert_eq!(status, StatusCode::OK);
        let list: PodList = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.items.len(), 1);

        let (status, body) = get(&router, "/containerLogs/default/web/main?tailLines=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "main: log line 9\nmain: log line 10\n"
        );

        let (status, body) = get(&router, "/containerLogs/default/nope/main").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.kind, "NotFound");
    }

    #[tokio::test]
    async fn test_exec_collects_command_arguments() {
        let (state, provider, _ready) = state(true);
        let cancel = CancellationToken::new();
        provider
            .create_workload(&pod("default", "web", "nginx"), &cancel)
            .await
            .unwrap();
        let router = router(state);

        let (status, body) = get(
            &router,
            "/exec/default/web/main?command=echo&command=hello%20world&stdout=true",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let output: ExecResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(output.stdout, "echo hello world\n");
        assert_eq!(output.exit_code, 0);

        let (status, _) = get(&router, "/exec/default/web/main").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_attach_and_port_forward_are_unsupported() {
        let (state, _, _ready) = state(true);
        let router = router(state);
        assert_eq!(
            get(&router, "/attach/default/web/main").await.0,
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            get(&router, "/portForward/default/web").await.0,
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[rstest]
    #[case("command=ls&command=-la", vec!["ls", "-la"])]
    #[case("command=a+b&x=1&command=%2Ftmp", vec!["a b", "/tmp"])]
    #[case("stdin=true", vec![])]
    #[case("command=100%", vec!["100%"])]
    fn test_query_values(#[case] query: &str, #[case] expected: Vec<&str>) {
        assert_eq!(query_values(query, "command"), expected);
    }
}
