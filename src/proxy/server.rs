//! Namespace proxy server
//!
//! Accepts engine API requests on a Unix socket or TCP address, runs the
//! matched route's rewriters and forwards the result to the upstream engine.
//! Requests without a route pass through untouched.
//!
//! Attach and exec streams take over the client connection: once the
//! response head is written the connection leaves HTTP and is spliced to
//! the upgraded engine connection.

use super::rewrite::{Lookup, ObjectKind, ProxyRequest, RewriteContext};
use super::routes::{Route, RouteRegistry};
use super::scoper::Scoper;
use crate::config::EngineEndpoint;
use crate::engine::transport::{send_cancellable, send_request, EngineStream};
use crate::error::{Result, StackError};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::convert::Infallible;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const RAW_STREAM: &str = "application/vnd.docker.raw-stream";

/// Listening socket of the proxy
pub enum ProxyListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl ProxyListener {
    /// Bind, replacing a stale Unix socket file
    pub async fn bind(endpoint: &EngineEndpoint) -> Result<Self> {
        match endpoint {
            EngineEndpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(ProxyListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            EngineEndpoint::Tcp(addr) => Ok(ProxyListener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    async fn accept(&self) -> std::io::Result<EngineStream> {
        match self {
            ProxyListener::Unix { listener, .. } => {
                listener.accept().await.map(|(s, _)| EngineStream::Unix(s))
            }
            ProxyListener::Tcp(listener) => listener.accept().await.map(|(s, _)| EngineStream::Tcp(s)),
        }
    }
}

impl std::fmt::Display for ProxyListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyListener::Unix { path, .. } => write!(f, "unix://{}", path.display()),
            ProxyListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp://{}", addr),
                Err(_) => write!(f, "tcp://?"),
            },
        }
    }
}

impl Drop for ProxyListener {
    fn drop(&mut self) {
        if let ProxyListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Looks objects up on the upstream engine
pub struct UpstreamLookup {
    endpoint: EngineEndpoint,
}

impl UpstreamLookup {
    pub fn new(endpoint: EngineEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Lookup for UpstreamLookup {
    async fn inspect(&self, kind: ObjectKind, name: &str) -> Result<Option<Value>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(kind.inspect_path(name))
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| StackError::Http(format!("failed to build request: {}", e)))?;
        let response = send_request(&self.endpoint, request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StackError::remote(status.as_u16(), &bytes));
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

struct ProxyState {
    routes: RouteRegistry,
    scoper: Arc<dyn Scoper>,
    lookup: Arc<dyn Lookup>,
    upstream: EngineEndpoint,
}

/// The proxy: a route registry, a scoper and an upstream engine
#[derive(Clone)]
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(routes: RouteRegistry, scoper: Arc<dyn Scoper>, upstream: EngineEndpoint) -> Self {
        let lookup = Arc::new(UpstreamLookup::new(upstream.clone()));
        Self::with_lookup(routes, scoper, lookup, upstream)
    }

    pub fn with_lookup(
        routes: RouteRegistry,
        scoper: Arc<dyn Scoper>,
        lookup: Arc<dyn Lookup>,
        upstream: EngineEndpoint,
    ) -> Self {
        Self {
            state: Arc::new(ProxyState {
                routes,
                scoper,
                lookup,
                upstream,
            }),
        }
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: ProxyListener) -> Result<()> {
        info!(
            upstream = %self.state.upstream,
            routes = self.state.routes.len(),
            "namespace proxy listening on {}",
            listener
        );

        loop {
            let stream = listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let hijack: HijackSlot = Arc::default();
                let service = {
                    let hijack = Arc::clone(&hijack);
                    service_fn(move |request: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        let hijack = Arc::clone(&hijack);
                        async move { Ok::<_, Infallible>(handle(&state, &hijack, request).await) }
                    })
                };

                match http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .without_shutdown()
                    .await
                {
                    Ok(parts) => {
                        let upstream = hijack.lock().ok().and_then(|mut slot| slot.take());
                        if let Some(upstream) = upstream {
                            splice(parts.io.into_inner(), parts.read_buf, upstream).await;
                        }
                    }
                    Err(err) => {
                        let msg = err.to_string().to_lowercase();
                        if !msg.contains("shutting down")
                            && !msg.contains("connection reset")
                            && !msg.contains("broken pipe")
                        {
                            warn!("error serving proxy connection: {}", err);
                        }
                    }
                }
            });
        }
    }
}

/// Engine connection awaiting takeover once the current response is written
type HijackSlot = Arc<Mutex<Option<OnUpgrade>>>;

async fn handle(state: &ProxyState, hijack: &HijackSlot, request: Request<Incoming>) -> Response<ProxyBody> {
    let request_id = Uuid::new_v4();
    debug!(
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
        "proxy request"
    );
    match forward(state, hijack, request).await {
        Ok(response) => {
            debug!(request_id = %request_id, status = response.status().as_u16(), "proxy response");
            response
        }
        Err(e) => {
            debug!(request_id = %request_id, error = %e, "proxy request failed");
            error_response(&e)
        }
    }
}

async fn forward(
    state: &ProxyState,
    hijack: &HijackSlot,
    request: Request<Incoming>,
) -> Result<Response<ProxyBody>> {
    let mut proxied = ProxyRequest::parse(request.method().clone(), request.uri());
    let route = state.routes.find(&mut proxied);

    let client_upgrade = request.headers().contains_key(header::UPGRADE);
    let force_upgrade = !client_upgrade && proxied.hijacks();
    let (parts, body) = request.into_parts();

    let mut streamed = None;
    if route.is_some_and(Route::needs_body) {
        proxied.body = Some(body.collect().await?.to_bytes());
    } else {
        streamed = Some(body.boxed_unsync());
    }

    if let Some(route) = route {
        let ctx = RewriteContext {
            scoper: state.scoper.as_ref(),
            lookup: state.lookup.as_ref(),
        };
        for rewriter in &route.rewriters {
            rewriter.request(&mut proxied, &ctx).await?;
        }
    }

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(proxied.path_and_query());
    for (key, value) in &parts.headers {
        if key == header::HOST || (force_upgrade && key == header::CONNECTION) {
            continue;
        }
        if proxied.body.is_some()
            && (key == header::CONTENT_LENGTH || key == header::TRANSFER_ENCODING)
        {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder = builder.header(header::HOST, "docker");
    if force_upgrade {
        builder = builder
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp");
    }
    let body = match (streamed, proxied.body.take()) {
        (Some(body), _) => body,
        (None, buffered) => full(buffered.unwrap_or_default()),
    };
    let upstream_request = builder
        .body(body)
        .map_err(|e| StackError::Http(format!("failed to build upstream request: {}", e)))?;

    let mut disconnect = None;
    let response = if route.is_some_and(|r| r.cancellable) {
        let (tx, rx) = oneshot::channel();
        disconnect = Some(tx);
        send_cancellable(&state.upstream, upstream_request, rx).await?
    } else {
        send_request(&state.upstream, upstream_request).await?
    };

    let status = response.status();
    if status == StatusCode::SWITCHING_PROTOCOLS {
        return take_over(hijack, client_upgrade, response);
    }
    if is_raw_stream(&response) {
        debug!("engine sent a raw stream without upgrading, relaying output only");
    }

    if let Some(route) = route.filter(|r| r.rewrites_response()) {
        if status.is_success() && is_json(&response) {
            let (mut parts, body) = response.into_parts();
            let bytes = body.collect().await?.to_bytes();
            let mut value: Value = serde_json::from_slice(&bytes)?;
            for rewriter in route.rewriters.iter().rev() {
                rewriter.response(&mut value, state.scoper.as_ref())?;
            }
            let bytes = Bytes::from(serde_json::to_vec(&value)?);
            parts.headers.remove(header::TRANSFER_ENCODING);
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            return Ok(Response::from_parts(parts, full(bytes)));
        }
    }

    let (parts, body) = response.into_parts();
    let body = match disconnect {
        Some(tx) => DisconnectGuard::new(body, tx).boxed_unsync(),
        None => body.boxed_unsync(),
    };
    Ok(Response::from_parts(parts, body))
}

fn is_json<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn is_raw_stream<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .is_some_and(|v| v.as_bytes().starts_with(RAW_STREAM.as_bytes()))
}

/// Answer the client and park the upgraded engine connection for the
/// connection task to splice once the response head is out
///
/// A client that asked to upgrade gets the engine's `101`. Any other client
/// gets a `200` raw stream with `Connection: close`, after which its socket
/// is taken over the same way.
fn take_over(
    hijack: &HijackSlot,
    client_upgrade: bool,
    response: Response<Incoming>,
) -> Result<Response<ProxyBody>> {
    let builder = if client_upgrade {
        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (key, value) in response.headers() {
            builder = builder.header(key, value);
        }
        builder
    } else {
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(RAW_STREAM));
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONNECTION, "close")
    };

    let upstream = hyper::upgrade::on(response);
    match hijack.lock() {
        Ok(mut slot) => *slot = Some(upstream),
        Err(_) => return Err(StackError::Http("connection takeover state is poisoned".to_string())),
    }

    builder
        .body(empty())
        .map_err(|e| StackError::Http(format!("failed to build stream response: {}", e)))
}

/// Copy bytes both ways between a taken-over client and the engine, each
/// direction half-closing its peer when its source ends
async fn splice(client: EngineStream, buffered: Bytes, upstream: OnUpgrade) {
    let upstream = match upstream.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!("engine upgrade failed: {}", e);
            return;
        }
    };
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(TokioIo::new(upstream));

    let to_engine = async {
        // bytes the client sent right after its request head go first
        let copied = match upstream_write.write_all(&buffered).await {
            Ok(()) => tokio::io::copy(&mut client_read, &mut upstream_write).await,
            Err(e) => Err(e),
        };
        let _ = upstream_write.shutdown().await;
        copied
    };
    let to_client = async {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };
    let (sent, received) = tokio::join!(to_engine, to_client);
    for result in [sent, received] {
        if let Err(e) = result {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("broken pipe") && !msg.contains("connection reset") {
                debug!("stream splice error: {}", e);
            }
        }
    }
}

/// Response body that signals the upstream connection when the client
/// stops reading before the end of the stream
struct DisconnectGuard<B> {
    inner: B,
    disconnect: Option<oneshot::Sender<()>>,
}

impl<B> DisconnectGuard<B> {
    fn new(inner: B, disconnect: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            disconnect: Some(disconnect),
        }
    }
}

impl<B: Body + Unpin> Body for DisconnectGuard<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        if frame.is_none() {
            // Finished normally; dropping the sender unsent is not a disconnect
            this.disconnect = None;
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for DisconnectGuard<B> {
    fn drop(&mut self) {
        if let Some(tx) = self.disconnect.take() {
            let _ = tx.send(());
        }
    }
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Engine-style `{"message": ...}` error body
fn error_response(error: &StackError) -> Response<ProxyBody> {
    let (status, message) = match error {
        StackError::Remote { status, message } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            message.clone(),
        ),
        StackError::Usage(_) | StackError::Validation(_) => (StatusCode::BAD_REQUEST, error.to_string()),
        StackError::NotFound(_) => (StatusCode::NOT_FOUND, error.to_string()),
        StackError::Http(_) => (StatusCode::BAD_GATEWAY, error.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    };
    let body = serde_json::json!({ "message": message }).to_string();
    let mut response = Response::new(full(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::scoper::{LabelScoper, PROJECT_LABEL};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    type Seen = Arc<Mutex<Vec<(String, String, String)>>>;

    fn json_response(status: u16, body: Value) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    /// Minimal engine: records requests and answers a few fixed paths
    async fn fake_engine(mut request: Request<Incoming>, seen: Seen) -> Response<Full<Bytes>> {
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let path = request.uri().path().to_string();

        if path.ends_with("/attach") {
            let asked = request
                .headers()
                .get(header::UPGRADE)
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            seen.lock().unwrap().push((method, uri, asked));
            let upgrade = hyper::upgrade::on(&mut request);
            tokio::spawn(async move {
                let mut io = TokioIo::new(upgrade.await.unwrap());
                let mut buf = [0u8; 64];
                let n = io.read(&mut buf).await.unwrap();
                io.write_all(&buf[..n]).await.unwrap();
                io.shutdown().await.unwrap();
            });
            return Response::builder()
                .status(101)
                .header(header::CONNECTION, "Upgrade")
                .header(header::UPGRADE, "tcp")
                .header(header::CONTENT_TYPE, "application/vnd.docker.raw-stream")
                .body(Full::default())
                .unwrap();
        }

        let body = request.into_body().collect().await.unwrap().to_bytes();
        seen.lock()
            .unwrap()
            .push((method.clone(), uri, String::from_utf8_lossy(&body).to_string()));

        match (method.as_str(), path.as_str()) {
            ("GET", "/v1.47/volumes") => json_response(
                200,
                serde_json::json!({"Volumes": [{"Name": "myproject_foo"}], "Warnings": null}),
            ),
            ("GET", "/networks/myproject_theirs") => json_response(
                200,
                serde_json::json!({"Name": "myproject_theirs", "Labels": {PROJECT_LABEL: "other"}}),
            ),
            ("POST", "/v1.47/networks/create") => json_response(201, serde_json::json!({"Id": "n1"})),
            _ => json_response(404, serde_json::json!({"message": "no such object"})),
        }
    }

    async fn start(dir: &TempDir) -> (EngineEndpoint, Seen) {
        let engine_path = dir.path().join("engine.sock");
        let engine = UnixListener::bind(&engine_path).unwrap();
        let seen: Seen = Arc::default();
        let record = seen.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = engine.accept().await.unwrap();
                let record = record.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let record = record.clone();
                        async move { Ok::<_, Infallible>(fake_engine(request, record).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });

        let proxy_endpoint = EngineEndpoint::Unix(dir.path().join("proxy.sock"));
        let listener = ProxyListener::bind(&proxy_endpoint).await.unwrap();
        let server = ProxyServer::new(
            RouteRegistry::standard(),
            Arc::new(LabelScoper::new("myproject", PROJECT_LABEL)),
            EngineEndpoint::Unix(engine_path),
        );
        tokio::spawn(async move { server.serve(listener).await });
        (proxy_endpoint, seen)
    }

    async fn call(endpoint: &EngineEndpoint, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "docker")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = send_request(endpoint, request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_list_is_filtered_and_descoped() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = start(&dir).await;

        let (status, body) = call(
            &proxy,
            Method::GET,
            "/v1.47/volumes?filters=%7B%22name%22%3A%5B%22foo%22%5D%7D",
            "",
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["Volumes"][0]["Name"], "foo");

        let seen = seen.lock().unwrap();
        let uri = &seen[0].1;
        let query = uri.split_once('?').unwrap().1;
        let filters: String = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "filters")
            .unwrap()
            .1
            .into_owned();
        assert_eq!(
            filters,
            r#"{"label":["com.docker.project.id=myproject"],"name":["myproject_foo"]}"#
        );
    }

    #[tokio::test]
    async fn test_create_is_scoped() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = start(&dir).await;

        let (status, body) = call(
            &proxy,
            Method::POST,
            "/v1.47/networks/create",
            r#"{"Name":"front","Driver":"overlay"}"#,
        )
        .await;
        assert_eq!(status, 201);
        assert_eq!(body["Id"], "n1");

        let seen = seen.lock().unwrap();
        let sent: Value = serde_json::from_str(&seen[0].2).unwrap();
        assert_eq!(sent["Name"], "myproject_front");
        assert_eq!(sent["Driver"], "overlay");
        assert_eq!(sent["Labels"][PROJECT_LABEL], "myproject");
    }

    #[tokio::test]
    async fn test_out_of_scope_inspect_is_hidden() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = start(&dir).await;

        let (status, body) = call(&proxy, Method::GET, "/v1.47/networks/theirs", "").await;
        assert_eq!(status, 404);
        assert_eq!(body["message"], "\"theirs\" not found");

        // Only the two lookups reached the engine
        let paths: Vec<String> = seen.lock().unwrap().iter().map(|s| s.1.clone()).collect();
        assert_eq!(paths, vec!["/networks/theirs", "/networks/myproject_theirs"]);
    }

    #[tokio::test]
    async fn test_unrouted_requests_pass_through() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = start(&dir).await;

        let (status, _) = call(&proxy, Method::GET, "/v1.47/info", "").await;
        assert_eq!(status, 404);
        assert_eq!(seen.lock().unwrap()[0].1, "/v1.47/info");
    }

    #[tokio::test]
    async fn test_attach_upgrade_is_bridged() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = start(&dir).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1.47/containers/web/attach?stream=1")
            .header(header::HOST, "docker")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = send_request(&proxy, request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        let mut io = TokioIo::new(hyper::upgrade::on(response).await.unwrap());
        io.write_all(b"ping").await.unwrap();
        let mut echoed = Vec::new();
        io.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");

        let attach = seen
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.1.contains("/attach"))
            .map(|s| s.1.clone())
            .unwrap();
        assert_eq!(attach, "/v1.47/containers/myproject_web/attach?stream=1");
    }

    #[tokio::test]
    async fn test_attach_without_upgrade_takes_over_connection() {
        let dir = TempDir::new().unwrap();
        let (proxy, seen) = start(&dir).await;
        let EngineEndpoint::Unix(path) = &proxy else {
            panic!("proxy listens on a unix socket");
        };

        let mut client = tokio::net::UnixStream::connect(path).await.unwrap();
        client
            .write_all(
                b"POST /v1.47/containers/web/attach?stream=1&stdin=1 HTTP/1.1\r\nHost: docker\r\n\r\nping",
            )
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let text = String::from_utf8_lossy(&received).to_string();
        let (head, rest) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert!(head
            .to_lowercase()
            .contains("content-type: application/vnd.docker.raw-stream"));
        assert_eq!(rest, "ping");

        let attach = seen
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.1.contains("/attach"))
            .cloned()
            .unwrap();
        assert_eq!(attach.1, "/v1.47/containers/myproject_web/attach?stream=1&stdin=1");
        assert_eq!(attach.2, "tcp");
    }
}
