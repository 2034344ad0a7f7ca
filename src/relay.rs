//! HTTP relay front: accepts client connections, classifies each request as
//! a read or a write, drives the leader synchronously and fans writes out to
//! the followers' durable queues.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, request::Parts, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info};

use crate::backend::HttpBackend;
use crate::config::HttpRelayConfig;
use crate::envelope::{OutboundRequest, RequestEnvelope};
use crate::error::{RelayError, Result};
use crate::pool::BufferPool;
use crate::sink::CaptureSink;

/// A relay for HTTP ClickHouse writes.
pub struct HttpRelay {
    name: String,
    local_addr: SocketAddr,
    core: Arc<RelayCore>,
    cancel: CancellationToken,
    closing: Arc<AtomicBool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

struct RelayCore {
    backends: Vec<Arc<HttpBackend>>,
}

/// Peer address of the accepted connection, stashed in request extensions.
#[derive(Debug, Clone, Copy)]
struct ClientAddr(SocketAddr);

impl HttpRelay {
    /// Bind the listener, construct every backend (launching its replay
    /// loop) and start serving.
    pub async fn start(cfg: HttpRelayConfig) -> Result<Self> {
        let mut backends = Vec::with_capacity(cfg.outputs.len());
        for output in &cfg.outputs {
            backends.push(HttpBackend::new(output, &cfg.buffer_dir)?);
        }
        let core = Arc::new(RelayCore { backends });

        let listener = TcpListener::bind(&cfg.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let acceptor = match &cfg.ssl_combined_pem {
            Some(path) => Some(load_tls_acceptor(path)?),
            None => None,
        };

        let router = Router::new().fallback(handle).with_state(core.clone());

        let cancel = CancellationToken::new();
        let closing = Arc::new(AtomicBool::new(false));
        let serve_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            router,
            cancel.clone(),
            closing.clone(),
        ));

        info!(
            name = %cfg.display_name(),
            addr = %local_addr,
            scheme = cfg.scheme(),
            "relay listening"
        );

        Ok(Self {
            name: cfg.display_name(),
            local_addr,
            core,
            cancel,
            closing,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn backends(&self) -> &[Arc<HttpBackend>] {
        &self.core.backends
    }

    /// Stop accepting connections and shut every backend's replay loop
    /// down. Idempotent.
    pub async fn stop(&self) {
        // The closing store happens before the listener is torn down so the
        // accept loop classifies the shutdown as intentional.
        self.closing.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let task = self
            .serve_task
            .lock()
            .expect("serve task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        for backend in &self.core.backends {
            backend.stop().await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    router: Router,
    cancel: CancellationToken,
    closing: Arc<AtomicBool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(TokioIo::new(tls_stream), peer, router).await,
                    Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(TokioIo::new(stream), peer, router).await,
            }
        });
    }
}

async fn serve_connection<I>(io: TokioIo<I>, peer: SocketAddr, router: Router)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
        req.extensions_mut().insert(ClientAddr(peer));
        let router = router.clone();
        async move { router.oneshot(req).await }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!(peer = %peer, error = %e, "connection error");
    }
}

async fn handle(State(core): State<Arc<RelayCore>>, req: Request) -> Response {
    let remote_addr = req
        .extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.to_string())
        .unwrap_or_default();

    // Liveness behavior: a relay with no backends answers for itself.
    if core.backends.is_empty() {
        return (StatusCode::OK, "Ok.\n").into_response();
    }
    let leader = &core.backends[0];

    let (parts, body) = req.into_parts();

    // Read-path passthrough: anything that is not a POST goes straight to
    // the leader and its response is returned verbatim.
    if parts.method != Method::POST {
        return proxy_to_leader(leader, &parts, body, &remote_addr).await;
    }

    let query = parts.uri.query().unwrap_or("");
    if query_param(query, "decompress").as_deref() == Some("1") {
        return StatusCode::NOT_IMPLEMENTED.into_response();
    }
    if query_param(query, "query").is_some_and(|q| is_select(q.as_bytes())) {
        return proxy_to_leader(leader, &parts, body, &remote_addr).await;
    }

    let mut buf = BufferPool::global().get();
    if let Err(e) = read_body(body, &mut buf).await {
        return RelayError::BodyRead(e).into_response();
    }

    // A POST whose body is a SELECT statement is still a read.
    if is_select(&buf) {
        let body = Bytes::copy_from_slice(&buf);
        drop(buf);
        return forward_to_leader(leader, &parts, body, &remote_addr).await;
    }

    let envelope = RequestEnvelope::from_parts(&parts, remote_addr.clone(), &buf);
    drop(buf);

    let body = Bytes::copy_from_slice(&envelope.body);
    let mut sink = CaptureSink::default();
    let out = outbound_from_parts(&parts, body, &remote_addr);
    if leader.reverse_proxy(out, &mut sink).await.is_err() {
        // The leader could not be reached; the client will retry, so
        // buffering to followers would only duplicate the write.
        return sink.into_response();
    }

    for follower in &core.backends[1..] {
        if let Err(e) = follower.append(&envelope).await {
            error!(
                backend = %follower.name(),
                error = %e,
                "failed to buffer write for follower"
            );
        }
    }

    sink.into_response()
}

/// Read the remaining body and forward to the leader, returning its
/// response (or the synthesized 502) to the client.
async fn proxy_to_leader(
    leader: &HttpBackend,
    parts: &Parts,
    body: Body,
    remote_addr: &str,
) -> Response {
    let mut buf = BufferPool::global().get();
    if let Err(e) = read_body(body, &mut buf).await {
        return RelayError::BodyRead(e).into_response();
    }
    let body = Bytes::copy_from_slice(&buf);
    drop(buf);

    forward_to_leader(leader, parts, body, remote_addr).await
}

async fn forward_to_leader(
    leader: &HttpBackend,
    parts: &Parts,
    body: Bytes,
    remote_addr: &str,
) -> Response {
    let mut sink = CaptureSink::default();
    let out = outbound_from_parts(parts, body, remote_addr);
    // A 502-class failure is already rendered into the sink.
    let _ = leader.reverse_proxy(out, &mut sink).await;
    sink.into_response()
}

fn outbound_from_parts(parts: &Parts, body: Bytes, remote_addr: &str) -> OutboundRequest {
    OutboundRequest {
        method: parts.method.clone(),
        uri: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: parts.headers.clone(),
        host: parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
        remote_addr: (!remote_addr.is_empty()).then(|| remote_addr.to_string()),
        timeout: None,
    }
}

async fn read_body(body: Body, buf: &mut Vec<u8>) -> std::result::Result<(), String> {
    let mut body = body;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| e.to_string())?;
        if let Some(data) = frame.data_ref() {
            buf.extend_from_slice(data);
        }
    }
    Ok(())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// The 7-byte, case-insensitive `"SELECT "` prefix check used for both the
/// `query` parameter and the request body.
fn is_select(input: &[u8]) -> bool {
    input.len() >= 7 && input[..7].eq_ignore_ascii_case(b"SELECT ")
}

fn load_tls_acceptor(path: &str) -> Result<TlsAcceptor> {
    let pem = std::fs::read(path)?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(RelayError::from)?;
    if certs.is_empty() {
        return Err(RelayError::Internal(format!(
            "no certificate found in {path}"
        )));
    }

    let key = rustls_pemfile::private_key(&mut &pem[..])
        .map_err(RelayError::from)?
        .ok_or_else(|| RelayError::Internal(format!("no private key found in {path}")))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Internal(format!("failed to configure TLS: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_prefix_is_case_insensitive() {
        assert!(is_select(b"SELECT 1"));
        assert!(is_select(b"select count() FROM t"));
        assert!(is_select(b"SeLeCt *"));
        assert!(!is_select(b"INSERT INTO t VALUES (1)"));
        assert!(!is_select(b"SELECT")); // no trailing space
        assert!(!is_select(b"SEL"));
        assert!(!is_select(b""));
    }

    #[test]
    fn query_param_decodes_url_encoding() {
        let query = "query=SELECT%201&decompress=1";
        assert_eq!(query_param(query, "query").as_deref(), Some("SELECT 1"));
        assert_eq!(query_param(query, "decompress").as_deref(), Some("1"));
        assert_eq!(query_param(query, "database"), None);
    }

    #[test]
    fn select_detection_via_query_param() {
        assert!(query_param("query=SELECT+1", "query").is_some_and(|q| is_select(q.as_bytes())));
        assert!(
            !query_param("query=INSERT%20INTO%20t", "query")
                .is_some_and(|q| is_select(q.as_bytes()))
        );
    }
}
