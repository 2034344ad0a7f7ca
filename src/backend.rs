//! A single backend server: its reverse proxy and its durable follower queue.

use anyhow::Context;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::HttpOutputConfig;
use crate::envelope::{OutboundRequest, RequestEnvelope};
use crate::error::{RelayError, Result};
use crate::queue::{DurableQueue, FileQueue};
use crate::sink::{is_hop_by_hop_header, DiscardSink, GatewayRecorder, ResponseSink};

/// Delay between replay attempts while the queue head cannot make progress.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// One backend server: a reverse-proxy forwarder to its URL plus the durable
/// queue and replay loop that decouple follower delivery from the client.
pub struct HttpBackend {
    name: String,
    location: Url,
    timeout: Duration,
    client: reqwest::Client,
    queue: Box<dyn DurableQueue>,
    cancel: CancellationToken,
    replay_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpBackend {
    /// Construct the backend, open its queue at `<buffer_dir>/<name>` and
    /// launch its replay loop.
    pub fn new(cfg: &HttpOutputConfig, buffer_dir: &str) -> Result<Arc<Self>> {
        let name = cfg.resolved_name().to_string();

        let location = Url::parse(&cfg.location)
            .with_context(|| format!("invalid backend location '{}'", cfg.location))?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.skip_tls_verification)
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build HTTP client: {e}")))?;

        let queue_dir = Path::new(buffer_dir).join(queue_dir_component(&name));
        let queue = FileQueue::open(queue_dir)?;

        let backend = Arc::new(Self {
            name,
            location,
            timeout: cfg.timeout,
            client,
            queue: Box::new(queue),
            cancel: CancellationToken::new(),
            replay_task: Mutex::new(None),
        });

        let handle = tokio::spawn({
            let backend = backend.clone();
            async move { backend.replay_loop().await }
        });
        *backend.replay_task.lock().expect("replay task lock poisoned") = Some(handle);

        Ok(backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_len(&self) -> u64 {
        self.queue.len()
    }

    /// Forward a request to this backend, writing the observed response into
    /// `sink`. Returns an error iff the recorded status is exactly
    /// `502 Bad Gateway`; any other status is a delivered response.
    pub async fn reverse_proxy(
        &self,
        out: OutboundRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<StatusCode> {
        let mut recorder = GatewayRecorder::new(sink);
        self.forward(out, &mut recorder).await;
        recorder.error()?;
        Ok(recorder.status().unwrap_or(StatusCode::OK))
    }

    /// Best-effort inline delivery followed by durable buffering.
    ///
    /// FIFO is guaranteed only for records that transit the queue: an
    /// empty-queue inline attempt that fails is enqueued behind whatever
    /// arrived in the meantime.
    pub async fn append(&self, envelope: &RequestEnvelope) -> Result<()> {
        if self.queue.is_empty() {
            if let Ok(out) = envelope.to_outbound(Some(self.timeout)) {
                let mut sink = DiscardSink;
                if let Ok(status) = self.reverse_proxy(out, &mut sink).await {
                    if status == StatusCode::OK {
                        return Ok(());
                    }
                }
            }
        }

        let record = envelope.encode()?;
        self.queue.enqueue(&record)?;
        Ok(())
    }

    /// Cancel the replay loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .replay_task
            .lock()
            .expect("replay task lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn forward(&self, out: OutboundRequest, sink: &mut GatewayRecorder<'_>) {
        let url = proxy_url(&self.location, &out.uri);

        let mut headers = HeaderMap::new();
        for (name, value) in out.headers.iter() {
            // content-length is recomputed from the body we actually send
            if !is_hop_by_hop_header(name)
                && name != &header::HOST
                && name != &header::CONTENT_LENGTH
            {
                headers.append(name, value.clone());
            }
        }
        if let Some(host) = &out.host {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert(header::HOST, value);
            }
        }
        if let Some(remote_addr) = &out.remote_addr {
            let forwarded_for = remote_addr
                .parse::<SocketAddr>()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|_| remote_addr.clone());
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert("x-forwarded-for", value);
            }
        }

        let mut request = self
            .client
            .request(out.method, url)
            .headers(headers)
            .body(out.body);
        if let Some(timeout) = out.timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return bad_gateway(sink, &e),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return bad_gateway(sink, &e),
        };

        sink.write_head(status, &headers);
        sink.write_body(&body);
    }

    /// Drain the queue into the backend, in enqueue order, forever.
    ///
    /// The head is never skipped on transient failure: a transport error
    /// leaves it in place and the loop retries after [`RETRY_INTERVAL`]. A
    /// record the backend rejects with a non-200 status is logged and
    /// considered delivered; an undecodable record is poison and dropped.
    async fn replay_loop(&self) {
        let mut wait = false;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if wait {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
            }

            let record = match self.queue.peek() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    wait = true;
                    continue;
                }
                Err(e) => {
                    warn!(backend = %self.name, error = %e, "queue peek failed");
                    wait = true;
                    continue;
                }
            };

            let out = match RequestEnvelope::decode(&record)
                .map_err(RelayError::from)
                .and_then(|envelope| {
                    envelope
                        .to_outbound(Some(self.timeout))
                        .map_err(RelayError::from)
                }) {
                Ok(out) => out,
                Err(e) => {
                    warn!(backend = %self.name, error = %e, "dropping undecodable record");
                    if let Err(e) = self.queue.dequeue() {
                        warn!(backend = %self.name, error = %e, "queue dequeue failed");
                        wait = true;
                    }
                    continue;
                }
            };

            let mut sink = DiscardSink;
            match self.reverse_proxy(out, &mut sink).await {
                Err(_) => {
                    // Transport failure: leave the head in place and retry.
                    wait = true;
                    continue;
                }
                Ok(status) if status != StatusCode::OK => {
                    warn!(
                        backend = %self.name,
                        status = %status,
                        "backend rejected buffered write"
                    );
                }
                Ok(_) => {
                    debug!(backend = %self.name, "buffered write delivered");
                }
            }

            if let Err(e) = self.queue.dequeue() {
                warn!(backend = %self.name, error = %e, "queue dequeue failed");
                wait = true;
                continue;
            }
            wait = false;
        }
    }
}

fn bad_gateway(sink: &mut GatewayRecorder<'_>, error: &dyn std::fmt::Display) {
    sink.write_head(StatusCode::BAD_GATEWAY, &HeaderMap::new());
    sink.write_body(error.to_string().as_bytes());
}

/// Join the backend location with the request's path and raw query, keeping
/// exactly one slash at the seam and merging the query strings.
fn proxy_url(target: &Url, request_uri: &str) -> Url {
    let (path, query) = match request_uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (request_uri, None),
    };

    let mut url = target.clone();
    url.set_path(&single_joining_slash(target.path(), path));

    let merged = match (target.query(), query) {
        (Some(target_query), Some(query)) => Some(format!("{target_query}&{query}")),
        (Some(target_query), None) => Some(target_query.to_string()),
        (None, Some(query)) => Some(query.to_string()),
        (None, None) => None,
    };
    url.set_query(merged.as_deref());

    url
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Backend names default to their location URL; percent-encode anything
/// outside a filesystem-safe subset. The encoding is injective, so distinct
/// backend names can never share a queue directory.
fn queue_dir_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
