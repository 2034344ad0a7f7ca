//! Response recorders used by the forwarding paths.
//!
//! A reverse-proxy attempt writes whatever it observed into a
//! [`ResponseSink`]: the client handler supplies a [`CaptureSink`] that is
//! later turned into the client's response, while the replay loop and inline
//! append attempts supply a [`DiscardSink`] because no client is listening.
//! Every attempt is wrapped in a [`GatewayRecorder`], whose recorded `502`
//! is the single signal distinguishing proxy-layer failure from downstream
//! application errors.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::envelope::is_gateway_failure;
use crate::error::RelayError;

pub trait ResponseSink: Send {
    fn write_head(&mut self, status: StatusCode, headers: &HeaderMap);
    fn write_body(&mut self, chunk: &[u8]);
}

/// Absorbs writes and status updates with no observable effect.
pub struct DiscardSink;

impl ResponseSink for DiscardSink {
    fn write_head(&mut self, _status: StatusCode, _headers: &HeaderMap) {}
    fn write_body(&mut self, _chunk: &[u8]) {}
}

/// Buffers the observed response so it can be returned to the client.
#[derive(Default)]
pub struct CaptureSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseSink for CaptureSink {
    fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.status = Some(status);
        self.headers = headers.clone();
    }

    fn write_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}

impl CaptureSink {
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status.unwrap_or(StatusCode::OK));

        for (name, value) in self.headers.iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Wraps another sink, records the most recent status, and accumulates body
/// bytes while the status indicates a gateway-level failure. All writes are
/// passed through to the wrapped sink.
pub struct GatewayRecorder<'a> {
    inner: &'a mut dyn ResponseSink,
    status: Option<StatusCode>,
    gateway_body: Vec<u8>,
}

impl<'a> GatewayRecorder<'a> {
    pub fn new(inner: &'a mut dyn ResponseSink) -> Self {
        Self {
            inner,
            status: None,
            gateway_body: Vec::new(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// `Err` iff the recorded status is exactly `502 Bad Gateway`, carrying
    /// the captured body as the message.
    pub fn error(&self) -> Result<(), RelayError> {
        match self.status {
            Some(status) if is_gateway_failure(status) => Err(RelayError::BadGateway(
                String::from_utf8_lossy(&self.gateway_body).into_owned(),
            )),
            _ => Ok(()),
        }
    }
}

impl ResponseSink for GatewayRecorder<'_> {
    fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.status = Some(status);
        self.inner.write_head(status, headers);
    }

    fn write_body(&mut self, chunk: &[u8]) {
        if self.status.is_some_and(is_gateway_failure) {
            self.gateway_body.extend_from_slice(chunk);
        }
        self.inner.write_body(chunk);
    }
}

/// Hop-by-hop headers are stripped when a response is relayed.
pub(crate) fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_passes_through_delivered_responses() {
        let mut capture = CaptureSink::default();
        let mut recorder = GatewayRecorder::new(&mut capture);

        recorder.write_head(StatusCode::IM_A_TEAPOT, &HeaderMap::new());
        recorder.write_body(b"short and stout");

        assert_eq!(recorder.status(), Some(StatusCode::IM_A_TEAPOT));
        assert!(recorder.error().is_ok());
        assert_eq!(capture.body, b"short and stout");
    }

    #[test]
    fn recorder_captures_gateway_failures() {
        let mut discard = DiscardSink;
        let mut recorder = GatewayRecorder::new(&mut discard);

        recorder.write_head(StatusCode::BAD_GATEWAY, &HeaderMap::new());
        recorder.write_body(b"connect refused");

        let err = recorder.error().unwrap_err();
        assert!(matches!(err, RelayError::BadGateway(ref text) if text == "connect refused"));
    }

    #[test]
    fn recorder_only_buffers_while_status_is_502() {
        let mut discard = DiscardSink;
        let mut recorder = GatewayRecorder::new(&mut discard);

        recorder.write_head(StatusCode::OK, &HeaderMap::new());
        recorder.write_body(b"result rows");

        assert!(recorder.gateway_body.is_empty());
        assert!(recorder.error().is_ok());
    }

    #[test]
    fn capture_sink_strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-clickhouse-summary", "{}".parse().unwrap());

        let mut capture = CaptureSink::default();
        capture.write_head(StatusCode::OK, &headers);
        capture.write_body(b"Ok.");

        let response = capture.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("x-clickhouse-summary").is_some());
    }
}
