//! Serialized representation of a buffered HTTP request.
//!
//! A write that cannot be delivered to a follower inline is captured as a
//! [`RequestEnvelope`], encoded as a JSON document and compressed with the
//! Snappy block format before it is handed to the durable queue. The envelope
//! carries everything needed to reconstruct a semantically equivalent
//! outbound request later, without access to the original connection.

use axum::http::{
    header, request::Parts, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("json codec error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("snappy codec error: {source}")]
    Snappy {
        #[from]
        source: snap::Error,
    },

    #[error("invalid method {method:?}")]
    InvalidMethod { method: String },
}

/// A buffered HTTP request, including its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    /// Path and raw query as received by the relay.
    pub uri: String,
    pub version: String,
    /// Header name/value pairs in wire order; repeated names are preserved.
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    /// Declared trailer header names.
    pub trailer: Vec<String>,
    pub host: String,
    pub remote_addr: String,
    /// The original request-URI, verbatim.
    pub request_uri: String,
    pub body: Vec<u8>,
}

/// An outbound request reconstructed from an envelope (or captured live),
/// ready to be driven through a backend's reverse proxy.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path and raw query to join onto the backend location.
    pub uri: String,
    pub headers: HeaderMap,
    pub host: Option<String>,
    pub body: Bytes,
    pub remote_addr: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestEnvelope {
    /// Capture an incoming request. The body is carried verbatim.
    pub fn from_parts(parts: &Parts, remote_addr: String, body: &[u8]) -> Self {
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let transfer_encoding = comma_separated(&parts.headers, header::TRANSFER_ENCODING);
        let trailer = comma_separated(&parts.headers, header::TRAILER);

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default();

        Self {
            method: parts.method.to_string(),
            uri: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            version: version_str(parts.version).to_string(),
            headers,
            content_length,
            transfer_encoding,
            trailer,
            host,
            remote_addr,
            request_uri: parts.uri.to_string(),
            body: body.to_vec(),
        }
    }

    /// Encode as a JSON document compressed with the Snappy block format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let data = serde_json::to_vec(self)?;
        Ok(snap::raw::Encoder::new().compress_vec(&data)?)
    }

    /// Decode a record produced by [`encode`](Self::encode). Failure marks
    /// the record as poison; the replay loop drops it.
    pub fn decode(record: &[u8]) -> Result<Self, EnvelopeError> {
        let data = snap::raw::Decoder::new().decompress_vec(record)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Reconstruct an outbound request bound to the supplied per-attempt
    /// timeout. The stored body is cloneable, so the attempt is restartable.
    pub fn to_outbound(&self, timeout: Option<Duration>) -> Result<OutboundRequest, EnvelopeError> {
        let method =
            Method::from_bytes(self.method.as_bytes()).map_err(|_| EnvelopeError::InvalidMethod {
                method: self.method.clone(),
            })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        Ok(OutboundRequest {
            method,
            uri: self.uri.clone(),
            headers,
            host: (!self.host.is_empty()).then(|| self.host.clone()),
            body: Bytes::copy_from_slice(&self.body),
            remote_addr: (!self.remote_addr.is_empty()).then(|| self.remote_addr.clone()),
            timeout,
        })
    }
}

fn comma_separated(headers: &HeaderMap, name: HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}

/// `true` for a gateway-level failure status. `502` is reserved for
/// transport/proxy-layer failure; any other status is a delivered response.
pub fn is_gateway_failure(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY
}
