//! HTTP/1.1 wire codec for the client-facing connection engine
//!
//! The connection pumps own their sockets directly, so requests are parsed
//! incrementally out of each connection's read buffer here and responses
//! are serialized back to raw bytes. Only what the gateway's clients
//! actually speak is supported: HTTP/1.1 with Content-Length bodies.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;

/// Upper bound on a request head; larger heads are a protocol violation.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Upper bound on a request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// One parsed inbound HTTP request.
///
/// Owned exclusively by the producing connection until handed to the
/// dispatch loop; ownership then transfers to the handling task.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestEnvelope {
    /// Bearer token from the Authorization header, if present.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.headers.get(AUTHORIZATION)?.to_str().ok()?;
        value.strip_prefix("Bearer ").map(str::trim)
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// One outbound HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseEnvelope {
    /// JSON response with the given status.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from(body),
        }
    }

    /// `{"error": ..., "message": ...}` body, the error shape every
    /// handler uses.
    pub fn error(status: StatusCode, error: &str, message: &str) -> Self {
        Self::json(
            status,
            &serde_json::json!({ "error": error, "message": message }),
        )
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::error(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(target: &str) -> Self {
        Self::error(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("no route for {}", target),
        )
    }
}

/// Wire-level failures; all of them close the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,

    #[error("request body exceeds {MAX_BODY_BYTES} bytes")]
    BodyTooLarge,

    #[error("chunked transfer encoding is not supported")]
    ChunkedUnsupported,
}

/// Try to parse one complete request out of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; on success the consumed
/// bytes are drained from `buf`, leaving any pipelined follow-up request
/// in place.
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<RequestEnvelope>, WireError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Request::new(&mut header_storage);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(WireError::HeadTooLarge);
            }
            return Ok(None);
        }
        Err(e) => return Err(WireError::Malformed(e.to_string())),
    };

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| WireError::Malformed("missing method".into()))?;
    let target = parsed
        .path
        .ok_or_else(|| WireError::Malformed("missing target".into()))?
        .to_string();

    let mut headers = HeaderMap::new();
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| WireError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| WireError::Malformed(e.to_string()))?;
        headers.append(name, value);
    }

    if let Some(te) = headers.get(TRANSFER_ENCODING) {
        if te
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(true)
        {
            return Err(WireError::ChunkedUnsupported);
        }
    }

    let body_len = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| WireError::Malformed("bad content-length".into()))?,
        None => 0,
    };
    if body_len > MAX_BODY_BYTES {
        return Err(WireError::BodyTooLarge);
    }

    if buf.len() < head_len + body_len {
        // Head parsed but the body hasn't fully arrived yet.
        return Ok(None);
    }

    let _head = buf.split_to(head_len);
    let body = buf.split_to(body_len).freeze();

    Ok(Some(RequestEnvelope {
        method,
        target,
        headers,
        body,
    }))
}

/// Serialize a response to raw HTTP/1.1 bytes.
///
/// Content-Length is always emitted from the actual body so the write pump
/// never has to second-guess framing.
pub fn encode_response(response: &ResponseEnvelope) -> Bytes {
    let reason = response.status.canonical_reason().unwrap_or("Unknown");
    let mut out = BytesMut::with_capacity(128 + response.body.len());

    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", response.status.as_u16(), reason).as_bytes(),
    );
    for (name, value) in response.headers.iter() {
        if name == CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", response.body.len()).as_bytes());
    out.extend_from_slice(&response.body);

    out.freeze()
}
