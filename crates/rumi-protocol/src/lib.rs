// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Newline-delimited JSON wire framing shared by the Egress and Capability
//! brokers (§4.5, §4.6). Each broker listens on a per-Pack Unix domain
//! socket; the transport is one JSON object per line in, one JSON object
//! per line out, matching the `JsonlCodec` convention this workspace already
//! uses for sidecar/child-process communication rather than introducing a
//! second, heavier HTTP-server stack for an internal single-tenant-per-socket
//! IPC surface.

use std::collections::BTreeMap;

use rumi_error::{ErrorKind, RumiError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Errors arising from JSONL encoding/decoding or framing-level violations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// JSON serialization or deserialization failure.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before a complete message arrived.
    #[error("connection closed before a complete message was received")]
    ConnectionClosed,
}

impl From<ProtocolError> for RumiError {
    fn from(err: ProtocolError) -> Self {
        RumiError::new(ErrorKind::SchemaInvalid, err.to_string())
    }
}

/// Stateless codec for encoding/decoding any `Serialize + DeserializeOwned`
/// message as a single newline-delimited JSON line.
#[derive(Debug, Clone, Copy)]
pub struct JsonlCodec;

impl JsonlCodec {
    /// Serialize `msg` to a newline-terminated JSON string.
    pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
        let mut s = serde_json::to_string(msg)?;
        s.push('\n');
        Ok(s)
    }

    /// Deserialize a single JSON line (without its trailing newline) into `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Write a single framed JSON message to `writer` and flush.
pub async fn write_framed<T: Serialize>(
    writer: &mut (impl AsyncWrite + Unpin),
    msg: &T,
) -> Result<(), ProtocolError> {
    let line = JsonlCodec::encode(msg)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a single framed JSON message from `reader`.
///
/// Blank lines are skipped. Returns `Ok(None)` on a clean EOF before any
/// non-blank line is read.
pub async fn read_framed<T, R>(reader: &mut BufReader<R>) -> Result<Option<T>, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(JsonlCodec::decode(trimmed)?));
    }
}

// ---------------------------------------------------------------------------
// EgressBroker wire types (§4.5)
// ---------------------------------------------------------------------------

/// HTTP methods the Egress broker will forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `HEAD`
    Head,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `PATCH`
    Patch,
}

impl HttpMethod {
    /// The method name as used by `reqwest::Method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// A single request a Pack's block code wants forwarded through the
/// Egress broker, read as one JSON line off its per-Pack socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Target URL; scheme must be `http` or `https`.
    pub url: String,
    /// Request headers. Limited to 64 entries of at most 8 KiB each.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body bytes, if any. Limited to 1 MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    /// Request timeout in milliseconds; must be at most 120_000.
    pub timeout_ms: u64,
}

/// The Egress broker's reply to a [`BrokerRequest`], written back as one
/// JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerResponse {
    /// `true` if the request was allowed and executed.
    pub allowed: bool,
    /// Upstream HTTP status code, present only when `allowed` is true and
    /// the request completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response headers, present only on success.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body bytes, present only on success. Limited to 4 MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    /// Denial or failure reason, present only when `allowed` is false or the
    /// upstream call itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl BrokerResponse {
    /// Build a denial response carrying the given reason.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            status: None,
            headers: BTreeMap::new(),
            body: None,
            rejection_reason: Some(reason.into()),
        }
    }

    /// Build a successful response.
    pub fn ok(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            allowed: true,
            status: Some(status),
            headers,
            body: Some(body),
            rejection_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityBroker wire types (§4.6)
// ---------------------------------------------------------------------------

/// A capability invocation request read off a Pack's Capability socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// The permission the caller wants dispatched.
    pub permission_id: String,
    /// Arguments passed to the handler entrypoint.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The Capability broker's reply to a [`CapabilityRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// `true` if the grant existed and the handler ran.
    pub allowed: bool,
    /// Handler return value, present only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Denial or failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// BlockExecutor I/O envelope (§4.4)
// ---------------------------------------------------------------------------

/// The single JSON document written to a block container's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInput {
    /// Step-provided input data, already variable-substituted.
    pub input_data: serde_json::Value,
    /// Execution context visible to the block.
    pub exec_context: BlockExecContext,
}

/// Execution context fields accompanying a block invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExecContext {
    /// Flow id the invoking step belongs to.
    pub flow_id: String,
    /// Step id that triggered this invocation.
    pub step_id: String,
    /// Phase the step ran in.
    pub phase: String,
    /// Timestamp of invocation (RFC 3339).
    pub ts: String,
    /// Pack id that owns the block; always the authoritative principal.
    pub owner_pack: String,
}

/// The single JSON document read from a block container's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOutput {
    /// The block's return value.
    pub output_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_codec_roundtrip() {
        let req = BrokerRequest {
            method: HttpMethod::Post,
            url: "https://api.example.com/x".into(),
            headers: BTreeMap::new(),
            body: Some(b"hello".to_vec()),
            timeout_ms: 5_000,
        };
        let line = JsonlCodec::encode(&req).unwrap();
        assert!(line.ends_with('\n'));
        let decoded: BrokerRequest = JsonlCodec::decode(line.trim()).unwrap();
        assert_eq!(decoded.url, req.url);
        assert_eq!(decoded.body, req.body);
    }

    #[test]
    fn http_method_as_str() {
        assert_eq!(HttpMethod::Get.as_str(), "GET");
        assert_eq!(HttpMethod::Patch.as_str(), "PATCH");
    }

    #[test]
    fn broker_response_denied_has_no_status() {
        let r = BrokerResponse::denied("domain not allowlisted");
        assert!(!r.allowed);
        assert!(r.status.is_none());
        assert_eq!(r.rejection_reason.as_deref(), Some("domain not allowlisted"));
    }

    #[tokio::test]
    async fn write_then_read_framed_roundtrip() {
        let (mut w, r) = tokio::io::duplex(4096);
        let resp = BrokerResponse::ok(200, BTreeMap::new(), b"ok".to_vec());
        write_framed(&mut w, &resp).await.unwrap();
        drop(w);

        let mut reader = BufReader::new(r);
        let decoded: BrokerResponse = read_framed(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.status, Some(200));
        assert_eq!(decoded.body, Some(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn read_framed_skips_blank_lines() {
        let (mut w, r) = tokio::io::duplex(4096);
        w.write_all(b"\n   \n").await.unwrap();
        let req = CapabilityRequest {
            permission_id: "fs.read".into(),
            args: serde_json::json!({}),
        };
        write_framed(&mut w, &req).await.unwrap();
        drop(w);

        let mut reader = BufReader::new(r);
        let decoded: CapabilityRequest = read_framed(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.permission_id, "fs.read");
    }

    #[tokio::test]
    async fn read_framed_returns_none_on_clean_eof() {
        let (w, r) = tokio::io::duplex(64);
        drop(w);
        let mut reader = BufReader::new(r);
        let decoded: Option<CapabilityRequest> = read_framed(&mut reader).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn read_framed_invalid_json_errors() {
        let (mut w, r) = tokio::io::duplex(64);
        w.write_all(b"not json\n").await.unwrap();
        drop(w);
        let mut reader = BufReader::new(r);
        let result: Result<Option<CapabilityRequest>, ProtocolError> = read_framed(&mut reader).await;
        assert!(result.is_err());
    }

    #[test]
    fn block_input_serializes_with_exec_context() {
        let input = BlockInput {
            input_data: serde_json::json!({"x": 1}),
            exec_context: BlockExecContext {
                flow_id: "demo".into(),
                step_id: "s1".into(),
                phase: "generate".into(),
                ts: "2026-07-27T00:00:00Z".into(),
                owner_pack: "demo".into(),
            },
        };
        let line = JsonlCodec::encode(&input).unwrap();
        assert!(line.contains("owner_pack"));
    }
}
