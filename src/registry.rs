//! Backend registry access
//!
//! The registry is an etcd cluster. Backends register themselves as
//! `<prefix><name> = <address>` keys; this module only reads and watches
//! them. The [`Registry`] trait is the seam the rest of the crate talks to,
//! [`EtcdClient`] is the production implementation over etcd's v3 JSON
//! gateway (`/v3/kv/range`, `/v3/watch`, `/v3/maintenance/status`).

use crate::error::RegistryError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Position in the registry's change history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub i64);

impl Revision {
    /// The first position after this one
    pub fn next(self) -> Revision {
        Revision(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Every entry under a prefix, read at one revision
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Key created or updated
    Put,
    /// Key removed (lease expiry included)
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
}

/// A group of changes delivered together by the watch stream
#[derive(Debug, Clone)]
pub struct WatchBatch {
    /// Latest position covered by this batch
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Change stream handed out by [`Registry::watch`]. Ends when the registry
/// closes it; an `Err` item means the stream is unusable.
pub type WatchStream = BoxStream<'static, Result<WatchBatch, RegistryError>>;

/// Read/watch capability over the registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Liveness probe
    async fn status(&self) -> Result<(), RegistryError>;

    /// Read every key under `prefix`
    async fn snapshot(&self, prefix: &str) -> Result<Snapshot, RegistryError>;

    /// Stream changes under `prefix` starting at `start` (inclusive)
    async fn watch(&self, prefix: &str, start: Revision) -> Result<WatchStream, RegistryError>;
}

/// Run a registry call with a deadline
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RegistryError>
where
    F: Future<Output = Result<T, RegistryError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Timeout(limit)),
    }
}

/// etcd client speaking the v3 JSON gateway
#[derive(Debug, Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    endpoint: reqwest::Url,
}

impl EtcdClient {
    /// Build a client for `endpoint`. No request is made here; the dial
    /// timeout bounds the TCP connect of every later call.
    pub fn connect(endpoint: &str, dial_timeout: Duration) -> Result<Self, RegistryError> {
        let url = reqwest::Url::parse(endpoint).map_err(|e| RegistryError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RegistryError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let http = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint: url,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, RegistryError> {
        let url = self
            .endpoint
            .join(path)
            .map_err(|e| RegistryError::InvalidEndpoint {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Registry for EtcdClient {
    async fn status(&self) -> Result<(), RegistryError> {
        let response = self
            .post("/v3/maintenance/status", &serde_json::json!({}))
            .await?;
        let status: StatusResponse = decode_json(&response.bytes().await?)?;
        debug!(version = %status.version, "Registry status probe succeeded");
        Ok(())
    }

    async fn snapshot(&self, prefix: &str) -> Result<Snapshot, RegistryError> {
        let body = serde_json::json!({
            "key": STANDARD.encode(prefix.as_bytes()),
            "range_end": STANDARD.encode(prefix_range_end(prefix.as_bytes())),
        });
        let response = self.post("/v3/kv/range", &body).await?;
        decode_range(&response.bytes().await?)
    }

    async fn watch(&self, prefix: &str, start: Revision) -> Result<WatchStream, RegistryError> {
        let body = serde_json::json!({
            "create_request": {
                "key": STANDARD.encode(prefix.as_bytes()),
                "range_end": STANDARD.encode(prefix_range_end(prefix.as_bytes())),
                "start_revision": start.0.to_string(),
            }
        });
        let response = self.post("/v3/watch", &body).await?;
        debug!(start_revision = %start, "Watch stream opened");

        let lines = ndjson_lines(response.bytes_stream());
        let batches = lines.filter_map(move |line| async move {
            match line {
                Ok(line) => decode_watch_message(&line, start).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(batches.boxed())
    }
}

/// End of the key range covering every key that starts with `prefix`
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Prefix of all 0xff bytes (or empty): read to the end of the keyspace
    vec![0]
}

/// Split a chunked byte stream into newline-delimited messages
fn ndjson_lines<S, B, E>(bytes: S) -> BoxStream<'static, Result<Vec<u8>, RegistryError>>
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<RegistryError> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buffer: Vec<u8>,
        // Bytes of `buffer` already known to hold no newline
        scanned: usize,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        scanned: 0,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            let unscanned = &state.buffer[state.scanned..];
            if let Some(offset) = unscanned.iter().position(|b| *b == b'\n') {
                let pos = state.scanned + offset;
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                state.scanned = 0;
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((Ok(line), state));
            }

            state.scanned = state.buffer.len();

            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    state.scanned = 0;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    if state.buffer.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let line = std::mem::take(&mut state.buffer);
                    state.scanned = 0;
                    return Some((Ok(line), state));
                }
            }
        }
    })
    .boxed()
}

// --- Gateway wire format ---
//
// The gateway renders proto3 JSON: snake_case field names, int64 as strings,
// bytes as base64, zero values omitted.

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "de_i64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    header: Option<ResponseHeader>,
    #[serde(default)]
    kvs: Vec<WireKeyValue>,
}

#[derive(Debug, Deserialize)]
struct WireKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    mod_revision: i64,
}

#[derive(Debug, Deserialize)]
struct WatchEnvelope {
    result: Option<WireWatchResponse>,
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct WireWatchResponse {
    header: Option<ResponseHeader>,
    #[serde(default)]
    created: bool,
    #[serde(default)]
    canceled: bool,
    #[serde(default, deserialize_with = "de_i64")]
    compact_revision: i64,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default, rename = "type")]
    kind: WireEventType,
    kv: Option<WireKeyValue>,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
enum WireEventType {
    #[default]
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    http_code: u16,
    #[serde(default)]
    message: String,
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn decode_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, RegistryError> {
    serde_json::from_slice(body).map_err(|e| RegistryError::Decode(e.to_string()))
}

fn decode_b64(field: &str, encoded: &str) -> Result<String, RegistryError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| RegistryError::Decode(format!("{} is not valid base64: {}", field, e)))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn decode_kv(kv: &WireKeyValue) -> Result<KeyValue, RegistryError> {
    Ok(KeyValue {
        key: decode_b64("key", &kv.key)?,
        value: decode_b64("value", &kv.value)?,
    })
}

/// Decode a `/v3/kv/range` response body
pub(crate) fn decode_range(body: &[u8]) -> Result<Snapshot, RegistryError> {
    let range: RangeResponse = decode_json(body)?;
    let revision = range
        .header
        .map(|h| Revision(h.revision))
        .ok_or_else(|| RegistryError::Decode("range response without header".to_string()))?;
    let kvs = range.kvs.iter().map(decode_kv).collect::<Result<Vec<_>, _>>()?;
    Ok(Snapshot { revision, kvs })
}

/// Decode one message of a `/v3/watch` stream
///
/// Creation and progress notifications carry no events and yield `None`.
pub(crate) fn decode_watch_message(
    line: &[u8],
    requested: Revision,
) -> Result<Option<WatchBatch>, RegistryError> {
    let envelope: WatchEnvelope = decode_json(line)?;

    if let Some(error) = envelope.error {
        return Err(RegistryError::Status {
            status: error.http_code,
            message: error.message,
        });
    }

    let Some(result) = envelope.result else {
        return Err(RegistryError::Decode(
            "watch message without result".to_string(),
        ));
    };

    if result.compact_revision > 0 {
        return Err(RegistryError::Compacted {
            requested: requested.0,
            compact_revision: result.compact_revision,
        });
    }
    if result.canceled {
        return Err(RegistryError::Cancelled(result.cancel_reason));
    }
    if result.created || result.events.is_empty() {
        return Ok(None);
    }

    let mut latest = 0;
    let mut events = Vec::with_capacity(result.events.len());
    for event in &result.events {
        let kv = event
            .kv
            .as_ref()
            .ok_or_else(|| RegistryError::Decode("watch event without kv".to_string()))?;
        latest = latest.max(kv.mod_revision);
        let decoded = decode_kv(kv)?;
        events.push(WatchEvent {
            kind: match event.kind {
                WireEventType::Put => EventKind::Put,
                WireEventType::Delete => EventKind::Delete,
            },
            key: decoded.key,
            value: decoded.value,
        });
    }

    if latest == 0 {
        latest = result.header.map(|h| h.revision).unwrap_or(0);
    }

    Ok(Some(WatchBatch {
        revision: Revision(latest),
        events,
    }))
}
