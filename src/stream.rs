//! Response-streaming wire format.
//!
//! A streamed response body is `JSON(prelude)`, an 8-zero-byte delimiter,
//! then the raw body chunks. If the handler errors after streaming began,
//! a second delimiter and an in-band trailer
//! (`Lambda-Runtime-Function-Error-Type` / `-Body` lines) are appended.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::errors::{ReportableError, RuntimeErrorKind};

/// Separates the JSON prelude from the body, and the body from the trailer.
pub const DELIMITER: [u8; 8] = [0u8; 8];

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const ERROR_TYPE_TRAILER: &str = "Lambda-Runtime-Function-Error-Type";
const ERROR_BODY_TRAILER: &str = "Lambda-Runtime-Function-Error-Body";

/// Response metadata streamed ahead of the body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Prelude {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub cookies: Vec<String>,
}

impl Default for Prelude {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            cookies: Vec::new(),
        }
    }
}

impl Prelude {
    fn has_content_type(&self) -> bool {
        self.headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"))
    }
}

/// One chunk of a streamed response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Binary(Vec<u8>),
}

impl Chunk {
    fn into_bytes(self) -> Bytes {
        match self {
            Chunk::Text(s) => Bytes::from(s),
            Chunk::Binary(b) => Bytes::from(b),
        }
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<Bytes> for Chunk {
    fn from(value: Bytes) -> Self {
        Self::Binary(value.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Open,
    Ended,
    Errored,
}

/// Writable sink handed to streaming handlers.
///
/// The prelude (with the resolved content type) is emitted lazily before the
/// first chunk. Once `end` or `error` has been called the sink is terminal:
/// writes return `false` and further `error` calls are no-ops.
pub struct ResponseStream {
    tx: Option<mpsc::Sender<Bytes>>,
    content_type: Option<String>,
    prelude: Option<Prelude>,
    prelude_sent: bool,
    state: SinkState,
    bytes_written: u64,
}

impl ResponseStream {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx: Some(tx),
            content_type: None,
            prelude: None,
            prelude_sent: false,
            state: SinkState::Open,
            bytes_written: 0,
        }
    }

    /// Declare the body content type. Settable at most once, and only before
    /// the first chunk.
    pub fn set_content_type(&mut self, content_type: &str) -> Result<(), RuntimeErrorKind> {
        if self.prelude_sent {
            return Err(RuntimeErrorKind::InvalidStreamingOperation(
                "content type cannot change after the first chunk".to_string(),
            ));
        }
        if self.content_type.is_some() {
            return Err(RuntimeErrorKind::InvalidStreamingOperation(
                "content type can only be set once".to_string(),
            ));
        }
        self.content_type = Some(content_type.to_string());
        Ok(())
    }

    /// Override the full prelude (status, headers, cookies). An explicit
    /// `content-type` header here takes precedence over `set_content_type`.
    pub fn set_prelude(&mut self, prelude: Prelude) -> Result<(), RuntimeErrorKind> {
        if self.prelude_sent {
            return Err(RuntimeErrorKind::InvalidStreamingOperation(
                "prelude cannot change after the first chunk".to_string(),
            ));
        }
        if self.prelude.is_some() {
            return Err(RuntimeErrorKind::InvalidStreamingOperation(
                "prelude can only be set once".to_string(),
            ));
        }
        self.prelude = Some(prelude);
        Ok(())
    }

    /// Write one chunk. Returns `false` once the sink is terminal or the
    /// transport side is gone; never panics.
    pub async fn write(&mut self, chunk: impl Into<Chunk>) -> bool {
        if self.state != SinkState::Open {
            return false;
        }
        if !self.prelude_sent && !self.send_prelude().await {
            return false;
        }
        let bytes = chunk.into().into_bytes();
        self.send(bytes).await
    }

    /// Append the error trailer and make the sink terminal. No-op if already
    /// terminal.
    pub async fn error(&mut self, error: &ReportableError) {
        if self.state != SinkState::Open {
            return;
        }
        if !self.prelude_sent {
            self.send_prelude().await;
        }

        let body = serde_json::to_string(error).unwrap_or_else(|_| "{}".to_string());
        let mut trailer = Vec::with_capacity(DELIMITER.len() + body.len() + 96);
        trailer.extend_from_slice(&DELIMITER);
        trailer.extend_from_slice(
            format!("{ERROR_TYPE_TRAILER}:{}\n", error.error_type).as_bytes(),
        );
        trailer.extend_from_slice(format!("{ERROR_BODY_TRAILER}:{body}\n").as_bytes());
        self.send(Bytes::from(trailer)).await;

        self.state = SinkState::Errored;
        self.tx = None;
    }

    /// Stop accepting input and close the body. Returns `false` if the sink
    /// was already terminal.
    pub async fn end(&mut self) -> bool {
        if self.state != SinkState::Open {
            return false;
        }
        if !self.prelude_sent {
            self.send_prelude().await;
        }
        self.state = SinkState::Ended;
        self.tx = None;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state != SinkState::Open
    }

    pub fn is_errored(&self) -> bool {
        self.state == SinkState::Errored
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn resolved_prelude(&mut self) -> Prelude {
        let mut prelude = self.prelude.take().unwrap_or_default();
        if !prelude.has_content_type() {
            let content_type = self
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            prelude
                .headers
                .insert("content-type".to_string(), content_type);
        }
        prelude
    }

    async fn send_prelude(&mut self) -> bool {
        let prelude = self.resolved_prelude();
        // Locks the content type and prelude even if the transport is gone.
        self.prelude_sent = true;

        let mut head = serde_json::to_vec(&prelude).unwrap_or_else(|_| b"{}".to_vec());
        head.extend_from_slice(&DELIMITER);
        self.send(Bytes::from(head)).await
    }

    async fn send(&mut self, bytes: Bytes) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let len = bytes.len() as u64;
        if tx.send(bytes).await.is_err() {
            self.tx = None;
            return false;
        }
        self.bytes_written += len;
        true
    }
}
