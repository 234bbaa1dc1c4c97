//! Injected handler values.
//!
//! Discovering and loading user code is the embedder's concern; the runtime
//! consumes a ready [`Handler`] tagged as buffered or streaming, optionally
//! carrying a preferred high-water mark for the response stream.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::completion::Completion;
use crate::invocation::Context;
use crate::stream::ResponseStream;

/// A handler whose entire result is reported at once. The returned value and
/// the explicit `completion` calls race into the same completion cell; the
/// first one wins.
#[async_trait]
pub trait BufferedHandler: Send + Sync {
    async fn invoke(
        &self,
        payload: Bytes,
        ctx: Context,
        completion: Completion,
    ) -> anyhow::Result<Value>;
}

/// A handler that writes its result incrementally to a [`ResponseStream`].
/// An `Err` return is written to the stream, not bubbled to the loop.
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    async fn invoke(
        &self,
        payload: Bytes,
        stream: &mut ResponseStream,
        ctx: Context,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Buffered,
    Streaming,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Buffered => "buffered",
            Mode::Streaming => "streaming",
        }
    }
}

/// The dispatchable handler value. The mode is fixed at construction, once
/// per process.
#[derive(Clone)]
pub enum Handler {
    Buffered {
        handler: Arc<dyn BufferedHandler>,
        high_water_mark: Option<usize>,
    },
    Streaming {
        handler: Arc<dyn StreamingHandler>,
        high_water_mark: Option<usize>,
    },
}

impl Handler {
    pub fn buffered(handler: impl BufferedHandler + 'static) -> Self {
        Self::Buffered {
            handler: Arc::new(handler),
            high_water_mark: None,
        }
    }

    pub fn streaming(handler: impl StreamingHandler + 'static) -> Self {
        Self::Streaming {
            handler: Arc::new(handler),
            high_water_mark: None,
        }
    }

    /// Preferred streaming channel capacity; overrides the environment
    /// default.
    pub fn with_high_water_mark(mut self, hwm: usize) -> Self {
        match &mut self {
            Self::Buffered { high_water_mark, .. } | Self::Streaming { high_water_mark, .. } => {
                *high_water_mark = Some(hwm);
            }
        }
        self
    }

    pub fn mode(&self) -> Mode {
        match self {
            Self::Buffered { .. } => Mode::Buffered,
            Self::Streaming { .. } => Mode::Streaming,
        }
    }

    pub fn high_water_mark(&self) -> Option<usize> {
        match self {
            Self::Buffered { high_water_mark, .. } | Self::Streaming { high_water_mark, .. } => {
                *high_water_mark
            }
        }
    }
}

/// Wrap a plain async function as a buffered handler.
pub fn buffered_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Bytes, Context, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> BufferedHandler for FnHandler<F>
    where
        F: Fn(Bytes, Context, Completion) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        async fn invoke(
            &self,
            payload: Bytes,
            ctx: Context,
            completion: Completion,
        ) -> anyhow::Result<Value> {
            (self.0)(payload, ctx, completion).await
        }
    }

    Handler::Buffered {
        handler: Arc::new(FnHandler(f)),
        high_water_mark: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_and_high_water_mark_round_trip() {
        let handler = buffered_fn(|_payload, _ctx, _completion| async { Ok(json!(null)) });
        assert_eq!(handler.mode(), Mode::Buffered);
        assert_eq!(handler.high_water_mark(), None);

        let handler = handler.with_high_water_mark(64);
        assert_eq!(handler.high_water_mark(), Some(64));
        assert_eq!(handler.mode().as_str(), "buffered");
    }
}
