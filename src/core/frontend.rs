/// Inbound boundary between a front-end transport and the gateway core
///
/// A transport hands the controller an `InboundRequest` (what to run and a
/// disconnect signal) and a `ResponseSink` (where the reply goes). The core
/// never sees the transport itself.
use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;

/// One request as accepted by a front-end transport
#[derive(Debug)]
pub struct InboundRequest {
    pub id: String,
    /// Operation name as given by the caller, any case
    pub operation: String,
    pub key: Bytes,
    pub args: Vec<Bytes>,
    pub cancel: CancelSignal,
}

impl InboundRequest {
    pub fn new(id: String, operation: impl Into<String>, key: Bytes, args: Vec<Bytes>) -> Self {
        Self {
            id,
            operation: operation.into(),
            key,
            args,
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Resolves once the caller has gone away
pub struct CancelSignal {
    inner: Pin<Box<dyn Future<Output = ()> + Send>>,
    fired: bool,
}

impl CancelSignal {
    pub fn new<F>(disconnected: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Box::pin(disconnected),
            fired: false,
        }
    }

    /// A caller that never disconnects
    pub fn never() -> Self {
        Self::new(std::future::pending())
    }

    /// Wait for the disconnect. Safe to call again after it fired.
    pub async fn cancelled(&mut self) {
        if !self.fired {
            self.inner.as_mut().await;
            self.fired = true;
        }
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("fired", &self.fired)
            .finish()
    }
}

/// Status and content metadata for a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<&'static str>,
    /// Known body length, if any. Composite replies stream without one.
    pub content_length: Option<u64>,
}

impl ResponseHead {
    pub const OCTET_STREAM: &'static str = "application/octet-stream";
    pub const TEXT: &'static str = "text/plain";

    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            content_length: None,
        }
    }

    pub fn content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }
}

/// The caller's output stream.
///
/// `send_head` comes first and at most once; `write` may follow any number
/// of times; then exactly one of `finish` or `abort`. An `Err` from any
/// call means the caller is gone.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send_head(&mut self, head: ResponseHead) -> io::Result<()>;

    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// The response is complete
    async fn finish(&mut self) -> io::Result<()>;

    /// Terminate the response abnormally after part of it was sent,
    /// so the caller can tell it was truncated
    async fn abort(&mut self, error: &GatewayError);
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_cancel_signal_fires_once_and_stays_fired() {
        let (tx, rx) = oneshot::channel::<()>();
        let mut cancel = CancelSignal::new(async move {
            let _ = rx.await;
        });

        let pending = tokio::time::timeout(Duration::from_millis(20), cancel.cancelled()).await;
        assert!(pending.is_err());

        drop(tx);
        cancel.cancelled().await;
        cancel.cancelled().await;
    }

    #[test]
    fn test_never_cancels() {
        let mut cancel = CancelSignal::never();
        let mut waiting = tokio_test::task::spawn(cancel.cancelled());
        tokio_test::assert_pending!(waiting.poll());
        tokio_test::assert_pending!(waiting.poll());
    }

    #[test]
    fn test_response_head_builder() {
        let head = ResponseHead::new(200)
            .content_type(ResponseHead::OCTET_STREAM)
            .content_length(3);
        assert_eq!(head.status, 200);
        assert_eq!(head.content_type, Some("application/octet-stream"));
        assert_eq!(head.content_length, Some(3));
    }
}
