/// Upstream request lifecycle
///
/// `UpstreamController::process` drives one inbound request through
/// routing, leasing, sending, streaming the reply and following redirects.
/// Every exit path either releases the lease or drops it, and a dropped
/// lease closes its connection, so cancellation cannot leak connections.
pub mod topology;

pub use topology::TopologyRefresher;

use crate::config::UpstreamConfig;
use crate::core::{
    ClusterNode, InboundRequest, Lease, LeasePool, NodeId, ResponseHead, ResponseSink,
};
use crate::error::{ErrorSeverity, GatewayError, GatewayResult};
use crate::redis::resp::RespError;
use crate::redis::{
    Emit, FeedStatus, RedirectParser, RedirectType, ReplyDecoder, ReplyHead, ReplyKind,
    RequestEncoder, SlotRouter,
};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle states of one upstream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Init,
    Routing,
    Connecting,
    Sending,
    Receiving,
    Redirecting,
    Done,
    Aborted,
}

impl UpstreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpstreamState::Done | UpstreamState::Aborted)
    }
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpstreamState::Init => "INIT",
            UpstreamState::Routing => "ROUTING",
            UpstreamState::Connecting => "CONNECTING",
            UpstreamState::Sending => "SENDING",
            UpstreamState::Receiving => "RECEIVING",
            UpstreamState::Redirecting => "REDIRECTING",
            UpstreamState::Done => "DONE",
            UpstreamState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Timeouts and limits the controller applies per request
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub send_timeout: Duration,
    pub read_timeout: Duration,
    pub max_redirects: u8,
}

impl From<&UpstreamConfig> for UpstreamSettings {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            read_timeout: config.read_timeout(),
            max_redirects: config.max_redirects,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self::from(&UpstreamConfig::default())
    }
}

/// Per-request state, owned by exactly one `process` call
#[derive(Debug)]
pub struct RequestContext {
    pub id: String,
    pub key: Bytes,
    pub slot: u16,
    state: UpstreamState,
    target: Option<Arc<ClusterNode>>,
    /// Table entry the current target came from, for MOVED compare-and-set
    owner: Option<NodeId>,
    asking: bool,
    redirects: u8,
    output_started: bool,
    decoder: ReplyDecoder,
}

impl RequestContext {
    fn new(id: String, key: Bytes) -> Self {
        Self {
            id,
            key,
            slot: 0,
            state: UpstreamState::Init,
            target: None,
            owner: None,
            asking: false,
            redirects: 0,
            output_started: false,
            decoder: ReplyDecoder::new(),
        }
    }

    fn transition(&mut self, next: UpstreamState) {
        debug_assert!(
            !self.state.is_terminal(),
            "transition {} -> {} after the request ended",
            self.state,
            next
        );
        debug!(request_id = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn redirects(&self) -> u8 {
        self.redirects
    }

    pub fn output_started(&self) -> bool {
        self.output_started
    }
}

/// What a finished request looked like
#[derive(Debug, Clone)]
pub struct Completed {
    pub node: String,
    pub slot: u16,
    pub redirects: u8,
}

/// Drives requests from routing to a delivered response
#[derive(Debug)]
pub struct UpstreamController {
    router: Arc<SlotRouter>,
    pool: Arc<LeasePool>,
    settings: UpstreamSettings,
}

impl UpstreamController {
    pub fn new(router: Arc<SlotRouter>, pool: Arc<LeasePool>, settings: UpstreamSettings) -> Self {
        Self {
            router,
            pool,
            settings,
        }
    }

    pub fn router(&self) -> &Arc<SlotRouter> {
        &self.router
    }

    pub fn pool(&self) -> &Arc<LeasePool> {
        &self.pool
    }

    /// Run one request to completion or abort.
    ///
    /// On abort the caller gets a gateway error response, or an abnormal
    /// termination if part of the reply was already written. A disconnect
    /// signalled by the request stops all work immediately.
    pub async fn process(
        &self,
        request: InboundRequest,
        sink: &mut dyn ResponseSink,
    ) -> GatewayResult<Completed> {
        let InboundRequest {
            id,
            operation,
            key,
            args,
            mut cancel,
        } = request;
        let mut ctx = RequestContext::new(id, key);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = self.run(&mut ctx, &operation, &args, &mut *sink) => result,
        };

        match result {
            Ok(()) => {
                ctx.transition(UpstreamState::Done);
                let node = ctx
                    .target
                    .as_ref()
                    .map(|n| n.addr.clone())
                    .unwrap_or_default();
                Ok(Completed {
                    node,
                    slot: ctx.slot,
                    redirects: ctx.redirects,
                })
            }
            Err(e) => {
                ctx.transition(UpstreamState::Aborted);
                self.abort(&ctx, &e, sink).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        operation: &str,
        args: &[Bytes],
        sink: &mut dyn ResponseSink,
    ) -> GatewayResult<()> {
        // Encode up front: a malformed request never touches a connection
        let request = RequestEncoder::encode(operation, &ctx.key, args)?;
        debug!(
            request_id = %ctx.id,
            operation = request.operation.name,
            readonly = request.operation.readonly,
            "Encoded request"
        );

        ctx.transition(UpstreamState::Routing);
        let route = self.router.route(&ctx.key)?;
        ctx.slot = route.slot;
        ctx.owner = route.owner;
        let mut target = route.node;

        loop {
            ctx.target = Some(Arc::clone(&target));

            ctx.transition(UpstreamState::Connecting);
            let mut lease = self.pool.lease(&target).await?;

            ctx.transition(UpstreamState::Sending);
            let frame = if ctx.asking {
                let asking = RedirectParser::asking_frame();
                let mut buf = BytesMut::with_capacity(asking.len() + request.frame.len());
                buf.extend_from_slice(&asking);
                buf.extend_from_slice(&request.frame);
                buf.freeze()
            } else {
                request.frame.clone()
            };
            if let Err(e) = lease.conn().send(&frame, self.settings.send_timeout).await {
                lease.release(false);
                return Err(e);
            }

            ctx.transition(UpstreamState::Receiving);
            let redirect = match self.receive(ctx, &mut lease, sink).await {
                Ok(redirect) => {
                    lease.release(true);
                    redirect
                }
                Err(e) => {
                    lease.release(!e.discards_connection());
                    return Err(e);
                }
            };

            let Some(redirect) = redirect else {
                return Ok(());
            };

            ctx.transition(UpstreamState::Redirecting);
            ctx.redirects = ctx.redirects.saturating_add(1);
            if ctx.redirects > self.settings.max_redirects {
                return Err(GatewayError::TooManyRedirects {
                    hops: self.settings.max_redirects,
                });
            }
            debug!(
                request_id = %ctx.id,
                slot = redirect.slot(),
                node = %redirect.address(),
                hop = ctx.redirects,
                "{} redirect",
                redirect.kind()
            );

            ctx.transition(UpstreamState::Routing);
            target = self.router.apply_redirect(&redirect, ctx.owner)?;
            match redirect {
                RedirectType::Ask { .. } => ctx.asking = true,
                RedirectType::Moved { .. } => {
                    ctx.asking = false;
                    ctx.owner = Some(target.id);
                }
            }
        }
    }

    /// Read the reply off `lease`, streaming it into `sink`.
    ///
    /// Returns the redirect to follow, if the node answered with one.
    async fn receive(
        &self,
        ctx: &mut RequestContext,
        lease: &mut Lease,
        sink: &mut dyn ResponseSink,
    ) -> GatewayResult<Option<RedirectType>> {
        ctx.decoder = ReplyDecoder::new();
        let mut asking = ctx.asking.then(ReplyDecoder::new);

        loop {
            let mut chunk = lease
                .conn()
                .recv(self.settings.read_timeout)
                .await?
                .freeze();

            // The ASKING acknowledgement precedes the real reply
            if let Some(decoder) = asking.as_mut() {
                let feed = decoder.feed(&chunk)?;
                match feed.status {
                    FeedStatus::NeedMore => continue,
                    FeedStatus::Complete => {
                        asking = None;
                        chunk = chunk.slice(feed.consumed..);
                        if chunk.is_empty() {
                            continue;
                        }
                    }
                    other => {
                        return Err(GatewayError::desync(format!(
                            "unexpected reply to ASKING: {:?}",
                            other
                        )))
                    }
                }
            }

            let feed = ctx.decoder.feed(&chunk)?;
            let wrote = !feed.emitted.is_empty();
            for item in feed.emitted {
                Self::emit(ctx, item, sink).await?;
            }
            if wrote {
                sink.flush().await.map_err(|_| GatewayError::Cancelled)?;
            }

            if feed.status != FeedStatus::NeedMore && feed.consumed != chunk.len() {
                return Err(RespError::TrailingData(chunk.len() - feed.consumed).into());
            }

            match feed.status {
                FeedStatus::NeedMore => continue,
                FeedStatus::Complete => {
                    sink.finish().await.map_err(|_| GatewayError::Cancelled)?;
                    lease.conn().touch();
                    return Ok(None);
                }
                FeedStatus::Redirect(redirect) => return Ok(Some(redirect)),
                FeedStatus::Error(message) => {
                    debug!(request_id = %ctx.id, "Backend error reply: {}", message);
                    let body = Bytes::from(message);
                    let head = ResponseHead::new(500)
                        .content_type(ResponseHead::TEXT)
                        .content_length(body.len() as u64);
                    Self::emit_head(ctx, head, sink).await?;
                    sink.write(body).await.map_err(|_| GatewayError::Cancelled)?;
                    sink.finish().await.map_err(|_| GatewayError::Cancelled)?;
                    return Ok(None);
                }
            }
        }
    }

    async fn emit(
        ctx: &mut RequestContext,
        item: Emit,
        sink: &mut dyn ResponseSink,
    ) -> GatewayResult<()> {
        match item {
            Emit::Head(head) => Self::emit_head(ctx, response_head(&head), sink).await,
            Emit::Body(bytes) if bytes.is_empty() => Ok(()),
            Emit::Body(bytes) => sink.write(bytes).await.map_err(|_| GatewayError::Cancelled),
        }
    }

    async fn emit_head(
        ctx: &mut RequestContext,
        head: ResponseHead,
        sink: &mut dyn ResponseSink,
    ) -> GatewayResult<()> {
        ctx.output_started = true;
        sink.send_head(head)
            .await
            .map_err(|_| GatewayError::Cancelled)
    }

    /// Report an aborted request to the caller and the log
    async fn abort(&self, ctx: &RequestContext, e: &GatewayError, sink: &mut dyn ResponseSink) {
        let node = ctx
            .target
            .as_ref()
            .map(|n| n.addr.as_str())
            .unwrap_or("-");
        let recoverable = e.is_recoverable();
        match e.severity() {
            ErrorSeverity::Critical | ErrorSeverity::Error => {
                error!(request_id = %ctx.id, slot = ctx.slot, node, recoverable, "Request aborted: {}", e)
            }
            ErrorSeverity::Warning => {
                warn!(request_id = %ctx.id, slot = ctx.slot, node, recoverable, "Request aborted: {}", e)
            }
            ErrorSeverity::Info => {
                info!(request_id = %ctx.id, slot = ctx.slot, node, recoverable, "Request aborted: {}", e)
            }
        }

        if matches!(e, GatewayError::Cancelled) {
            return;
        }

        if ctx.output_started {
            sink.abort(e).await;
            return;
        }

        let body = Bytes::from(e.to_string());
        let head = ResponseHead::new(e.status_code())
            .content_type(ResponseHead::TEXT)
            .content_length(body.len() as u64);
        // The caller may already be gone; nothing more to do then
        if sink.send_head(head).await.is_ok() && sink.write(body).await.is_ok() {
            let _ = sink.finish().await;
        }
    }
}

/// Response head for a reply's top-level shape
pub fn response_head(reply: &ReplyHead) -> ResponseHead {
    match reply.kind {
        ReplyKind::Bulk => {
            let head = ResponseHead::new(200).content_type(ResponseHead::OCTET_STREAM);
            match reply.content_length {
                Some(len) => head.content_length(len),
                None => head,
            }
        }
        ReplyKind::Status | ReplyKind::Integer => {
            let head = ResponseHead::new(200).content_type(ResponseHead::TEXT);
            match reply.content_length {
                Some(len) => head.content_length(len),
                None => head,
            }
        }
        ReplyKind::Array => ResponseHead::new(200).content_type(ResponseHead::TEXT),
        ReplyKind::Nil => ResponseHead::new(404).content_length(0),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use crate::redis::{Emit, FeedStatus, ReplyDecoder};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// How a scripted node answers one request
    pub enum Reply {
        Now(Vec<u8>),
        After(Duration, Vec<u8>),
        /// Write the bytes, then close the connection
        Partial(Vec<u8>),
        Hang,
    }

    impl Reply {
        pub fn now(bytes: &[u8]) -> Self {
            Reply::Now(bytes.to_vec())
        }
    }

    /// A scripted cluster node
    pub struct MockNode {
        pub addr: String,
        hits: Arc<AtomicUsize>,
    }

    impl MockNode {
        /// Requests arrive joined with `\n`, e.g. `"GET\nfoo\n"`
        pub async fn start<F>(respond: F) -> Self
        where
            F: Fn(&str) -> Reply + Send + Sync + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let hits = Arc::new(AtomicUsize::new(0));
            let respond = Arc::new(respond);

            let counter = Arc::clone(&hits);
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let respond = Arc::clone(&respond);
                    let hits = Arc::clone(&counter);
                    tokio::spawn(async move {
                        let mut decoder = ReplyDecoder::new();
                        let mut request = Vec::new();
                        let mut buf = vec![0u8; 4096];
                        loop {
                            let n = match stream.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            };
                            let mut chunk = Bytes::copy_from_slice(&buf[..n]);
                            while !chunk.is_empty() {
                                let Ok(feed) = decoder.feed(&chunk) else { return };
                                for item in feed.emitted {
                                    if let Emit::Body(b) = item {
                                        request.extend_from_slice(&b);
                                    }
                                }
                                chunk = chunk.slice(feed.consumed..);
                                if feed.status != FeedStatus::Complete {
                                    continue;
                                }

                                hits.fetch_add(1, Ordering::SeqCst);
                                let text = String::from_utf8_lossy(&request).into_owned();
                                request.clear();
                                decoder = ReplyDecoder::new();

                                let bytes = match respond(&text) {
                                    Reply::Now(bytes) => bytes,
                                    Reply::After(delay, bytes) => {
                                        tokio::time::sleep(delay).await;
                                        bytes
                                    }
                                    Reply::Partial(bytes) => {
                                        let _ = stream.write_all(&bytes).await;
                                        return;
                                    }
                                    Reply::Hang => {
                                        tokio::time::sleep(Duration::from_secs(30)).await;
                                        return;
                                    }
                                };
                                if stream.write_all(&bytes).await.is_err() {
                                    return;
                                }
                            }
                        }
                    });
                }
            });

            Self { addr, hits }
        }

        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }
}
