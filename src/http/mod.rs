/// HTTP front end.
///
/// Maps HTTP requests onto [`InboundRequest`]s and streams the controller's
/// output back through a channel-backed [`ResponseSink`]:
///
/// - `GET /{key}` runs `GET key`
/// - `GET|POST|PUT|DELETE /cmd/{operation}/{key}[/{arg}...]` runs any
///   supported operation; a non-empty POST/PUT body becomes the last argument
///
/// Each request runs in its own task. The response head is returned as soon
/// as the controller produces it and the body follows through a bounded
/// channel, so a slow client applies backpressure to the backend read.
/// Dropping the response (client gone) closes the channel, which is the
/// request's cancellation signal.
use crate::core::{CancelSignal, InboundRequest, ResponseHead, ResponseSink};
use crate::error::GatewayError;
use crate::upstream::UpstreamController;
use crate::utils::generate_id;
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use axum::{
    body::{Body, Bytes},
    extract::{OriginalUri, Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Body chunks buffered between the controller and hyper
const BODY_CHANNEL_CAPACITY: usize = 16;

type BodyItem = Result<Bytes, io::Error>;

#[derive(Clone)]
struct HttpState {
    controller: Arc<UpstreamController>,
    enabled: bool,
}

/// Build the axum router. With `enabled` false every request gets 204.
pub fn router(controller: Arc<UpstreamController>, enabled: bool) -> Router {
    let state = HttpState {
        controller,
        enabled,
    };

    Router::new()
        .route("/{key}", get(get_key))
        .route(
            "/cmd/{operation}/{*rest}",
            get(command).post(command).put(command).delete(command),
        )
        .fallback(fallback)
        .with_state(state)
}

async fn get_key(State(state): State<HttpState>, Path(key): Path<String>) -> Response {
    dispatch(state, "GET".to_string(), Bytes::from(key), Vec::new()).await
}

/// Split `/cmd/{operation}/{key}/{arg}...` on the raw path, then decode each
/// segment, so an encoded `/` stays inside its key or argument
fn command_parts(path: &str) -> Option<(String, Bytes, Vec<Bytes>)> {
    let mut segments = path
        .strip_prefix("/cmd/")?
        .split('/')
        .map(|segment| Bytes::from(percent_decode_str(segment).collect::<Vec<u8>>()));

    let operation = String::from_utf8(segments.next()?.to_vec()).ok()?;
    let key = segments.next()?;
    Some((operation, key, segments.collect()))
}

async fn command(
    State(state): State<HttpState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Response {
    let Some((operation, key, mut args)) = command_parts(uri.path()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if (method == Method::POST || method == Method::PUT) && !body.is_empty() {
        args.push(body);
    }

    dispatch(state, operation, key, args).await
}

async fn fallback(State(state): State<HttpState>) -> Response {
    if state.enabled {
        StatusCode::NOT_FOUND.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn dispatch(state: HttpState, operation: String, key: Bytes, args: Vec<Bytes>) -> Response {
    if !state.enabled {
        return StatusCode::NO_CONTENT.into_response();
    }

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel::<BodyItem>(BODY_CHANNEL_CAPACITY);

    let watcher = body_tx.clone();
    let request = InboundRequest::new(generate_id("req"), operation, key, args)
        .with_cancel(CancelSignal::new(async move { watcher.closed().await }));
    let request_id = request.id.clone();

    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move {
        let mut sink = HttpSink {
            head: Some(head_tx),
            body: body_tx,
        };
        match controller.process(request, &mut sink).await {
            Ok(done) => debug!(
                request_id = %request_id,
                node = %done.node,
                slot = done.slot,
                redirects = done.redirects,
                "Request completed"
            ),
            Err(e) => debug!(request_id = %request_id, "Request aborted: {}", e),
        }
    });

    // Holding body_rx here keeps the request alive until the head arrives;
    // if the client goes away first this future is dropped along with it.
    let head = match head_rx.await {
        Ok(head) => head,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let stream = futures::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    let mut builder = Response::builder().status(head.status);
    if let Some(content_type) = head.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(length) = head.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Hands the head to the waiting handler and the body to hyper
struct HttpSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::Sender<BodyItem>,
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

#[async_trait]
impl ResponseSink for HttpSink {
    async fn send_head(&mut self, head: ResponseHead) -> io::Result<()> {
        let tx = self
            .head
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "response head already sent"))?;
        tx.send(head).map_err(|_| client_gone())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.body.send(Ok(chunk)).await.map_err(|_| client_gone())
    }

    async fn finish(&mut self) -> io::Result<()> {
        // The stream ends once the sink and the cancel watcher are dropped
        Ok(())
    }

    async fn abort(&mut self, error: &GatewayError) {
        // A body error makes hyper cut the connection instead of ending the
        // response cleanly
        let _ = self
            .body
            .send(Err(io::Error::new(io::ErrorKind::Other, error.to_string())))
            .await;
    }
}
