//! Request driver: write a request, read the head, stream the body
//!
//! The head is fully buffered and validated before any body byte is handed
//! out; the body is then decoded incrementally and every decoded piece goes to
//! the caller immediately.

use bytes::{Buf, Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::FragmentSender;
use crate::error::{BridgeError, Result};
use crate::http::{BodyDecoder, HttpRequest, ResponseHead};
use crate::metrics::BRIDGE_METRICS;
use crate::net::Connector;

/// Fresh connections allowed after the first attempt, when the server hung up early
pub const MAX_RECONNECTS: usize = 1;

const READ_BUFFER_SIZE: usize = 8192;

/// What a completed drive delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveSummary {
    pub status: u16,
    pub fragments: usize,
    pub bytes: u64,
}

/// A response whose head has been read and whose body is still on the wire
pub struct Response<T> {
    pub head: ResponseHead,
    pub body: ResponseBody<T>,
}

/// Incrementally decoded response body; owns the transport
pub struct ResponseBody<T> {
    transport: T,
    buf: BytesMut,
    decoder: BodyDecoder,
}

impl<T> ResponseBody<T>
where
    T: AsyncRead + Unpin,
{
    /// Next piece of payload, or `None` when the body is complete
    pub async fn next_fragment(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(piece) = self.decoder.decode(&mut self.buf)? {
                if piece.is_empty() {
                    continue;
                }
                return Ok(Some(piece));
            }
            if self.decoder.is_done() {
                return Ok(None);
            }

            let n = self
                .transport
                .read_buf(&mut self.buf)
                .await
                .or_else(|e| match e.kind() {
                    // peers commonly skip TLS close_notify on close-delimited bodies
                    ErrorKind::UnexpectedEof => Ok(0),
                    _ => Err(BridgeError::Protocol(format!("body read failed: {}", e))),
                })?;
            if n == 0 {
                self.decoder.on_eof()?;
            }
        }
    }

    /// Read the remaining body into one buffer
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(piece) = self.next_fragment().await? {
            body.extend_from_slice(&piece);
        }
        Ok(body.freeze())
    }

    /// Give the transport back, e.g. to reuse a keep-alive connection
    pub fn into_transport(self) -> T {
        self.transport
    }
}

/// Write `request` and read the response head.
///
/// Interim `1xx` heads (other than `101`) are skipped. A peer that closes
/// before sending a single byte of response yields
/// [`BridgeError::ServerClosed`]; every other failure is a protocol error.
pub async fn send_request<T>(mut transport: T, request: &HttpRequest) -> Result<Response<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let encoded = request.encode();
    transport
        .write_all(&encoded)
        .await
        .map_err(|e| BridgeError::Protocol(format!("write failed: {}", e)))?;
    transport
        .flush()
        .await
        .map_err(|e| BridgeError::Protocol(format!("write failed: {}", e)))?;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut interim_seen = false;
    let (head, used) = loop {
        if let Some((head, used)) = ResponseHead::parse(&buf)? {
            if !head.is_interim() {
                break (head, used);
            }
            debug!(status = head.status, reason = %head.reason, "skipping interim response");
            interim_seen = true;
            buf.advance(used);
            continue;
        }

        let n = match transport.read_buf(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && buf.is_empty() => 0,
            Err(e) => return Err(BridgeError::Protocol(format!("head read failed: {}", e))),
        };
        if n == 0 {
            if buf.is_empty() && !interim_seen {
                info!(host = %request.host, "server closed the connection before responding");
                return Err(BridgeError::ServerClosed);
            }
            return Err(BridgeError::Protocol(
                "connection closed in the middle of the response head".to_string(),
            ));
        }
    };

    buf.advance(used);
    let decoder = BodyDecoder::for_head(&head);
    debug!(status = head.status, reason = %head.reason, chunked = head.is_chunked(), "response head");

    Ok(Response {
        head,
        body: ResponseBody {
            transport,
            buf,
            decoder,
        },
    })
}

/// Drive one request over an established transport.
///
/// Validates the status against `expected_status` before touching the body,
/// then calls `on_fragment` for every decoded piece in arrival order.
pub async fn drive<T, F>(
    transport: T,
    request: &HttpRequest,
    expected_status: u16,
    on_fragment: F,
) -> Result<DriveSummary>
where
    T: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Bytes),
{
    drive_inspecting(transport, request, expected_status, |_| {}, on_fragment).await
}

/// Like [`drive`], but lets the caller look at the response head first
pub async fn drive_inspecting<T, H, F>(
    transport: T,
    request: &HttpRequest,
    expected_status: u16,
    on_head: H,
    on_fragment: F,
) -> Result<DriveSummary>
where
    T: AsyncRead + AsyncWrite + Unpin,
    H: FnOnce(&ResponseHead),
    F: FnMut(Bytes),
{
    let response = send_request(transport, request).await?;
    on_head(&response.head);
    pump_body(response, expected_status, on_fragment).await
}

async fn pump_body<T, F>(
    response: Response<T>,
    expected_status: u16,
    mut on_fragment: F,
) -> Result<DriveSummary>
where
    T: AsyncRead + Unpin,
    F: FnMut(Bytes),
{
    pump(response, expected_status, |piece| {
        on_fragment(piece);
        std::future::ready(true)
    })
    .await
}

/// Check the status, then hand body pieces to `sink` until the body ends or
/// the sink refuses a piece
async fn pump<T, S, Fut>(
    response: Response<T>,
    expected_status: u16,
    mut sink: S,
) -> Result<DriveSummary>
where
    T: AsyncRead + Unpin,
    S: FnMut(Bytes) -> Fut,
    Fut: Future<Output = bool>,
{
    let Response { head, mut body } = response;
    if let Err(e) = head.expect_status(expected_status) {
        error!(status = head.status, reason = %head.reason, "unexpected http status");
        return Err(e);
    }

    let mut summary = DriveSummary {
        status: head.status,
        ..Default::default()
    };
    while let Some(piece) = body.next_fragment().await? {
        let len = piece.len();
        if !sink(piece).await {
            debug!("consumer went away, abandoning response body");
            break;
        }
        summary.fragments += 1;
        summary.bytes += len as u64;
        BRIDGE_METRICS.record_fragment(len);
    }
    Ok(summary)
}

/// Connect and send, opening exactly one fresh connection if the first peer
/// hung up before responding. A second early hang-up is returned as-is.
pub async fn open_with_reconnect<C>(
    connector: &C,
    request: &HttpRequest,
) -> Result<Response<C::Transport>>
where
    C: Connector,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let transport = connector.connect().await?;
        match send_request(transport, request).await {
            Err(e) if e.is_retryable() && attempt <= MAX_RECONNECTS => {
                warn!(attempt, path = %request.path, "server closed before responding, reconnecting");
                BRIDGE_METRICS.record_reconnect();
            }
            result => return result,
        }
    }
}

/// [`drive`] with connection establishment and the one-shot reconnect
pub async fn drive_with_reconnect<C, F>(
    connector: &C,
    request: &HttpRequest,
    expected_status: u16,
    on_fragment: F,
) -> Result<DriveSummary>
where
    C: Connector,
    F: FnMut(Bytes),
{
    let response = open_with_reconnect(connector, request).await?;
    pump_body(response, expected_status, on_fragment).await
}

/// Buffered response returned by [`fetch_response`]
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send a request and buffer the whole response, whatever its status
pub async fn fetch_response<C>(connector: &C, request: &HttpRequest) -> Result<HttpResponse>
where
    C: Connector,
{
    let Response { head, body } = open_with_reconnect(connector, request).await?;
    let body = body.collect().await?;
    Ok(HttpResponse { head, body })
}

/// Drive a request and forward everything into a channel.
///
/// Fragments are sent with backpressure. Any failure becomes a single terminal
/// error item. The channel is closed on every exit path. If the consumer goes
/// away mid-stream, the remaining body is abandoned.
pub async fn stream_to_channel<C>(
    connector: &C,
    request: &HttpRequest,
    expected_status: u16,
    mut sender: FragmentSender,
) where
    C: Connector,
{
    let request_id = Uuid::new_v4();
    let result = forward(connector, request, expected_status, &sender).await;

    match result {
        Ok(summary) => debug!(
            %request_id,
            fragments = summary.fragments,
            bytes = summary.bytes,
            "stream finished"
        ),
        Err(e) => {
            error!(%request_id, host = %request.host, path = %request.path, error = %e, "stream failed");
            sender.send_error(e).await;
        }
    }
    sender.close();
}

async fn forward<C>(
    connector: &C,
    request: &HttpRequest,
    expected_status: u16,
    sender: &FragmentSender,
) -> Result<DriveSummary>
where
    C: Connector,
{
    let response = open_with_reconnect(connector, request).await?;
    pump(response, expected_status, |piece| sender.send_fragment(piece)).await
}
