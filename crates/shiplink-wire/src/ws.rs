//! WebSocket transport.
//!
//! SHIP frames travel as binary WebSocket messages under the `ship`
//! subprotocol. The socket is split once and each half gets its own task.
//! The read pump forwards inbound binary messages as
//! [`TransportEvent::Frame`]. The write pump sends queued outbound frames
//! with a deadline and keeps the link alive with pings. A slow consumer of
//! inbound events therefore never stalls outbound traffic. TLS and
//! certificate handling happen before the stream reaches this module.

use crate::transport::{check_frame_size, FrameTransport, TransportEvent};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use shiplink_types::{ShipError, ShipResult, TransportConfig};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use url::Url;

/// WebSocket subprotocol name.
pub const SHIP_SUBPROTOCOL: &str = "ship";

/// Close reasons longer than this do not fit a close frame.
const MAX_CLOSE_REASON: usize = 123;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsStream<S> = SplitStream<WebSocketStream<S>>;

enum Outgoing {
    Frame(Vec<u8>),
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// A [`FrameTransport`] over a WebSocket connection.
pub struct WebSocketTransport {
    outgoing: mpsc::Sender<Outgoing>,
    closed: Arc<AtomicBool>,
    max_frame_size: usize,
    close_grace: Duration,
}

#[derive(Clone, Copy)]
struct PumpSettings {
    ping_interval: Duration,
    pong_timeout: Duration,
    write_timeout: Duration,
}

/// Accept a SHIP WebSocket on an already established stream.
///
/// The client must offer the `ship` subprotocol.
pub async fn accept<S>(
    stream: S,
    config: &TransportConfig,
    close_grace: Duration,
) -> ShipResult<(WebSocketTransport, mpsc::Receiver<TransportEvent>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim() == SHIP_SUBPROTOCOL))
            .unwrap_or(false);
        if !offered {
            let mut error = ErrorResponse::new(Some("ship subprotocol required".to_string()));
            *error.status_mut() = StatusCode::BAD_REQUEST;
            return Err(error);
        }
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SHIP_SUBPROTOCOL),
        );
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(config)),
    )
    .await
    .map_err(|e| ShipError::TransportFailure(format!("WebSocket accept failed: {e}")))?;
    Ok(start(ws, config, close_grace))
}

/// Open a SHIP WebSocket to `url` over an already established stream.
pub async fn connect<S>(
    stream: S,
    url: &Url,
    config: &TransportConfig,
    close_grace: Duration,
) -> ShipResult<(WebSocketTransport, mpsc::Receiver<TransportEvent>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ShipError::UnsupportedFeature(format!(
            "URL scheme {} (expected ws or wss)",
            url.scheme()
        )));
    }
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ShipError::TransportFailure(format!("invalid request for {url}: {e}")))?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(SHIP_SUBPROTOCOL),
    );

    let (ws, _response) =
        tokio_tungstenite::client_async_with_config(request, stream, Some(websocket_config(config)))
            .await
            .map_err(|e| ShipError::TransportFailure(format!("WebSocket connect to {url} failed: {e}")))?;
    Ok(start(ws, config, close_grace))
}

fn websocket_config(config: &TransportConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_frame_size);
    ws_config.max_frame_size = Some(config.max_frame_size);
    ws_config
}

fn start<S>(
    ws: WebSocketStream<S>,
    config: &TransportConfig,
    close_grace: Duration,
) -> (WebSocketTransport, mpsc::Receiver<TransportEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, outgoing_rx) = mpsc::channel(config.channel_capacity);
    let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
    let closed = Arc::new(AtomicBool::new(false));
    let (shutdown, _) = watch::channel(false);
    let shared = Arc::new(PumpShared {
        events: events_tx,
        closed: closed.clone(),
        finished: AtomicBool::new(false),
        shutdown,
        pong: Notify::new(),
    });
    let settings = PumpSettings {
        ping_interval: config.ping_interval(),
        pong_timeout: config.pong_timeout(),
        write_timeout: config.write_timeout(),
    };

    // Subscribe before either half runs so neither can miss the other stopping.
    let read_stop = shared.shutdown.subscribe();
    let write_stop = shared.shutdown.subscribe();
    let (sink, stream) = ws.split();
    tokio::spawn(read_pump(stream, shared.clone(), read_stop));
    tokio::spawn(write_pump(sink, outgoing_rx, shared, settings, write_stop));

    let transport = WebSocketTransport {
        outgoing: outgoing_tx,
        closed,
        max_frame_size: config.max_frame_size,
        close_grace,
    };
    (transport, events_rx)
}

/// State shared by the read and write halves of one socket.
struct PumpShared {
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    finished: AtomicBool,
    shutdown: watch::Sender<bool>,
    pong: Notify,
}

impl PumpShared {
    /// Stop both halves. Only the first caller gets to report `event`.
    async fn finish(&self, event: Option<TransportEvent>) {
        self.closed.store(true, Ordering::SeqCst);
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(event) = event {
            let _ = self.events.send(event).await;
        }
    }
}

/// Forward inbound binary messages. Blocking on a slow consumer here never
/// holds up the writer.
async fn read_pump<S>(
    mut stream: WsStream<S>,
    shared: Arc<PumpShared>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let event = loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => return,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Binary(data))) => {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    sent = shared.events.send(TransportEvent::Frame(data)) => {
                        if sent.is_err() {
                            // Nobody listens any more.
                            shared.finish(None).await;
                            return;
                        }
                    }
                }
            }
            Some(Ok(Message::Pong(_))) => shared.pong.notify_one(),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                debug!(code = ?code, reason = %reason, "SHIP: WebSocket closed by peer");
                break TransportEvent::Closed { code, reason };
            }
            Some(Ok(Message::Text(_))) => {
                warn!("SHIP: ignoring text WebSocket message");
            }
            // Pings are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "SHIP: WebSocket read failed");
                break TransportEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                };
            }
            None => {
                break TransportEvent::Closed {
                    code: None,
                    reason: "WebSocket stream ended".to_string(),
                };
            }
        }
    };
    shared.finish(Some(event)).await;
}

/// Drain the outgoing queue, send keep-alive pings and watch for pongs.
async fn write_pump<S>(
    mut sink: WsSink<S>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    shared: Arc<PumpShared>,
    settings: PumpSettings,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    let mut pong_deadline: Option<Instant> = None;

    let failure = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = timeout(settings.write_timeout, sink.close()).await;
                return;
            }
            out = outgoing.recv() => match out {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(reason) = write(&mut sink, Message::Binary(frame), settings.write_timeout).await {
                        break reason;
                    }
                }
                Some(Outgoing::Close { code, reason, done }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(truncate_reason(reason)),
                    };
                    let _ = write(&mut sink, Message::Close(Some(frame)), settings.write_timeout).await;
                    shared.finish(None).await;
                    let _ = done.send(());
                    return;
                }
                None => {
                    shared.finish(None).await;
                    let _ = timeout(settings.write_timeout, sink.close()).await;
                    return;
                }
            },
            _ = ping.tick() => {
                if write(&mut sink, Message::Ping(Vec::new()), settings.write_timeout).await.is_err() {
                    break "keep-alive ping failed".to_string();
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + settings.pong_timeout);
                }
            }
            _ = shared.pong.notified() => pong_deadline = None,
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                warn!("SHIP: no pong from peer");
                break "pong timeout".to_string();
            }
        }
    };
    shared
        .finish(Some(TransportEvent::Closed {
            code: None,
            reason: failure,
        }))
        .await;
}

async fn write<S>(sink: &mut WsSink<S>, message: Message, limit: Duration) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "SHIP: WebSocket write failed");
            Err(e.to_string())
        }
        Err(_) => {
            warn!("SHIP: WebSocket write timed out");
            Err("write timeout".to_string())
        }
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    fn send_frame(&self, frame: Vec<u8>) -> ShipResult<()> {
        if self.is_closed() {
            return Err(ShipError::TransportFailure("WebSocket closed".into()));
        }
        check_frame_size(&frame, self.max_frame_size)?;
        self.outgoing
            .try_send(Outgoing::Frame(frame))
            .map_err(|e| ShipError::TransportFailure(format!("WebSocket send queue: {e}")))
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done, done_rx) = oneshot::channel();
        let request = Outgoing::Close {
            code,
            reason: reason.to_string(),
            done,
        };
        let closing = async {
            if self.outgoing.send(request).await.is_ok() {
                let _ = done_rx.await;
            }
        };
        if timeout(self.close_grace, closing).await.is_err() {
            debug!(code, "SHIP: WebSocket close did not finish within grace period");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
