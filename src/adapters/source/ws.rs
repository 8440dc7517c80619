//! WebSocket Quote Gateway - JSON frame protocol over tokio-tungstenite.
//!
//! Client frames: `login`, `subscribe`, `unsubscribe`, `logout`.
//! Server frames: `login` ack, `subscribed` / `unsubscribed` acks,
//! `tick`, `session` events and `error`. One reader task per session
//! dispatches ticks and session events to the registered handler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::ConnectError;
use crate::domain::tick::RawQuote;
use crate::ports::quote_source::{Credentials, QuoteHandler, QuoteSource, SessionEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;
type AckSlot = Arc<Mutex<Option<oneshot::Sender<Result<(), String>>>>>;

/// Frames sent to the gateway.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Login {
        api_key: &'a str,
        secret_key: &'a str,
    },
    Subscribe {
        symbols: &'a [String],
    },
    Unsubscribe {
        symbols: &'a [String],
    },
    Logout,
}

/// Frames received from the gateway.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Login {
        ok: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    Subscribed {
        #[serde(default)]
        ok: Option<bool>,
        #[serde(default)]
        reason: Option<String>,
    },
    Unsubscribed {},
    Tick(TickFrame),
    Session {
        event: SessionFrameEvent,
    },
    Error {
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct TickFrame {
    symbol: String,
    timestamp: Value,
    price: Value,
    volume: Value,
    #[serde(default)]
    sequence: Option<u64>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SessionFrameEvent {
    Disconnected,
    Reconnected,
    Expired,
}

impl From<SessionFrameEvent> for SessionEvent {
    fn from(event: SessionFrameEvent) -> Self {
        match event {
            SessionFrameEvent::Disconnected => Self::Disconnected,
            SessionFrameEvent::Reconnected => Self::Reconnected,
            SessionFrameEvent::Expired => Self::SessionExpired,
        }
    }
}

/// Numbers and strings both become text; the domain parses them.
fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl From<TickFrame> for RawQuote {
    fn from(frame: TickFrame) -> Self {
        Self {
            symbol: frame.symbol,
            timestamp: value_text(frame.timestamp),
            price: value_text(frame.price),
            volume: value_text(frame.volume),
            sequence: frame.sequence,
            attributes: frame.extra,
        }
    }
}

struct Session {
    writer: WsWriter,
    reader: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

/// Quote gateway reached over a JSON WebSocket.
pub struct WsQuoteSource {
    /// Gateway URL.
    url: String,
    /// Wait for login and subscription acknowledgements.
    ack_timeout: Duration,
    /// Callback receiver.
    handler: Arc<RwLock<Option<Arc<dyn QuoteHandler>>>>,
    /// Pending subscribe/unsubscribe acknowledgement.
    pending_ack: AckSlot,
    /// Live session, if any.
    session: tokio::sync::Mutex<Option<Session>>,
}

impl WsQuoteSource {
    /// Create a source for `url`; nothing connects until `connect`.
    pub fn new(url: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            ack_timeout,
            handler: Arc::new(RwLock::new(None)),
            pending_ack: Arc::new(Mutex::new(None)),
            session: tokio::sync::Mutex::new(None),
        }
    }

    async fn send_frame(&self, frame: &ClientFrame<'_>) -> Result<(), ConnectError> {
        let text = serde_json::to_string(frame).map_err(|e| ConnectError::Transport(e.to_string()))?;
        let mut session = self.session.lock().await;
        let session = session.as_mut().ok_or(ConnectError::NotConnected)?;
        session
            .writer
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))
    }

    /// Send a frame and wait for the matching acknowledgement.
    async fn request(&self, frame: &ClientFrame<'_>) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        *self.pending_ack.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.send_frame(frame).await?;

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ConnectError::SubscriptionFailed(reason)),
            Ok(Err(_)) => Err(ConnectError::NotConnected),
            Err(_) => Err(ConnectError::Timeout(self.ack_timeout)),
        }
    }

    async fn close_session(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };
        session.closing.store(true, Ordering::Release);
        if let Ok(text) = serde_json::to_string(&ClientFrame::Logout) {
            let _ = session.writer.send(Message::Text(text)).await;
        }
        let _ = session.writer.close().await;
        session.reader.abort();
    }
}

/// Read frames until the login acknowledgement.
async fn await_login(reader: &mut WsReader) -> Result<(), ConnectError> {
    while let Some(message) = reader.next().await {
        let message = message.map_err(|e| ConnectError::Transport(e.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Login { ok: true, .. }) => return Ok(()),
            Ok(ServerFrame::Login { ok: false, reason }) => {
                return Err(ConnectError::LoginFailed(reason.unwrap_or_else(|| "rejected".to_string())));
            }
            Ok(ServerFrame::Error { reason }) => return Err(ConnectError::LoginFailed(reason)),
            Ok(other) => debug!(frame = ?other, "Frame before login ack ignored"),
            Err(e) => debug!(error = %e, "Unparseable frame before login ack"),
        }
    }
    Err(ConnectError::Transport("stream ended during login".to_string()))
}

/// Session reader: dispatches frames until the stream ends.
async fn read_loop(
    mut reader: WsReader,
    handler: Arc<RwLock<Option<Arc<dyn QuoteHandler>>>>,
    pending_ack: AckSlot,
    closing: Arc<AtomicBool>,
) {
    let current = || handler.read().unwrap_or_else(PoisonError::into_inner).clone();
    let settle = |result: Result<(), String>| {
        if let Some(tx) = pending_ack.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(result);
        }
    };

    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Quote gateway stream error");
                break;
            }
        };

        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Tick(frame)) => {
                if let Some(h) = current() {
                    h.on_tick(frame.into());
                }
            }
            Ok(ServerFrame::Session { event }) => {
                if let Some(h) = current() {
                    h.on_session_event(event.into());
                }
            }
            Ok(ServerFrame::Subscribed { ok, reason }) => {
                if ok.unwrap_or(true) {
                    settle(Ok(()));
                } else {
                    settle(Err(reason.unwrap_or_else(|| "rejected".to_string())));
                }
            }
            Ok(ServerFrame::Unsubscribed {}) => settle(Ok(())),
            Ok(ServerFrame::Error { reason }) => {
                warn!(reason = %reason, "Quote gateway error frame");
                settle(Err(reason));
            }
            Ok(ServerFrame::Login { .. }) => debug!("Late login ack ignored"),
            Err(e) => debug!(error = %e, "Unparseable gateway frame"),
        }
    }

    if !closing.load(Ordering::Acquire) {
        if let Some(h) = current() {
            h.on_session_event(SessionEvent::Disconnected);
        }
    }
    debug!("Quote gateway reader stopped");
}

#[async_trait]
impl QuoteSource for WsQuoteSource {
    fn set_handler(&self, handler: Arc<dyn QuoteHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    #[instrument(skip(self, credentials), fields(url = %self.url))]
    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectError> {
        self.close_session().await;

        let (stream, _) = timeout(self.ack_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| ConnectError::Timeout(self.ack_timeout))?
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let login = serde_json::to_string(&ClientFrame::Login {
            api_key: &credentials.api_key,
            secret_key: &credentials.secret_key,
        })
        .map_err(|e| ConnectError::Transport(e.to_string()))?;
        writer
            .send(Message::Text(login))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        timeout(self.ack_timeout, await_login(&mut reader))
            .await
            .map_err(|_| ConnectError::Timeout(self.ack_timeout))??;

        let closing = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.handler),
            Arc::clone(&self.pending_ack),
            Arc::clone(&closing),
        ));
        *self.session.lock().await = Some(Session {
            writer,
            reader,
            closing,
        });

        info!("Logged in to quote gateway");
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), ConnectError> {
        self.request(&ClientFrame::Subscribe { symbols }).await?;
        info!(?symbols, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), ConnectError> {
        self.request(&ClientFrame::Unsubscribe { symbols }).await
    }

    async fn logout(&self) -> Result<(), ConnectError> {
        self.close_session().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ws_gateway"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_frame_keeps_extra_fields() {
        let text = r#"{"type":"tick","symbol":"TXFR1","timestamp":"2024-03-04 09:00:00.250",
            "price":17350.0,"volume":"3","sequence":7,"high":"17360","tick_type":1}"#;
        let ServerFrame::Tick(frame) = serde_json::from_str(text).unwrap() else {
            panic!("expected tick frame");
        };
        let quote = RawQuote::from(frame);
        assert_eq!(quote.symbol, "TXFR1");
        assert_eq!(quote.price, "17350.0");
        assert_eq!(quote.volume, "3");
        assert_eq!(quote.sequence, Some(7));
        assert_eq!(quote.attributes.get("tick_type"), Some(&serde_json::json!(1)));
        assert!(!quote.attributes.contains_key("type"));
    }

    #[test]
    fn test_session_frame_maps_to_event() {
        let frame: ServerFrame = serde_json::from_str(r#"{"type":"session","event":"expired"}"#).unwrap();
        let ServerFrame::Session { event } = frame else {
            panic!("expected session frame");
        };
        assert_eq!(SessionEvent::from(event), SessionEvent::SessionExpired);
    }

    #[test]
    fn test_client_frames_are_tagged() {
        let symbols = vec!["TXFR1".to_string()];
        let text = serde_json::to_string(&ClientFrame::Subscribe { symbols: &symbols }).unwrap();
        assert_eq!(text, r#"{"op":"subscribe","symbols":["TXFR1"]}"#);
        assert_eq!(serde_json::to_string(&ClientFrame::Logout).unwrap(), r#"{"op":"logout"}"#);
    }

    #[tokio::test]
    async fn test_subscribe_without_session_fails() {
        let source = WsQuoteSource::new("ws://127.0.0.1:1", Duration::from_millis(50));
        let err = source.subscribe(&["TXFR1".to_string()]).await.unwrap_err();
        assert_eq!(err, ConnectError::NotConnected);
        assert!(source.logout().await.is_ok());
    }
}
