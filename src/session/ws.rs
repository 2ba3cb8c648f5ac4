//! WebSocket session transport
//!
//! Protocol:
//! - client → server: one JSON `init` text message, then binary PCM16LE audio frames
//! - server → client: `{"type":"ready"}` or `{"type":"error","message":..}` during
//!   the handshake, then binary media frames whose first byte tags the sink
//!   (`0x01` video, `0x02` audio), and optionally `{"type":"stop"}`

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::targets::{ResolvedTargets, SinkKind};
use super::transport::{AvatarSession, SessionFactory};
use super::types::SessionEvent;
use crate::config::SessionConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Media frame tag for video
pub const TAG_VIDEO: u8 = 0x01;
/// Media frame tag for audio
pub const TAG_AUDIO: u8 = 0x02;

/// How long `close` waits for the connection task to say goodbye
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init {
        api_key: String,
        face_id: String,
        handle_silence: bool,
        max_session_length: u64,
        max_idle_time: u64,
        client_id: Uuid,
    },
}

impl ClientMessage {
    pub fn init(config: &SessionConfig, client_id: Uuid) -> Self {
        ClientMessage::Init {
            api_key: config.api_key.clone(),
            face_id: config.face_id.clone(),
            handle_silence: config.handle_silence,
            max_session_length: config.max_session_length_secs,
            max_idle_time: config.max_idle_time_secs,
            client_id,
        }
    }
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready {
        #[serde(default)]
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Split a tagged media frame into its sink and payload
pub fn parse_media_frame(data: Bytes) -> Option<(SinkKind, Bytes)> {
    let kind = match data.first()? {
        &TAG_VIDEO => SinkKind::Video,
        &TAG_AUDIO => SinkKind::Audio,
        _ => return None,
    };
    Some((kind, data.slice(1..)))
}

/// How the connection task ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// Never got to `ready`
    Failed(String),
    /// Ended after `ready`
    Disconnected(String),
    /// Closed locally
    Closed,
}

/// Factory for [`WsSession`]
#[derive(Debug, Default, Clone, Copy)]
pub struct WsSessionFactory;

impl SessionFactory for WsSessionFactory {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn create(
        &self,
        config: &SessionConfig,
        targets: ResolvedTargets,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn AvatarSession>> {
        config.validate()?;
        Ok(Arc::new(WsSession::new(config.clone(), targets, events)))
    }
}

/// Avatar session over a WebSocket
pub struct WsSession {
    config: SessionConfig,
    client_id: Uuid,
    targets: ResolvedTargets,
    events: mpsc::UnboundedSender<SessionEvent>,
    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsSession {
    pub fn new(
        config: SessionConfig,
        targets: ResolvedTargets,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(config.audio_queue_frames.max(1));

        Self {
            config,
            client_id: Uuid::new_v4(),
            targets,
            events,
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AvatarSession for WsSession {
    async fn start(&self) -> Result<()> {
        let audio_rx = self
            .audio_rx
            .lock()
            .take()
            .ok_or_else(|| AppError::SessionError("Session already started".to_string()))?;

        let connection = Connection {
            config: self.config.clone(),
            client_id: self.client_id,
            targets: self.targets.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            throttler: LogThrottler::default(),
        };

        let handle = tokio::spawn(async move {
            let outcome = connection.run(audio_rx).await;
            connection.report(outcome);
        });

        *self.task.lock() = Some(handle);
        debug!("WebSocket session {} started", self.client_id);
        Ok(())
    }

    fn send_audio(&self, pcm: Bytes) -> Result<()> {
        self.audio_tx.try_send(pcm).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AppError::TransportError("Audio queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => AppError::NotConnected,
        })
    }

    async fn close(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!("WebSocket session task did not stop in time, aborting");
                abort.abort();
            }
            info!("WebSocket session {} closed", self.client_id);
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the connection task
struct Connection {
    config: SessionConfig,
    client_id: Uuid,
    targets: ResolvedTargets,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    throttler: LogThrottler,
}

impl Connection {
    async fn run(&self, mut audio_rx: mpsc::Receiver<Bytes>) -> Outcome {
        let ws = match self.connect_with_retry().await {
            Ok(Some(ws)) => ws,
            Ok(None) => return Outcome::Closed,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        let (mut writer, mut reader) = ws.split();

        let init = ClientMessage::init(&self.config, self.client_id);
        let text = match serde_json::to_string(&init) {
            Ok(text) => text,
            Err(e) => return Outcome::Failed(format!("Failed to encode init message: {}", e)),
        };
        if let Err(e) = writer.send(Message::Text(text)).await {
            return Outcome::Failed(format!("Failed to send init message: {}", e));
        }

        // Handshake: wait for ready or error
        let handshake_deadline = Instant::now() + self.config.handshake_timeout();
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Outcome::Closed;
                }
                _ = tokio::time::sleep_until(handshake_deadline) => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Outcome::Failed(format!(
                        "Timed out waiting for session ready after {} ms",
                        self.config.handshake_timeout_ms
                    ));
                }
                msg = reader.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Ready { session_id }) => {
                        info!(
                            "Avatar session ready (session {})",
                            session_id.as_deref().unwrap_or("unknown")
                        );
                        break;
                    }
                    Ok(ServerMessage::Error { message }) => return Outcome::Failed(message),
                    Ok(ServerMessage::Stop { reason }) => {
                        return Outcome::Failed(
                            reason.unwrap_or_else(|| "Session stopped by server".to_string()),
                        )
                    }
                    Err(e) => debug!("Ignoring unexpected handshake message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    return Outcome::Failed(close_reason(frame, "Server closed during handshake"))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Outcome::Failed(format!("Handshake read error: {}", e)),
                None => return Outcome::Failed("Connection closed during handshake".to_string()),
            }
        }

        if self.events.send(SessionEvent::Connected).is_err() {
            debug!("Session owner went away during handshake");
            let _ = writer.send(Message::Close(None)).await;
            return Outcome::Closed;
        }

        let session_deadline = deadline(self.config.max_session_length());
        let idle_time = self.config.max_idle_time();
        let mut idle_deadline = deadline(idle_time);

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Outcome::Closed,
                _ = sleep_until(session_deadline) => {
                    break Outcome::Disconnected("Maximum session length reached".to_string());
                }
                _ = sleep_until(idle_deadline) => {
                    break Outcome::Disconnected("Maximum idle time reached".to_string());
                }
                pcm = audio_rx.recv() => match pcm {
                    Some(pcm) => {
                        trace!("Sending {} bytes of audio", pcm.len());
                        if let Err(e) = writer.send(Message::Binary(pcm.to_vec())).await {
                            break Outcome::Disconnected(format!("Audio send failed: {}", e));
                        }
                        idle_deadline = deadline(idle_time);
                    }
                    None => break Outcome::Closed,
                },
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => self.route_media(Bytes::from(data)),
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Stop { reason }) => {
                            break Outcome::Disconnected(
                                reason.unwrap_or_else(|| "Session stopped by server".to_string()),
                            );
                        }
                        Ok(ServerMessage::Error { message }) => break Outcome::Disconnected(message),
                        Ok(ServerMessage::Ready { .. }) => debug!("Duplicate ready message ignored"),
                        Err(e) => debug!("Ignoring unexpected server message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break Outcome::Disconnected(close_reason(frame, "Server closed the session"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Outcome::Disconnected(format!("Read error: {}", e)),
                    None => break Outcome::Disconnected("Connection closed".to_string()),
                },
            }
        };

        if let Err(e) = writer.send(Message::Close(None)).await {
            debug!("Close frame not sent: {}", e);
        }
        outcome
    }

    /// Turn the outcome into the final notification; local closes are silent
    fn report(&self, outcome: Outcome) {
        let event = match outcome {
            Outcome::Failed(reason) => {
                warn!("Avatar session failed: {}", reason);
                SessionEvent::Failed { reason }
            }
            Outcome::Disconnected(reason) => {
                info!("Avatar session disconnected: {}", reason);
                SessionEvent::Disconnected { reason }
            }
            Outcome::Closed => return,
        };
        // The receiver is gone once the manager has closed
        let _ = self.events.send(event);
    }

    /// Connect, retrying `max_retry_attempts` times; `None` if cancelled
    async fn connect_with_retry(&self) -> Result<Option<WsStream>> {
        let attempts = self.config.max_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(
                "Connecting to {} (attempt {}/{})",
                self.config.url, attempt, attempts
            );

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                result = connect_async(self.config.url.as_str()) => result,
            };

            match result {
                Ok((ws, _)) => return Ok(Some(ws)),
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.config.retry_delay()) => {}
                }
            }
        }

        Err(match last_error {
            Some(e) => AppError::from(e),
            None => AppError::TransportError("No connection attempt made".to_string()),
        })
    }

    fn route_media(&self, data: Bytes) {
        match parse_media_frame(data) {
            Some((kind, payload)) => self.targets.sink(kind).render(payload),
            None => {
                if let Some(suppressed) = self.throttler.check("unknown_media_tag") {
                    debug!(
                        "Dropping media frame with unknown tag ({} similar suppressed)",
                        suppressed
                    );
                }
            }
        }
    }
}

fn deadline(after: Option<Duration>) -> Option<Instant> {
    after.map(|d| Instant::now() + d)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn close_reason(
    frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame<'static>>,
    fallback: &str,
) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => {
            format!("{} ({}: {})", fallback, u16::from(frame.code), frame.reason)
        }
        Some(frame) => format!("{} ({})", fallback, u16::from(frame.code)),
        None => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::targets::{LoggingSink, RenderTargets};
    use std::future::Future;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    type ServerWs = WebSocketStream<TcpStream>;

    fn config(url: String) -> SessionConfig {
        SessionConfig {
            url,
            api_key: "test-key".to_string(),
            face_id: "face-1".to_string(),
            max_retry_attempts: 2,
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    fn targets() -> (ResolvedTargets, Arc<LoggingSink>, Arc<LoggingSink>) {
        let video = Arc::new(LoggingSink::new(SinkKind::Video));
        let audio = Arc::new(LoggingSink::new(SinkKind::Audio));
        let targets = RenderTargets::new();
        targets.attach_video(video.clone());
        targets.attach_audio(audio.clone());
        (targets.resolve().unwrap(), video, audio)
    }

    /// Accept one WebSocket client and hand it to `handler`
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{}", addr)
    }

    async fn read_init(ws: &mut ServerWs) -> ClientMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected init message, got {:?}", other),
            }
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    fn ready() -> Message {
        Message::Text(r#"{"type":"ready","session_id":"s-1"}"#.to_string())
    }

    #[test]
    fn test_client_message_format() {
        let mut config = config("ws://localhost".to_string());
        config.max_idle_time_secs = 30;
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ClientMessage::init(&config, id)).unwrap();

        assert_eq!(json["type"], "init");
        assert_eq!(json["api_key"], "test-key");
        assert_eq!(json["face_id"], "face-1");
        assert_eq!(json["handle_silence"], true);
        assert_eq!(json["max_idle_time"], 30);
        assert_eq!(json["client_id"], id.to_string());
    }

    #[test]
    fn test_server_message_parsing() {
        assert_eq!(
            serde_json::from_str::<ServerMessage>(r#"{"type":"ready"}"#).unwrap(),
            ServerMessage::Ready { session_id: None }
        );
        assert_eq!(
            serde_json::from_str::<ServerMessage>(r#"{"type":"error","message":"bad key"}"#)
                .unwrap(),
            ServerMessage::Error {
                message: "bad key".to_string()
            }
        );
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn test_parse_media_frame() {
        let (kind, payload) = parse_media_frame(Bytes::from_static(&[TAG_VIDEO, 1, 2])).unwrap();
        assert_eq!(kind, SinkKind::Video);
        assert_eq!(&payload[..], &[1, 2]);

        let (kind, payload) = parse_media_frame(Bytes::from_static(&[TAG_AUDIO])).unwrap();
        assert_eq!(kind, SinkKind::Audio);
        assert!(payload.is_empty());

        assert!(parse_media_frame(Bytes::from_static(&[0x7f, 1])).is_none());
        assert!(parse_media_frame(Bytes::new()).is_none());
    }

    #[tokio::test]
    async fn test_session_streams_audio_and_routes_media() {
        let (audio_seen_tx, audio_seen_rx) = oneshot::channel::<Vec<u8>>();

        let url = serve_once(move |mut ws| async move {
            let init = read_init(&mut ws).await;
            assert!(matches!(init, ClientMessage::Init { ref face_id, .. } if face_id == "face-1"));

            ws.send(ready()).await.unwrap();
            ws.send(Message::Binary(vec![TAG_VIDEO, 9, 9, 9])).await.unwrap();
            ws.send(Message::Binary(vec![TAG_AUDIO, 7])).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    let _ = audio_seen_tx.send(data);
                    break;
                }
            }
            let _ = ws.close(None).await;
        })
        .await;

        let (targets, video, audio) = targets();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = WsSessionFactory
            .create(&config(url), targets, events_tx)
            .unwrap();

        session.start().await.unwrap();
        assert_eq!(next_event(&mut events_rx).await, SessionEvent::Connected);

        session.send_audio(Bytes::from_static(&[1, 2, 3, 4])).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), audio_seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec![1, 2, 3, 4]);

        assert!(matches!(
            next_event(&mut events_rx).await,
            SessionEvent::Disconnected { .. }
        ));
        assert_eq!(video.frames(), 1);
        assert_eq!(video.bytes(), 3);
        assert_eq!(audio.frames(), 1);

        session.close().await;
    }

    #[tokio::test]
    async fn test_server_error_fails_session() {
        let url = serve_once(|mut ws| async move {
            read_init(&mut ws).await;
            ws.send(Message::Text(
                r#"{"type":"error","message":"invalid api key"}"#.to_string(),
            ))
            .await
            .unwrap();
        })
        .await;

        let (targets, _, _) = targets();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = WsSessionFactory
            .create(&config(url), targets, events_tx)
            .unwrap();
        session.start().await.unwrap();

        assert_eq!(
            next_event(&mut events_rx).await,
            SessionEvent::Failed {
                reason: "invalid api key".to_string()
            }
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let url = serve_once(|mut ws| async move {
            read_init(&mut ws).await;
            // Never answers; keep the socket open until the client gives up
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut config = config(url);
        config.handshake_timeout_ms = 100;

        let (targets, _, _) = targets();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = WsSessionFactory.create(&config, targets, events_tx).unwrap();
        session.start().await.unwrap();

        match next_event(&mut events_rx).await {
            SessionEvent::Failed { reason } => assert!(reason.contains("Timed out")),
            other => panic!("expected handshake failure, got {:?}", other),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (targets, _, _) = targets();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = WsSessionFactory
            .create(&config(format!("ws://{}", addr)), targets, events_tx)
            .unwrap();
        session.start().await.unwrap();

        assert!(matches!(
            next_event(&mut events_rx).await,
            SessionEvent::Failed { .. }
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_idle_timeout_disconnects() {
        let url = serve_once(|mut ws| async move {
            read_init(&mut ws).await;
            ws.send(ready()).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut config = config(url);
        config.max_idle_time_secs = 1;

        let (targets, _, _) = targets();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = WsSessionFactory.create(&config, targets, events_tx).unwrap();
        session.start().await.unwrap();

        assert_eq!(next_event(&mut events_rx).await, SessionEvent::Connected);
        match next_event(&mut events_rx).await {
            SessionEvent::Disconnected { reason } => assert!(reason.contains("idle")),
            other => panic!("expected disconnect, got {:?}", other),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_local_close_is_silent() {
        let url = serve_once(|mut ws| async move {
            read_init(&mut ws).await;
            ws.send(ready()).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (targets, _, _) = targets();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = WsSessionFactory
            .create(&config(url), targets, events_tx)
            .unwrap();
        session.start().await.unwrap();
        assert_eq!(next_event(&mut events_rx).await, SessionEvent::Connected);

        session.close().await;
        session.close().await;
        assert!(events_rx.try_recv().is_err());
        assert!(matches!(
            session.send_audio(Bytes::from_static(&[0, 0])),
            Err(AppError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_chunk() {
        let mut config = config("ws://127.0.0.1:9".to_string());
        config.audio_queue_frames = 1;
        let (targets, _, _) = targets();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = WsSession::new(config, targets, events_tx);

        tokio_test::assert_ok!(session.send_audio(Bytes::from_static(&[1, 0])));
        assert!(matches!(
            session.send_audio(Bytes::from_static(&[2, 0])),
            Err(AppError::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let (targets, _, _) = targets();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = WsSession::new(config("ws://127.0.0.1:9".to_string()), targets, events_tx);

        session.start().await.unwrap();
        assert!(session.start().await.is_err());
        session.close().await;
    }
}
