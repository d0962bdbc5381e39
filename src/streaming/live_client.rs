//! Gemini Live API WebSocket client
//!
//! # Connection Flow
//!
//! 1. `open()` - Establish WebSocket with the API key header
//! 2. Send `setup`, wait for `setupComplete`
//! 3. Spawn a reader task (server messages -> [`TransportEvent`]) and a
//!    writer task (captured chunks -> `realtimeInput`)
//! 4. `close()` / drop - cancel both tasks; the writer sends a close frame
//!
//! No retries: a failed handshake is returned to the caller as-is.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
};
use tokio_util::sync::CancellationToken;

use super::persona::LiveSetup;
use super::protocol::{ClientMessage, ServerMessage, LIVE_API_URL};
use super::TransportError;
use crate::audio::AudioChunk;
use crate::settings::VoiceSettings;

/// Capacity of the inbound event queue
const INBOUND_CAPACITY: usize = 256;

/// What the transport reports to the session, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// Remote closed the connection
    Closed { reason: String },
    /// Socket failed
    Error { message: String },
}

/// An open live session, independent of the underlying socket.
///
/// Dropping the connection (or calling [`close`](Self::close)) stops the
/// background tasks.
pub struct LiveConnection {
    outbound: mpsc::Sender<AudioChunk>,
    inbound: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
}

impl LiveConnection {
    pub fn new(
        outbound: mpsc::Sender<AudioChunk>,
        inbound: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
        }
    }

    /// Queue for captured audio; hand this to the outbound link.
    pub fn outbound(&self) -> mpsc::Sender<AudioChunk> {
        self.outbound.clone()
    }

    /// Next inbound event. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    pub fn close(&mut self) {
        if !self.cancel.is_cancelled() {
            log::info!("Closing live connection");
            self.cancel.cancel();
        }
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens live connections for a session.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        api_key: String,
        setup: LiveSetup,
    ) -> BoxFuture<'static, Result<LiveConnection, TransportError>>;
}

/// Connector for the real Gemini Live endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
    connect_timeout: Duration,
    setup_timeout: Duration,
    queue_capacity: usize,
}

impl Default for GeminiConnector {
    fn default() -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(5),
            queue_capacity: 32,
        }
    }
}

impl GeminiConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            setup_timeout: Duration::from_secs(settings.setup_timeout_secs.max(1)),
            queue_capacity: settings.outbound_queue_capacity.max(1),
        }
    }

    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(self, api_key: String, setup: LiveSetup) -> Result<LiveConnection, TransportError> {
        // Both ring and aws-lc may be compiled in; pick one before the first TLS handshake
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        request.headers_mut().insert(
            "x-goog-api-key",
            HeaderValue::from_str(&api_key)
                .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?,
        );

        log::info!("Connecting to Gemini Live API ({})...", setup.model);

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(map_connect_error)?;

        log::info!("WebSocket connected, sending setup...");

        let (mut write, mut read) = ws_stream.split();

        let setup_json = serde_json::to_string(&ClientMessage::setup(&setup))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        timeout(self.setup_timeout, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if parse_server_message(text.as_bytes()).is_some_and(|m| m.is_setup_complete()) {
                            return Ok(());
                        }
                        log::debug!("Ignoring message while waiting for setupComplete");
                    }
                    Ok(Message::Binary(bytes)) => {
                        if parse_server_message(&bytes).is_some_and(|m| m.is_setup_complete()) {
                            return Ok(());
                        }
                        log::debug!("Ignoring message while waiting for setupComplete");
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("{} ({})", f.reason, f.code))
                            .unwrap_or_else(|| "closed during setup".to_string());
                        return Err(TransportError::Rejected(reason));
                    }
                    Err(e) => return Err(TransportError::ProtocolError(e.to_string())),
                    _ => {} // Ignore ping/pong
                }
            }
            Err(TransportError::Disconnected("Stream ended during setup".to_string()))
        })
        .await
        .map_err(|_| TransportError::ConnectionFailed("Session setup timeout".to_string()))??;

        log::info!("Live session ready");

        let cancel = CancellationToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<AudioChunk>(self.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);

        let reader_cancel = cancel.clone();
        let reader_tx = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = read.next() => next,
                };

                let event = match next {
                    Some(Ok(Message::Text(text))) => match parse_server_message(text.as_bytes()) {
                        Some(msg) => TransportEvent::Message(msg),
                        None => continue,
                    },
                    Some(Ok(Message::Binary(bytes))) => match parse_server_message(&bytes) {
                        Some(msg) => TransportEvent::Message(msg),
                        None => continue,
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        log::info!("WebSocket closed by server: {}", reason);
                        let _ = reader_tx.send(TransportEvent::Closed { reason }).await;
                        break;
                    }
                    Some(Ok(_)) => continue, // ping/pong
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        let _ = reader_tx
                            .send(TransportEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                    None => {
                        let _ = reader_tx
                            .send(TransportEvent::Closed {
                                reason: "stream ended".to_string(),
                            })
                            .await;
                        break;
                    }
                };

                if reader_tx.send(event).await.is_err() {
                    log::debug!("Inbound channel closed");
                    break;
                }
            }
            log::debug!("Reader task exiting");
        });

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sent: u64 = 0;
            loop {
                let chunk = tokio::select! {
                    _ = writer_cancel.cancelled() => None,
                    chunk = outbound_rx.recv() => chunk,
                };

                let Some(chunk) = chunk else {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        log::debug!("Error closing WebSocket: {}", e);
                    }
                    break;
                };

                let json = match serde_json::to_string(&ClientMessage::audio(&chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize audio chunk: {}", e);
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Text(json)).await {
                    log::warn!("Failed to send audio: {}", e);
                    let _ = inbound_tx
                        .send(TransportEvent::Error {
                            message: TransportError::SendFailed(e.to_string()).to_string(),
                        })
                        .await;
                    break;
                }

                sent += 1;
                if sent % 50 == 0 {
                    log::debug!("Sent {} audio chunks", sent);
                }
            }
            log::debug!("Writer task exiting after {} chunks", sent);
        });

        Ok(LiveConnection::new(outbound_tx, inbound_rx, cancel))
    }
}

impl Connector for GeminiConnector {
    fn open(
        &self,
        api_key: String,
        setup: LiveSetup,
    ) -> BoxFuture<'static, Result<LiveConnection, TransportError>> {
        Box::pin(self.clone().connect(api_key, setup))
    }
}

fn map_connect_error(e: WsError) -> TransportError {
    match e {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::AuthenticationFailed(format!("HTTP {}", status))
            } else {
                TransportError::ConnectionFailed(format!("HTTP {}", status))
            }
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

fn parse_server_message(bytes: &[u8]) -> Option<ServerMessage> {
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::warn!("Failed to parse server message: {}", e);
            None
        }
    }
}
