//! Voice session actor
//!
//! `VoiceSession` is the single owner of everything a live conversation
//! holds: the device handles, the playback scheduler, the outbound link and
//! the live connection. It runs as one task that reacts to:
//!
//! ```text
//! SessionHandle ──Command──────┐
//! handshake task ──Internal────┤
//! LiveConnection ──TransportEvent──▶ VoiceSession ──▶ reduce() ──▶ effects
//! OutputDevice ──ended ids─────┘
//! ```
//!
//! Effects run synchronously inside `dispatch`, so teardown always finishes
//! before the next event is looked at. Device open (on the blocking pool) and
//! the transport handshake run elsewhere and report back tagged with their
//! session id; results for any other session are released on arrival.

use std::mem::discriminant;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::codec::decode_payload;
use crate::audio::{
    AudioHost, CaptureTap, EndedReceiver, EndedSender, InputDevice, LinkStats, OutboundLink,
    OutputDevice, PlaybackScheduler, VolumeMeter, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
use crate::error::SessionError;
use crate::metrics::{MetricsSummary, SessionMetrics, SessionRecord};
use crate::settings::VoiceSettings;
use crate::state_machine::{reduce, Effect, Event, State};
use crate::streaming::{Connector, LiveConnection, LiveSetup, TransportError, TransportEvent};

/// Connection state as the UI sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What the UI needs to render: a state and an optional message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub message: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::from(&State::default())
    }
}

impl From<&State> for SessionStatus {
    fn from(state: &State) -> Self {
        match state {
            State::Disconnected { notice } => Self {
                state: ConnectionState::Disconnected,
                message: notice.clone(),
            },
            State::Connecting { .. } => Self {
                state: ConnectionState::Connecting,
                message: None,
            },
            State::Connected { .. } => Self {
                state: ConnectionState::Connected,
                message: None,
            },
            State::Error { message } => Self {
                state: ConnectionState::Error,
                message: Some(message.clone()),
            },
        }
    }
}

/// Fixed parameters of every session this actor opens.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub setup: LiveSetup,
    pub capture_block_size: usize,
}

impl SessionConfig {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            setup: LiveSetup::new(settings.model.clone(), settings.voice_name.clone()),
            capture_block_size: settings.capture_block_size,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&VoiceSettings::default())
    }
}

/// Point-in-time snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub hardware_held: bool,
    pub input_active: bool,
    pub transport_attached: bool,
    pub active_playback: usize,
    pub playback_cursor: f64,
    pub link: LinkStats,
    pub metrics: MetricsSummary,
    pub history: Vec<SessionRecord>,
}

/// Requests from [`crate::SessionHandle`]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Report(oneshot::Sender<SessionReport>),
    Shutdown,
}

/// Results reported back by device acquisition and the handshake task
enum Internal {
    HardwareOpened { id: Uuid, hardware: HardwareHandles },
    HardwareFailed { id: Uuid, error: SessionError },
    TransportOpened { id: Uuid, connection: LiveConnection },
    TransportFailed { id: Uuid, error: TransportError },
}

/// Microphone plus speaker, acquired and released together.
struct HardwareHandles {
    input: Box<dyn InputDevice>,
    output: Box<dyn OutputDevice>,
}

impl HardwareHandles {
    /// Open the microphone, then the speaker. Blocks until both audio
    /// threads report; a speaker failure stops the microphone again.
    fn open(host: &dyn AudioHost, tap: CaptureTap, ended: EndedSender) -> Result<Self, SessionError> {
        let mut input = host.open_input(INPUT_SAMPLE_RATE, tap)?;

        let output = match host.open_output(OUTPUT_SAMPLE_RATE, ended) {
            Ok(output) => output,
            Err(e) => {
                input.stop();
                return Err(e.into());
            }
        };

        log::info!(
            "Audio devices ready (input {} Hz, output {} Hz)",
            input.sample_rate(),
            output.sample_rate()
        );
        Ok(Self { input, output })
    }

    fn release(&mut self) {
        self.input.stop();
        self.output.close();
    }
}

pub struct VoiceSession {
    state: State,
    config: SessionConfig,
    credential: Option<String>,
    host: Arc<dyn AudioHost>,
    connector: Arc<dyn Connector>,

    hardware: Option<HardwareHandles>,
    scheduler: PlaybackScheduler,
    link: OutboundLink,
    volume: VolumeMeter,
    connection: Option<LiveConnection>,
    handshake: Option<JoinHandle<()>>,
    metrics: SessionMetrics,

    status_tx: watch::Sender<SessionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    ended_tx: EndedSender,
    ended_rx: EndedReceiver,
}

impl VoiceSession {
    pub(crate) fn new(
        config: SessionConfig,
        credential: Option<String>,
        host: Arc<dyn AudioHost>,
        connector: Arc<dyn Connector>,
        volume: VolumeMeter,
        status_tx: watch::Sender<SessionStatus>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        Self {
            state: State::default(),
            config,
            credential: credential.filter(|k| !k.trim().is_empty()),
            host,
            connector,
            hardware: None,
            scheduler: PlaybackScheduler::new(),
            link: OutboundLink::new(),
            volume,
            connection: None,
            handshake: None,
            metrics: SessionMetrics::new(),
            status_tx,
            commands,
            internal_tx,
            internal_rx,
            ended_tx,
            ended_rx,
        }
    }

    /// Actor loop. Returns after `Shutdown` or once every handle is dropped,
    /// always leaving hardware released.
    pub(crate) async fn run(mut self) {
        self.emit_ui();
        log::info!("Voice session loop started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Disconnect) => self.dispatch(Event::Disconnect),
                    Some(Command::Report(reply)) => {
                        let _ = reply.send(self.report());
                    }
                    Some(Command::Shutdown) | None => {
                        log::info!("Shutdown requested");
                        self.dispatch(Event::Disconnect);
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                event = next_transport_event(&mut self.connection) => self.on_transport(event),
                Some(id) = self.ended_rx.recv() => {
                    if self.scheduler.on_ended(id) {
                        log::trace!("Playback #{} finished ({} active)", id, self.scheduler.active_len());
                    }
                }
            }
        }

        log::info!("Voice session loop ended");
    }

    fn connect(&mut self) {
        let credential_present = self.credential.is_some();
        if !credential_present && matches!(self.state, State::Disconnected { .. }) {
            log::warn!("Connect requested without an API key");
            self.metrics.record_error(
                SessionError::Configuration.kind(),
                SessionError::Configuration.to_string(),
                None,
            );
        }
        self.dispatch(Event::Connect { credential_present });
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::HardwareOpened { id, mut hardware } => {
                if self.state.session_id() != Some(id) || self.hardware.is_some() {
                    log::debug!("Releasing audio devices opened for stale session {}", id);
                    hardware.release();
                    return;
                }
                self.hardware = Some(hardware);
                self.dispatch(Event::HardwareReady { id });
            }
            Internal::HardwareFailed { id, error } => {
                if self.state.session_id() != Some(id) {
                    log::debug!("Ignoring device failure for stale session {}: {}", id, error);
                    return;
                }
                log::error!("Failed to acquire audio hardware: {}", error);
                self.metrics
                    .record_error(error.kind(), error.to_string(), Some(id));
                self.dispatch(Event::HardwareFailed {
                    id,
                    message: error.to_string(),
                });
            }
            // The handshake handle belongs to the current session only; a late
            // result from an earlier one must not forget it.
            Internal::TransportOpened { id, connection } => {
                if self.state.session_id() != Some(id) || self.connection.is_some() {
                    log::debug!("Dropping connection for stale session {}", id);
                    drop(connection);
                    return;
                }
                self.handshake = None;
                self.connection = Some(connection);
                self.dispatch(Event::TransportOpened { id });
            }
            Internal::TransportFailed { id, error } => {
                if self.state.session_id() != Some(id) {
                    log::debug!("Ignoring handshake failure for stale session {}: {}", id, error);
                    return;
                }
                self.handshake = None;
                let error = SessionError::from(error);
                log::error!("Transport handshake failed: {}", error);
                self.metrics
                    .record_error(error.kind(), error.to_string(), Some(id));
                self.dispatch(Event::TransportFailed {
                    id,
                    message: error.to_string(),
                });
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => {
                // Barge-in first so audio in the same message starts fresh
                if msg.is_interrupted() {
                    self.dispatch(Event::Interrupted);
                }
                for data in msg.audio_payloads() {
                    self.dispatch(Event::AudioReceived {
                        data: data.to_string(),
                    });
                }
                if msg.is_turn_complete() {
                    log::debug!("Model turn complete");
                }
                if let Some(go_away) = &msg.go_away {
                    log::warn!("Server going away (time left: {:?})", go_away.time_left);
                }
            }
            TransportEvent::Closed { reason } => {
                log::info!("Live connection closed: {}", reason);
                self.dispatch(Event::RemoteClosed { reason });
            }
            TransportEvent::Error { message } => {
                let error = SessionError::Transport(message);
                log::error!("Live connection failed: {}", error);
                self.metrics
                    .record_error(error.kind(), error.to_string(), self.state.session_id());
                self.dispatch(Event::RemoteError {
                    message: error.to_string(),
                });
            }
        }
    }

    /// Run one event through the reducer, then its effects in order.
    fn dispatch(&mut self, event: Event) {
        log::trace!("Received event: {:?}", event);

        let (next, effects) = reduce(&self.state, event);
        if discriminant(&self.state) != discriminant(&next) {
            log::info!("State transition: {:?} -> {:?}", self.state, next);
        }
        self.state = next;

        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::AcquireHardware { id } => self.acquire_hardware(id),
            Effect::OpenTransport { id } => self.open_transport(id),
            Effect::AttachTransport { id } => {
                if let Some(connection) = &self.connection {
                    self.link.attach(connection.outbound());
                    self.metrics.session_connected();
                    log::info!("Session {} live", id);
                }
            }
            Effect::FlushPlayback => {
                let flushed = match self.hardware.as_mut() {
                    Some(hw) => self.scheduler.interrupt(hw.output.as_mut()),
                    None => {
                        self.scheduler.reset();
                        0
                    }
                };
                log::debug!("Barge-in: {} chunk(s) cut", flushed);
                self.metrics.interrupted();
            }
            Effect::SchedulePlayback { data } => self.schedule_playback(&data),
            Effect::Teardown { reason } => self.teardown(reason),
            Effect::EmitUi => self.emit_ui(),
        }
    }

    fn acquire_hardware(&mut self, id: Uuid) {
        self.metrics.start_session(id);

        // Fresh gate per session so counters and attachment never leak across sessions
        self.link = OutboundLink::new();
        let tap = CaptureTap::new(
            self.config.capture_block_size,
            INPUT_SAMPLE_RATE,
            self.volume.clone(),
            self.link.clone(),
        );

        let host = self.host.clone();
        let ended = self.ended_tx.clone();
        let tx = self.internal_tx.clone();

        // Opening waits on the audio threads; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            let result = match HardwareHandles::open(host.as_ref(), tap, ended) {
                Ok(hardware) => Internal::HardwareOpened { id, hardware },
                Err(error) => Internal::HardwareFailed { id, error },
            };
            if let Err(mpsc::error::SendError(Internal::HardwareOpened { mut hardware, .. })) =
                tx.send(result)
            {
                log::debug!("Session gone before devices opened, releasing");
                hardware.release();
            }
        });
    }

    fn open_transport(&mut self, id: Uuid) {
        let Some(api_key) = self.credential.clone() else {
            // Connect is guarded on the credential; report rather than panic
            let _ = self.internal_tx.send(Internal::TransportFailed {
                id,
                error: TransportError::MissingApiKey,
            });
            return;
        };

        let open = self.connector.open(api_key, self.config.setup.clone());
        let tx = self.internal_tx.clone();

        self.handshake = Some(tokio::spawn(async move {
            let result = match open.await {
                Ok(connection) => Internal::TransportOpened { id, connection },
                Err(error) => Internal::TransportFailed { id, error },
            };
            if tx.send(result).is_err() {
                log::debug!("Session gone before handshake finished");
            }
        }));
    }

    fn schedule_playback(&mut self, data: &str) {
        let buffer = match decode_payload(data, OUTPUT_SAMPLE_RATE) {
            Ok(buffer) => buffer,
            Err(e) => {
                let error = SessionError::from(e);
                log::warn!("Dropping inbound chunk: {}", error);
                self.metrics.decode_failed();
                self.metrics
                    .record_error(error.kind(), error.to_string(), self.state.session_id());
                return;
            }
        };

        let Some(hw) = self.hardware.as_mut() else {
            log::debug!("No output device, dropping inbound chunk");
            return;
        };

        match self.scheduler.schedule(hw.output.as_mut(), buffer) {
            Ok(_) => self.metrics.chunk_received(),
            Err(e) => log::warn!("Output device rejected chunk: {}", e),
        }
    }

    /// Release everything. Safe to run in any state, any number of times.
    fn teardown(&mut self, reason: String) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }

        self.link.detach();

        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }

        if let Some(mut hw) = self.hardware.take() {
            self.scheduler.interrupt(hw.output.as_mut());
            hw.release();
            log::info!("Audio hardware released");
        }

        self.scheduler.reset();
        self.volume.reset();
        self.metrics.end_session(self.link.stats(), reason);
    }

    fn emit_ui(&self) {
        let status = SessionStatus::from(&self.state);
        log::debug!("UI status: {:?}", status);
        self.status_tx.send_replace(status);
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            status: SessionStatus::from(&self.state),
            session_id: self.state.session_id().map(|id| id.to_string()),
            hardware_held: self.hardware.is_some(),
            input_active: self
                .hardware
                .as_ref()
                .is_some_and(|hw| hw.input.is_active()),
            transport_attached: self.link.is_attached(),
            active_playback: self.scheduler.active_len(),
            playback_cursor: self.scheduler.cursor(),
            link: self.link.stats(),
            metrics: self.metrics.summary(),
            history: self.metrics.history(),
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if self.hardware.is_some() || self.connection.is_some() {
            self.teardown("dropped".to_string());
        }
    }
}

/// Next event from the live connection; never resolves while there is none.
async fn next_transport_event(connection: &mut Option<LiveConnection>) -> TransportEvent {
    match connection {
        Some(connection) => connection
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed {
                reason: "transport ended".to_string(),
            }),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::future::BoxFuture;

    use crate::audio::AudioError;

    struct NoDevices;

    impl AudioHost for NoDevices {
        fn open_input(&self, _sample_rate: u32, _tap: CaptureTap) -> Result<Box<dyn InputDevice>, AudioError> {
            Err(AudioError::NoInputDevice)
        }

        fn open_output(
            &self,
            _sample_rate: u32,
            _ended: EndedSender,
        ) -> Result<Box<dyn OutputDevice>, AudioError> {
            Err(AudioError::NoOutputDevice)
        }
    }

    struct NeverConnects;

    impl Connector for NeverConnects {
        fn open(
            &self,
            _api_key: String,
            _setup: LiveSetup,
        ) -> BoxFuture<'static, Result<LiveConnection, TransportError>> {
            Box::pin(std::future::pending())
        }
    }

    /// Sets its flag when dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn idle_session() -> VoiceSession {
        let (status_tx, _) = watch::channel(SessionStatus::default());
        let (_, commands) = mpsc::unbounded_channel();
        VoiceSession::new(
            SessionConfig::default(),
            Some("test-key".to_string()),
            Arc::new(NoDevices),
            Arc::new(NeverConnects),
            VolumeMeter::new(),
            status_tx,
            commands,
        )
    }

    /// Pretend `current` is connecting with a handshake in flight.
    fn with_pending_handshake(session: &mut VoiceSession, current: Uuid) -> Arc<AtomicBool> {
        session.state = State::Connecting {
            session_id: current,
        };
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        session.handshake = Some(tokio::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
        }));
        dropped
    }

    async fn wait_dropped(dropped: &AtomicBool) -> bool {
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                return true;
            }
            tokio::task::yield_now().await;
        }
        dropped.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_late_handshake_failure_keeps_current_handshake() {
        let mut session = idle_session();
        let current = Uuid::new_v4();
        let dropped = with_pending_handshake(&mut session, current);

        session.on_internal(Internal::TransportFailed {
            id: Uuid::new_v4(),
            error: TransportError::ConnectionFailed("refused".to_string()),
        });
        assert!(session.handshake.is_some());
        assert_eq!(session.state.session_id(), Some(current));

        session.dispatch(Event::Disconnect);
        assert!(session.handshake.is_none());
        assert!(wait_dropped(&dropped).await, "handshake survived disconnect");
    }

    #[tokio::test]
    async fn test_late_handshake_success_keeps_current_handshake() {
        let mut session = idle_session();
        let current = Uuid::new_v4();
        let dropped = with_pending_handshake(&mut session, current);

        let (outbound, _outbound_rx) = mpsc::channel(1);
        let (_inbound_tx, inbound) = mpsc::channel(1);
        let cancel = tokio_util::sync::CancellationToken::new();
        session.on_internal(Internal::TransportOpened {
            id: Uuid::new_v4(),
            connection: LiveConnection::new(outbound, inbound, cancel.clone()),
        });

        // the stale connection is closed, not adopted
        assert!(cancel.is_cancelled());
        assert!(session.connection.is_none());
        assert!(session.handshake.is_some());

        session.dispatch(Event::Disconnect);
        assert!(wait_dropped(&dropped).await, "handshake survived disconnect");
    }

    #[tokio::test]
    async fn test_device_failure_for_stale_session_is_ignored() {
        let mut session = idle_session();
        let current = Uuid::new_v4();
        session.state = State::Connecting {
            session_id: current,
        };

        session.on_internal(Internal::HardwareFailed {
            id: Uuid::new_v4(),
            error: SessionError::Device("gone".to_string()),
        });
        assert_eq!(
            session.state,
            State::Connecting {
                session_id: current
            }
        );
        assert!(session.metrics.errors().is_empty());
    }

    #[test]
    fn test_status_from_state() {
        let status = SessionStatus::from(&State::Disconnected {
            notice: Some("API Key missing.".to_string()),
        });
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.message.as_deref(), Some("API Key missing."));

        let status = SessionStatus::from(&State::Connecting {
            session_id: Uuid::new_v4(),
        });
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(status.message.is_none());

        let status = SessionStatus::from(&State::Error {
            message: "Connection Error: reset".to_string(),
        });
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.message.as_deref(), Some("Connection Error: reset"));
    }

    #[test]
    fn test_default_status_is_disconnected() {
        let status = SessionStatus::default();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.message.is_none());
    }

    #[test]
    fn test_status_serializes_like_the_ui_expects() {
        let json = serde_json::to_string(&SessionStatus::default()).unwrap();
        assert_eq!(json, r#"{"state":"DISCONNECTED","message":null}"#);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = VoiceSettings {
            voice_name: "Puck".to_string(),
            capture_block_size: 1024,
            ..VoiceSettings::default()
        };
        let config = SessionConfig::from_settings(&settings);
        assert_eq!(config.setup.voice_name, "Puck");
        assert_eq!(config.capture_block_size, 1024);
        assert!(config.setup.system_instruction.contains("Cosmic Empire"));
    }
}
