//! Real-time voice bridge to the Gemini Live API
//!
//! Captures the microphone, streams it to a live speech model and plays the
//! model's speech back gaplessly, cutting it off when the user talks over it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use voice_bridge::{CpalHost, GeminiConnector, SessionConfig, SessionHandle};
//!
//! # async fn demo() {
//! let (handle, _task) = SessionHandle::spawn(
//!     SessionConfig::default(),
//!     voice_bridge::streaming::get_api_key(),
//!     Arc::new(CpalHost),
//!     Arc::new(GeminiConnector::default()),
//! );
//! handle.connect();
//! # }
//! ```

pub mod audio;
pub mod error;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use audio::{AudioError, AudioHost, CpalHost};
pub use error::SessionError;
pub use session::{ConnectionState, SessionConfig, SessionReport, SessionStatus};
pub use settings::VoiceSettings;
pub use streaming::{Connector, GeminiConnector, LiveSetup, TransportError};

use audio::VolumeMeter;
use session::{Command, VoiceSession};

/// Cloneable front door to a running [`VoiceSession`].
///
/// Every method is non-blocking; results show up through
/// [`watch_status`](Self::watch_status) and [`watch_volume`](Self::watch_volume).
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    volume: VolumeMeter,
}

impl SessionHandle {
    /// Start the session actor on the current tokio runtime.
    ///
    /// A missing `credential` is not an error here; `connect()` reports it.
    pub fn spawn(
        config: SessionConfig,
        credential: Option<String>,
        host: Arc<dyn AudioHost>,
        connector: Arc<dyn Connector>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let volume = VolumeMeter::new();

        let session = VoiceSession::new(
            config,
            credential,
            host,
            connector,
            volume.clone(),
            status_tx,
            command_rx,
        );
        let task = tokio::spawn(session.run());

        (
            Self {
                commands: command_tx,
                status: status_rx,
                volume,
            },
            task,
        )
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Stop everything and return to `Disconnected`. Safe in any state.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Leave the `Error` state.
    pub fn reset(&self) {
        self.disconnect();
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Latest microphone RMS level
    pub fn volume(&self) -> f32 {
        self.volume.current()
    }

    pub fn watch_volume(&self) -> watch::Receiver<f32> {
        self.volume.subscribe()
    }

    /// Snapshot of the session. `None` once the actor has stopped.
    pub async fn report(&self) -> Option<SessionReport> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Report(tx)).ok()?;
        rx.await.ok()
    }

    /// Disconnect and stop the actor.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("Voice session is no longer running");
        }
    }
}
