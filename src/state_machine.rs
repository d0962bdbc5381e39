//! State machine for the voice session
//!
//! Single-writer pattern: every transition goes through `reduce()`, which
//! returns the next state and the effects the session must execute. The
//! reducer never touches hardware or the network itself.

use uuid::Uuid;

/// Shown when `connect()` is attempted without a credential.
pub const MISSING_KEY_NOTICE: &str = "API Key missing.";

/// Authoritative connection state.
///
/// Hardware is held exactly while `Connecting` or `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Disconnected {
        /// Configuration problem from the last connect attempt, if any
        notice: Option<String>,
    },
    Connecting {
        session_id: Uuid,
    },
    Connected {
        session_id: Uuid,
    },
    Error {
        message: String,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Disconnected { notice: None }
    }
}

impl State {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id } | State::Connected { session_id } => Some(*session_id),
            _ => None,
        }
    }

    pub fn holds_hardware(&self) -> bool {
        matches!(self, State::Connecting { .. } | State::Connected { .. })
    }
}

/// Events that can trigger state transitions.
/// Sources: UI commands, device acquisition, the transport handshake and the live connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start a session
    Connect { credential_present: bool },
    /// User asked to stop (also used as reset from Error)
    Disconnect,

    // Hardware acquisition (tagged with the session id to drop stale results)
    HardwareReady { id: Uuid },
    HardwareFailed { id: Uuid, message: String },

    // Transport handshake
    TransportOpened { id: Uuid },
    TransportFailed { id: Uuid, message: String },

    // Live connection
    /// Remote model detected user speech over its own output
    Interrupted,
    /// One base64 PCM16 speech chunk
    AudioReceived { data: String },
    RemoteClosed { reason: String },
    RemoteError { message: String },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open microphone and speaker contexts
    AcquireHardware { id: Uuid },
    /// Start the transport handshake
    OpenTransport { id: Uuid },
    /// Route captured audio to the now-open transport
    AttachTransport { id: Uuid },
    /// Barge-in: stop all scheduled speech
    FlushPlayback,
    SchedulePlayback { data: String },
    /// Release everything the session holds
    Teardown { reason: String },
    /// Publish state to the UI
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Ignore events with stale session IDs
/// - Every path into `Error` or `Disconnected` tears down before `EmitUi`
/// - `Connect` is only accepted from `Disconnected`
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Disconnected
        // -----------------
        (Disconnected { .. }, Connect { credential_present: false }) => (
            Disconnected {
                notice: Some(MISSING_KEY_NOTICE.to_string()),
            },
            vec![EmitUi],
        ),
        (Disconnected { .. }, Connect { credential_present: true }) => {
            let id = Uuid::new_v4();
            (
                Connecting { session_id: id },
                vec![EmitUi, AcquireHardware { id }],
            )
        }

        // -----------------
        // Connecting
        // -----------------
        (Connecting { .. }, HardwareReady { id }) if is_current(id) => {
            (state.clone(), vec![OpenTransport { id }])
        }
        (Connecting { .. }, HardwareFailed { id, message }) if is_current(id) => (
            Error {
                message: message.clone(),
            },
            vec![Teardown { reason: message }, EmitUi],
        ),
        (Connecting { session_id }, TransportOpened { id }) if is_current(id) => (
            Connected {
                session_id: *session_id,
            },
            vec![AttachTransport { id }, EmitUi],
        ),
        (Connecting { .. }, TransportFailed { id, message }) if is_current(id) => (
            Error {
                message: message.clone(),
            },
            vec![Teardown { reason: message }, EmitUi],
        ),

        // -----------------
        // Connected
        // -----------------
        (Connected { .. }, Interrupted) => (state.clone(), vec![FlushPlayback]),
        (Connected { .. }, AudioReceived { data }) => {
            (state.clone(), vec![SchedulePlayback { data }])
        }
        (Connected { .. }, RemoteClosed { reason }) => (
            Disconnected { notice: None },
            vec![
                Teardown {
                    reason: format!("remote closed: {}", reason),
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Any live state
        // -----------------
        (Connecting { .. } | Connected { .. }, RemoteError { message }) => (
            Error {
                message: message.clone(),
            },
            vec![Teardown { reason: message }, EmitUi],
        ),

        // Disconnect is idempotent and also resets Error
        (_, Disconnect) => (
            Disconnected { notice: None },
            vec![
                Teardown {
                    reason: "disconnected".to_string(),
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Unhandled: no transition
        // (re-entrant Connect, stale ids, audio outside Connected)
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
