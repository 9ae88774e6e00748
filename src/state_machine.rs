//! Session lifecycle state machine
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All transitions go through the `reduce()` function, which returns a new
//! state and a list of effects for the controller loop to execute.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{classify, AppError, Fault};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lifecycle phase. Every phase that owns resources carries the id of the
/// attempt that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Connecting {
        attempt_id: Uuid,
    },
    Connected {
        attempt_id: Uuid,
    },
    Error,
}

impl Phase {
    pub fn attempt_id(&self) -> Option<Uuid> {
        match self {
            Phase::Connecting { attempt_id } | Phase::Connected { attempt_id } => {
                Some(*attempt_id)
            }
            Phase::Idle | Phase::Error => None,
        }
    }

    pub fn session_state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting { .. } => SessionState::Connecting,
            Phase::Connected { .. } => SessionState::Connected,
            Phase::Error => SessionState::Error,
        }
    }
}

/// Authoritative controller state. The held error survives until cleared or
/// superseded by a new attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub phase: Phase,
    pub error: Option<AppError>,
}

impl State {
    pub fn session_state(&self) -> SessionState {
        self.phase.session_state()
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Caller asked for a session
    Start { play_greeting: bool },
    /// Caller dismissed the held error
    ClearError,

    // Establishment
    ChannelOpened { id: Uuid },
    SetupFailed { id: Uuid, fault: Fault },

    // Open channel
    ChannelFailed { id: Uuid, fault: Fault },
    /// `fault` is `None` for a clean close
    ChannelClosed { id: Uuid, fault: Option<Fault> },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Release every session resource. Always safe to run.
    Cleanup,
    /// Build the session context for a new attempt
    OpenSession { id: Uuid, play_greeting: bool },
    /// Start forwarding captured audio onto the open channel
    WireCapture { id: Uuid },
    /// Publish a new snapshot
    EmitUi,
}

fn fail(fault: &Fault) -> (State, Vec<Effect>) {
    (
        State {
            phase: Phase::Error,
            error: Some(classify(fault)),
        },
        vec![Effect::Cleanup, Effect::EmitUi],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale attempt IDs
/// - Always emit EmitUi after observable changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current_id = state.phase.attempt_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state.phase, event) {
        // -----------------
        // Start: rejected while an attempt is live
        // -----------------
        (Phase::Connecting { .. } | Phase::Connected { .. }, Start { .. }) => {
            log::debug!("Start ignored: session already {}", state.session_state());
            (state.clone(), vec![])
        }
        (Phase::Idle | Phase::Error, Start { play_greeting }) => {
            let id = Uuid::new_v4();
            (
                State {
                    phase: Phase::Connecting { attempt_id: id },
                    error: None,
                },
                vec![Cleanup, OpenSession { id, play_greeting }, EmitUi],
            )
        }

        // -----------------
        // Error dismissal keeps the phase
        // -----------------
        (_, ClearError) => {
            if state.error.is_none() {
                return (state.clone(), vec![]);
            }
            (
                State {
                    phase: state.phase,
                    error: None,
                },
                vec![EmitUi],
            )
        }

        // -----------------
        // Connecting
        // -----------------
        (Phase::Connecting { attempt_id }, ChannelOpened { id }) if attempt_id == id => (
            State {
                phase: Phase::Connected { attempt_id },
                error: None,
            },
            vec![WireCapture { id }, EmitUi],
        ),
        (Phase::Connecting { attempt_id }, SetupFailed { id, fault }) if attempt_id == id => {
            fail(&fault)
        }

        // -----------------
        // Channel failures and closes, while connecting or connected
        // -----------------
        (_, ChannelFailed { id, fault }) if is_current(id) => fail(&fault),
        (_, ChannelClosed { id, fault }) if is_current(id) => match fault {
            Some(fault) => fail(&fault),
            None => (
                State {
                    phase: Phase::Idle,
                    error: None,
                },
                vec![Cleanup, EmitUi],
            ),
        },

        // -----------------
        // Stale or out-of-phase: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
