//! Session state machine
//!
//! The single authoritative copy of the pipeline mode. Every task reads it;
//! only the trigger thread and the streaming engine move it, and only through
//! `compare_and_set`, so a writer acting on a stale view is refused instead of
//! clobbering a newer state.
//!
//! ```text
//! Connecting -> Idle -> Triggered -> AwaitingResponse -> Playback -> Idle
//!                                         \-------------------------/
//! any -> Error        Error -> Connecting (reset only)
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the transport and the server's `connected` ack
    Connecting,
    /// Listening for a trigger
    Idle,
    /// Streaming pre-roll and live command audio
    Triggered,
    /// Command sent, waiting for the server to answer
    AwaitingResponse,
    /// Response audio is being played
    Playback,
    /// Terminal until `reset()`
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::Triggered => "triggered",
            SessionState::AwaitingResponse => "awaiting_response",
            SessionState::Playback => "playback",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Trigger,
    Engine,
    /// Supervisor or test harness; may only fail or reset
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Stale transition: expected {expected}, found {actual}")]
    Stale {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Illegal transition {from} -> {to} by {actor:?}")]
    Illegal {
        from: SessionState,
        to: SessionState,
        actor: Actor,
    },
}

pub type Result<T> = std::result::Result<T, TransitionError>;

/// Whether `actor` may move the session from `from` to `to`.
pub fn is_legal(from: SessionState, to: SessionState, actor: Actor) -> bool {
    use SessionState::*;

    match (from, to, actor) {
        // Anyone may report a fault, except from Error itself
        (Error, Error, _) => false,
        (_, Error, _) => true,

        (Idle, Triggered, Actor::Trigger) => true,

        (Connecting, Idle, Actor::Engine) => true,
        (Triggered, AwaitingResponse, Actor::Engine) => true,
        (AwaitingResponse, Playback, Actor::Engine) => true,
        (AwaitingResponse, Idle, Actor::Engine) => true,
        (Playback, Idle, Actor::Engine) => true,

        _ => false,
    }
}

/// Shared handle to the session state.
///
/// Cloning is cheap; every clone refers to the same state.
#[derive(Clone)]
pub struct SessionStateMachine {
    tx: Arc<watch::Sender<SessionState>>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Connecting);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next` only if the current state is still `expected`.
    pub fn compare_and_set(
        &self,
        expected: SessionState,
        next: SessionState,
        actor: Actor,
    ) -> Result<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|state| {
            if *state != expected {
                outcome = Err(TransitionError::Stale {
                    expected,
                    actual: *state,
                });
                return false;
            }
            if !is_legal(expected, next, actor) {
                outcome = Err(TransitionError::Illegal {
                    from: expected,
                    to: next,
                    actor,
                });
                return false;
            }
            *state = next;
            true
        });

        if outcome.is_ok() {
            info!("Session {} -> {} ({:?})", expected, next, actor);
        }
        outcome
    }

    /// Force the session into `Error` from whatever state it is in.
    ///
    /// Returns the state that was left, or `None` if already in `Error`.
    pub fn fail(&self, actor: Actor, reason: &str) -> Option<SessionState> {
        let mut previous = None;
        self.tx.send_if_modified(|state| {
            if *state == SessionState::Error {
                return false;
            }
            previous = Some(*state);
            *state = SessionState::Error;
            true
        });

        if let Some(from) = previous {
            error!("Session {} -> error ({:?}): {}", from, actor, reason);
        }
        previous
    }

    /// Reinitialise to `Connecting`.
    pub fn reset(&self) {
        let previous = self.tx.send_replace(SessionState::Connecting);
        info!("Session {} -> connecting (reset)", previous);
    }

    /// Receiver that is notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionStateMachine").field(&self.get()).finish()
    }
}
