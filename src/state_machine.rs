//! Session lifecycle state machine.
//!
//! ```text
//! Idle → Starting → Running → Draining → Stopped
//!   │        │         │          │
//!   └────────┴─────────┴──────────┴────→ Failed
//! ```
//!
//! `Stopped` and `Failed` are terminal. Transitions are checked and applied
//! atomically inside the watch channel so every subscriber observes a legal
//! sequence.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Idle, Starting) | (Idle, Stopped) => true,
            (Starting, Running) | (Starting, Draining) => true,
            (Running, Draining) => true,
            (Draining, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared, observable session state.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<SessionState>,
    failure: Mutex<Option<String>>,
    failed_transitions: AtomicU32,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self {
            tx,
            failure: Mutex::new(None),
            failed_transitions: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Apply `next` if it is a legal edge from the current state.
    /// Returns the previous state on success.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionState> {
        let mut prev = None;
        let mut rejected = SessionState::Idle;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                prev = Some(*state);
                *state = next;
                true
            } else {
                rejected = *state;
                false
            }
        });
        match prev {
            Some(p) => {
                log::info!("Session state: {} -> {}", p, next);
                if next == SessionState::Failed {
                    self.failed_transitions.fetch_add(1, Ordering::Relaxed);
                }
                Ok(p)
            }
            None => Err(rejected),
        }
    }

    /// Force `Failed` and record the cause. First cause wins.
    /// Returns false if the session was already terminal.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        match self.transition(SessionState::Failed) {
            Ok(_) => {
                log::error!("Session failed: {}", cause);
                let mut slot = self.failure.lock().unwrap_or_else(|e| e.into_inner());
                slot.get_or_insert(cause);
                true
            }
            Err(_) => false,
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How many times the session entered `Failed`. At most one.
    pub fn failed_transitions(&self) -> u32 {
        self.failed_transitions.load(Ordering::Relaxed)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), SessionState::Idle);
        assert!(sm.transition(SessionState::Starting).is_ok());
        assert!(sm.transition(SessionState::Running).is_ok());
        assert!(sm.transition(SessionState::Draining).is_ok());
        assert!(sm.transition(SessionState::Stopped).is_ok());
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let sm = StateMachine::new();
        assert_eq!(sm.transition(SessionState::Running), Err(SessionState::Idle));
        assert_eq!(sm.transition(SessionState::Draining), Err(SessionState::Idle));
        assert_eq!(sm.current(), SessionState::Idle);
    }

    #[test]
    fn terminal_states_are_final() {
        let sm = StateMachine::new();
        sm.transition(SessionState::Stopped).unwrap();
        assert!(!sm.fail("late error"));
        assert_eq!(sm.current(), SessionState::Stopped);
        assert_eq!(sm.failure(), None);
    }

    #[test]
    fn fail_only_counts_once() {
        let sm = StateMachine::new();
        sm.transition(SessionState::Starting).unwrap();
        assert!(sm.fail("device gone"));
        assert!(!sm.fail("transport gone"));
        assert_eq!(sm.failed_transitions(), 1);
        assert_eq!(sm.failure().as_deref(), Some("device gone"));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let sm = StateMachine::new();
        let mut rx = sm.subscribe();
        sm.transition(SessionState::Starting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Starting);
    }
}
