//! Controller lifecycle state machine
//!
//! ```text
//! Idle ──run──> Syncing ──synced──> Running ──stop──> Draining ──> Stopped
//!                  │                                                  ▲
//!                  └────────────── stop before sync ──────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;

use crate::error::{ControllerError, Result};

// ============================================================================
// Controller State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// Constructed, `run` not called yet
    Idle,
    /// Reflector started, waiting for the initial list
    Syncing,
    /// Workers are processing keys
    Running,
    /// Queue shut down, waiting for in-flight keys
    Draining,
    /// Terminal
    Stopped,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Syncing => "syncing",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
            ControllerState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Stopped)
    }

    /// Whether workers may be processing keys in this state
    pub fn accepts_work(&self) -> bool {
        matches!(self, ControllerState::Running)
    }

    pub fn can_transition_to(&self, to: ControllerState) -> bool {
        matches!(
            (self, to),
            (ControllerState::Idle, ControllerState::Syncing)
                | (ControllerState::Syncing, ControllerState::Running)
                | (ControllerState::Syncing, ControllerState::Stopped)
                | (ControllerState::Running, ControllerState::Draining)
                | (ControllerState::Draining, ControllerState::Stopped)
        )
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to: ControllerState) -> Result<()> {
        if self.can_transition_to(to) {
            return Ok(());
        }

        let reason = if self.is_terminal() {
            format!("{} is terminal", self.as_str())
        } else {
            format!("Cannot transition from {} to {}", self.as_str(), to.as_str())
        };

        Err(ControllerError::InvalidStateTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
            reason,
        })
    }
}

impl FromStr for ControllerState {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(ControllerState::Idle),
            "syncing" => Ok(ControllerState::Syncing),
            "running" => Ok(ControllerState::Running),
            "draining" => Ok(ControllerState::Draining),
            "stopped" => Ok(ControllerState::Stopped),
            _ => Err(ControllerError::UnknownState(s.to_string())),
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Observable state cell
// ============================================================================

/// Current state plus change notifications
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ControllerState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ControllerState::Idle);
        Self { tx }
    }

    pub(crate) fn current(&self) -> ControllerState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.tx.subscribe()
    }

    /// Atomically validate and apply a transition, returning the previous state
    pub(crate) fn transition(&self, to: ControllerState) -> Result<ControllerState> {
        let mut outcome = Err(ControllerError::InvalidStateTransition {
            from: String::new(),
            to: to.as_str().to_string(),
            reason: String::new(),
        });

        self.tx.send_if_modified(|state| match state.validate_transition(to) {
            Ok(()) => {
                outcome = Ok(*state);
                *state = to;
                true
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            ControllerState::Idle,
            ControllerState::Syncing,
            ControllerState::Running,
            ControllerState::Draining,
            ControllerState::Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].validate_transition(pair[1]).is_ok());
        }
    }

    #[test]
    fn test_stop_before_sync() {
        assert!(ControllerState::Syncing
            .validate_transition(ControllerState::Stopped)
            .is_ok());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let invalid = [
            (ControllerState::Idle, ControllerState::Running),
            (ControllerState::Idle, ControllerState::Stopped),
            (ControllerState::Syncing, ControllerState::Draining),
            (ControllerState::Running, ControllerState::Syncing),
            (ControllerState::Running, ControllerState::Stopped),
            (ControllerState::Draining, ControllerState::Running),
            (ControllerState::Stopped, ControllerState::Idle),
            (ControllerState::Stopped, ControllerState::Syncing),
            (ControllerState::Running, ControllerState::Running),
        ];

        for (from, to) in invalid {
            let err = from.validate_transition(to).unwrap_err();
            assert!(
                matches!(err, ControllerError::InvalidStateTransition { .. }),
                "{} -> {} should be rejected",
                from,
                to
            );
        }
    }

    #[test]
    fn test_terminal_reason() {
        let err = ControllerState::Stopped
            .validate_transition(ControllerState::Running)
            .unwrap_err();
        assert!(err.to_string().contains("stopped is terminal"));
    }

    #[test]
    fn test_parse_and_display() {
        for state in [
            ControllerState::Idle,
            ControllerState::Syncing,
            ControllerState::Running,
            ControllerState::Draining,
            ControllerState::Stopped,
        ] {
            assert_eq!(state.to_string().parse::<ControllerState>().unwrap(), state);
        }
        let err = "paused".parse::<ControllerState>().unwrap_err();
        assert!(matches!(err, ControllerError::UnknownState(ref s) if s == "paused"));
        assert_eq!(err.to_string(), "Unknown controller state: paused");
    }

    #[test]
    fn test_state_cell_transitions_and_notifies() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        assert_eq!(cell.current(), ControllerState::Idle);

        assert_eq!(
            cell.transition(ControllerState::Syncing).unwrap(),
            ControllerState::Idle
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ControllerState::Syncing);

        assert!(cell.transition(ControllerState::Draining).is_err());
        assert_eq!(cell.current(), ControllerState::Syncing);
        assert!(!rx.has_changed().unwrap());
    }
}
