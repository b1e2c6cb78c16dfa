//! Integration lifecycle state machine

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection state of one (tenant, provider) integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    Unconfigured,
    Connecting,
    Connected,
    /// Access token is expired or about to; a refresh is pending
    TokenExpired,
    /// The grant was revoked; only a new handshake recovers
    TokenRevoked,
    Disconnected,
}

/// Something that happened to an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    BeginHandshake,
    HandshakeCompleted,
    HandshakeFailed,
    TokenExpired,
    TokenRefreshed,
    GrantRevoked,
    Disconnect,
}

impl IntegrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationState::Unconfigured => "unconfigured",
            IntegrationState::Connecting => "connecting",
            IntegrationState::Connected => "connected",
            IntegrationState::TokenExpired => "token_expired",
            IntegrationState::TokenRevoked => "token_revoked",
            IntegrationState::Disconnected => "disconnected",
        }
    }

    /// Whether a sync may ask the vault for a token in this state
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            IntegrationState::Connected | IntegrationState::TokenExpired
        )
    }

    /// Apply `event`, rejecting transitions the lifecycle does not allow
    pub fn transition(self, event: StateEvent) -> Result<Self> {
        use IntegrationState::*;

        let next = match (self, event) {
            // A fresh handshake may start from anywhere
            (_, StateEvent::BeginHandshake) => Some(Connecting),
            (Connecting, StateEvent::HandshakeCompleted) => Some(Connected),
            (Connecting, StateEvent::HandshakeFailed) => Some(Unconfigured),

            (Connected | TokenExpired, StateEvent::TokenExpired) => Some(TokenExpired),
            // Concurrent refreshes may both land
            (Connected | TokenExpired, StateEvent::TokenRefreshed) => Some(Connected),
            (Connected | TokenExpired | TokenRevoked, StateEvent::GrantRevoked) => {
                Some(TokenRevoked)
            }

            (Connecting | Connected | TokenExpired | TokenRevoked, StateEvent::Disconnect) => {
                Some(Disconnected)
            }
            _ => None,
        };

        next.ok_or_else(|| {
            tracing::warn!(state = %self, event = ?event, "Rejected integration state transition");
            BridgeError::InvalidStateTransition {
                from: self.to_string(),
                event: format!("{:?}", event),
            }
        })
    }
}

impl fmt::Display for IntegrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationState {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unconfigured" => Ok(IntegrationState::Unconfigured),
            "connecting" => Ok(IntegrationState::Connecting),
            "connected" => Ok(IntegrationState::Connected),
            "token_expired" => Ok(IntegrationState::TokenExpired),
            "token_revoked" => Ok(IntegrationState::TokenRevoked),
            "disconnected" => Ok(IntegrationState::Disconnected),
            other => Err(BridgeError::Storage(format!(
                "Unknown integration state: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = IntegrationState::Unconfigured
            .transition(StateEvent::BeginHandshake)
            .and_then(|s| s.transition(StateEvent::HandshakeCompleted))
            .unwrap();
        assert_eq!(state, IntegrationState::Connected);

        let state = state
            .transition(StateEvent::TokenExpired)
            .and_then(|s| s.transition(StateEvent::TokenRefreshed))
            .unwrap();
        assert_eq!(state, IntegrationState::Connected);
    }

    #[test]
    fn test_revoked_requires_new_handshake() {
        let revoked = IntegrationState::TokenExpired
            .transition(StateEvent::GrantRevoked)
            .unwrap();
        assert_eq!(revoked, IntegrationState::TokenRevoked);
        assert!(!revoked.is_usable());
        assert!(revoked.transition(StateEvent::TokenRefreshed).is_err());
        assert_eq!(
            revoked.transition(StateEvent::BeginHandshake).unwrap(),
            IntegrationState::Connecting
        );
    }

    #[test]
    fn test_disconnected_is_terminal_until_handshake() {
        let state = IntegrationState::Connected
            .transition(StateEvent::Disconnect)
            .unwrap();
        assert_eq!(state, IntegrationState::Disconnected);
        assert!(state.transition(StateEvent::TokenExpired).is_err());
        assert!(state.transition(StateEvent::HandshakeCompleted).is_err());
        assert!(state.transition(StateEvent::BeginHandshake).is_ok());
    }

    #[test]
    fn test_illegal_transition_error() {
        let err = IntegrationState::Unconfigured
            .transition(StateEvent::TokenRefreshed)
            .unwrap_err();
        assert!(err.to_string().contains("unconfigured"));
    }

    #[test]
    fn test_round_trip_str() {
        for state in [
            IntegrationState::Unconfigured,
            IntegrationState::Connecting,
            IntegrationState::Connected,
            IntegrationState::TokenExpired,
            IntegrationState::TokenRevoked,
            IntegrationState::Disconnected,
        ] {
            assert_eq!(state.as_str().parse::<IntegrationState>().unwrap(), state);
        }
    }
}
