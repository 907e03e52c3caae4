//! Call progress state machine and call identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque handle identifying one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(Uuid);

impl CallHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We received the INVITE
    Inbound,
    /// We sent the INVITE
    Outbound,
}

/// Progress of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallProgress {
    /// No signaling yet
    Idle,
    /// Outbound INVITE sent, no final response
    Calling,
    /// Remote is being alerted (outbound 180/183) or we are alerting (inbound)
    Ringing,
    /// Call established, media flowing
    Active,
    /// Call on hold by the local party
    Held,
    /// Call ended (terminal)
    Ended,
}

impl CallProgress {
    /// Check if a state transition is valid
    pub fn can_transition_to(&self, new_state: &CallProgress) -> bool {
        use CallProgress::*;

        match (self, new_state) {
            // Any live state may end on BYE/CANCEL/error from either party
            (Idle | Calling | Ringing | Active | Held, Ended) => true,

            (Idle, Calling) => true,
            (Idle, Ringing) => true,
            (Calling, Ringing) => true,
            (Calling, Active) => true,
            (Ringing, Active) => true,
            (Active, Held) => true,
            (Held, Active) => true,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallProgress::Ended)
    }

    /// Established states in which media-path control (hold) is allowed
    pub fn is_established(&self) -> bool {
        matches!(self, CallProgress::Active | CallProgress::Held)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallProgress::Idle => "Idle",
            CallProgress::Calling => "Calling",
            CallProgress::Ringing => "Ringing",
            CallProgress::Active => "Active",
            CallProgress::Held => "Held",
            CallProgress::Ended => "Ended",
        }
    }
}
