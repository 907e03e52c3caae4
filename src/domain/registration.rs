//! Registration state value object

use serde::{Deserialize, Serialize};

/// State of the binding between the local profile and the registrar.
/// Owned exclusively by the registration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No binding exists
    Unregistered,
    /// REGISTER in flight
    Registering,
    /// Registrar accepted the binding
    Registered,
    /// Refresh timer fired, re-registration about to start
    Expiring,
    /// Registration failed terminally
    Failed(String),
}

impl RegistrationState {
    /// Check if a state transition is valid
    pub fn can_transition_to(&self, new_state: &RegistrationState) -> bool {
        use RegistrationState::*;

        match (self, new_state) {
            // close() may be called in any state
            (_, Unregistered) => true,

            (Unregistered, Registering) => true,
            // re-open after a failed attempt
            (Failed(_), Registering) => true,
            (Registering, Registered) => true,
            (Registering, Failed(_)) => true,
            (Registered, Expiring) => true,
            (Expiring, Registering) => true,
            (Expiring, Failed(_)) => true,
            // refresh rejected by the registrar
            (Registered, Failed(_)) => true,

            _ => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::Registering => "Registering",
            RegistrationState::Registered => "Registered",
            RegistrationState::Expiring => "Expiring",
            RegistrationState::Failed(_) => "Failed",
        }
    }
}
