//! Error taxonomy

use thiserror::Error;

/// Local profile validation failures. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Username must not be empty")]
    EmptyUsername,

    #[error("Username must not contain whitespace")]
    InvalidUsername,

    #[error("Domain must not be empty")]
    EmptyDomain,

    #[error("Domain must not contain whitespace")]
    InvalidDomain,

    #[error("Port must be in range 1..=65535")]
    InvalidPort,
}

/// Registration lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(#[from] ValidationError),

    #[error("Already registered with a different profile, close first")]
    AlreadyOpen,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Registration timed out")]
    Timeout,

    #[error("Registrar rejected registration with status {0}")]
    ServerRejected(u16),

    #[error("Registration cancelled")]
    Cancelled,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Engine unavailable: {0}")]
    Engine(String),
}

/// Call control failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Not registered")]
    NotRegistered,

    #[error("No call is in progress")]
    NoActiveCall,

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("Invalid call address: {0}")]
    InvalidAddress(String),

    #[error("Remote party rejected the call with status {0}")]
    RemoteRejected(u16),

    #[error("Call operation timed out")]
    Timeout,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Engine unavailable: {0}")]
    Engine(String),
}

/// Engine startup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Platform transport does not support SIP telephony")]
    UnsupportedPlatform,

    #[error("Engine unavailable: {0}")]
    Engine(String),
}
