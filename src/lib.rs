//! sipua - A portable SIP user-agent client core
//!
//! Registration with digest authentication and background renewal, a
//! single-call INVITE dialog with hold and teardown, and an ordered
//! event stream for observers. All SIP state lives in one engine task;
//! the [`SipUserAgent`] handle is the only public entry point and is
//! safe to clone across tasks.

pub mod config;
pub mod domain;
pub mod engine;
pub mod sip;

// Re-export commonly used types
pub use config::Config;
pub use domain::call::{CallDirection, CallHandle, CallProgress};
pub use domain::error::{CallError, CoreError, RegistrationError, ValidationError};
pub use domain::event::{Event, EventKind, EventMeta};
pub use domain::profile::{build_profile, CredentialStore, SipProfile, UserProfile};
pub use domain::registration::RegistrationState;
pub use engine::notifier::{EventStream, SubscriberId};
pub use engine::SipUserAgent;
pub use sip::transport::{
    IncomingMessage, OutgoingMessage, Transport, TransportProtocol, UdpTransport,
};
