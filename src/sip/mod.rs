//! SIP protocol plumbing: messages, construction, authentication, transport

pub mod auth;
pub mod builder;
pub mod message;
pub mod sdp;
pub mod transport;
