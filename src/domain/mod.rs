//! Domain model: profiles, registration and call state, events, errors

pub mod call;
pub mod error;
pub mod event;
pub mod profile;
pub mod registration;
