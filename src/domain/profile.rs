//! SIP account profiles and validation

use super::error::ValidationError;
use crate::sip::transport::TransportProtocol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SIP account credentials and transport settings as supplied by the
/// application layer. Immutable once handed to an open registration.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub domain: String,
    pub password: String,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProfile")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"***REDACTED***")
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Canonical, validated form of a profile. Read-only after creation and
/// never carries the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipProfile {
    pub username: String,
    pub domain: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    /// Address of record, e.g. `sip:alice@example.com`
    pub uri: String,
}

impl SipProfile {
    /// Host and port of the registrar implied by this profile.
    pub fn registrar_host(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }
}

/// Validate a user profile and derive its canonical representation.
///
/// Pure and deterministic: the same profile always yields the same
/// `SipProfile`, and nothing is sent or stored.
pub fn build_profile(profile: &UserProfile) -> Result<SipProfile, ValidationError> {
    if profile.username.is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    if profile.username.contains(char::is_whitespace) {
        return Err(ValidationError::InvalidUsername);
    }
    if profile.domain.is_empty() {
        return Err(ValidationError::EmptyDomain);
    }
    if profile.domain.contains(char::is_whitespace) {
        return Err(ValidationError::InvalidDomain);
    }
    if profile.port == 0 {
        return Err(ValidationError::InvalidPort);
    }

    let uri = if profile.port == profile.protocol.default_port() {
        format!("sip:{}@{}", profile.username, profile.domain)
    } else {
        format!("sip:{}@{}:{}", profile.username, profile.domain, profile.port)
    };

    Ok(SipProfile {
        username: profile.username.clone(),
        domain: profile.domain.clone(),
        port: profile.port,
        protocol: profile.protocol,
        uri,
    })
}

/// Supplies the account password on demand for digest computation.
/// The engine consults this only while answering a 401/407 challenge.
pub trait CredentialStore: Send + Sync {
    fn password_for(&self, username: &str, realm: &str) -> Option<String>;
}

/// Credential store backed by a single in-memory secret.
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl CredentialStore for StaticCredentials {
    fn password_for(&self, username: &str, _realm: &str) -> Option<String> {
        if username == self.username {
            Some(self.password.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UserProfile {
        UserProfile {
            username: "alice".to_string(),
            domain: "example.com".to_string(),
            password: "secret".to_string(),
            port: 5060,
            protocol: TransportProtocol::Udp,
        }
    }

    #[test]
    fn test_build_profile() {
        let sip = build_profile(&profile()).unwrap();
        assert_eq!(sip.uri, "sip:alice@example.com");
        assert_eq!(sip.registrar_host(), "example.com:5060");
    }

    #[test]
    fn test_build_profile_non_default_port() {
        let mut p = profile();
        p.port = 5070;
        let sip = build_profile(&p).unwrap();
        assert_eq!(sip.uri, "sip:alice@example.com:5070");
    }

    #[test]
    fn test_build_profile_is_deterministic() {
        let p = profile();
        assert_eq!(build_profile(&p).unwrap(), build_profile(&p).unwrap());
    }

    #[test]
    fn test_rejects_empty_fields() {
        let mut p = profile();
        p.username = String::new();
        assert_eq!(build_profile(&p), Err(ValidationError::EmptyUsername));

        let mut p = profile();
        p.domain = String::new();
        assert_eq!(build_profile(&p), Err(ValidationError::EmptyDomain));

        let mut p = profile();
        p.port = 0;
        assert_eq!(build_profile(&p), Err(ValidationError::InvalidPort));
    }

    #[test]
    fn test_rejects_whitespace() {
        let mut p = profile();
        p.domain = "exa mple.com".to_string();
        assert_eq!(build_profile(&p), Err(ValidationError::InvalidDomain));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", profile());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_static_credentials() {
        let store = StaticCredentials::new("alice", "secret");
        assert_eq!(store.password_for("alice", "example.com"), Some("secret".to_string()));
        assert_eq!(store.password_for("bob", "example.com"), None);
    }
}
