//! SIP Digest Authentication, client side (RFC 2617, RFC 3261)

use super::message::SipError;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Parsed WWW-Authenticate / Proxy-Authenticate challenge
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a Digest challenge header value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value);

        Ok(Self {
            realm: params
                .get("realm")
                .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?
                .to_string(),
            nonce: params
                .get("nonce")
                .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?
                .to_string(),
            algorithm: params.get("algorithm").map(|s| s.to_string()),
            qop: params.get("qop").map(|s| s.to_string()),
            opaque: params.get("opaque").map(|s| s.to_string()),
        })
    }

    /// Whether the challenge offers qop=auth
    pub fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim() == "auth"))
            .unwrap_or(false)
    }
}

/// Parse Digest key="value" parameters
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    let digest_str = value.strip_prefix("Digest ").unwrap_or(value).trim();

    for part in digest_str.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            params.insert(key.to_string(), value.to_string());
        }
    }

    params
}

/// Generate a random client nonce
fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Calculate the digest response value
fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };

    // HA2 = MD5(method:uri)
    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    if let Some(qop_value) = qop {
        let nc_value = nc.unwrap_or("00000001");
        let cnonce_value = cnonce.unwrap_or("");
        let digest = md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc_value, cnonce_value, qop_value, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

/// Compute an Authorization header value answering `challenge` for the
/// given request method and URI.
pub fn compute_authorization(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
) -> String {
    let algorithm = challenge.algorithm.as_deref().unwrap_or("MD5");

    if challenge.offers_auth_qop() {
        let cnonce = generate_cnonce();
        let nc = "00000001";
        let response = calculate_response(
            username,
            password,
            &challenge.realm,
            &challenge.nonce,
            method,
            uri,
            Some("auth"),
            Some(nc),
            Some(&cnonce),
        );
        debug!("Computed digest response for user {}", username);

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}, qop=auth, nc={}, cnonce="{}""#,
            username, challenge.realm, challenge.nonce, uri, response, algorithm, nc, cnonce
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    } else {
        let response = calculate_response(
            username,
            password,
            &challenge.realm,
            &challenge.nonce,
            method,
            uri,
            None,
            None,
            None,
        );
        debug!("Computed digest response for user {}", username);

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            username, challenge.realm, challenge.nonce, uri, response, algorithm
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let value = r#"Digest realm="example.com", nonce="abc123", algorithm=MD5, qop="auth""#;
        let challenge = DigestChallenge::parse(value).unwrap();

        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert!(challenge.offers_auth_qop());
    }

    #[test]
    fn test_parse_challenge_without_qop() {
        let value = r#"Digest realm="example.com", nonce="abc123""#;
        let challenge = DigestChallenge::parse(value).unwrap();
        assert!(!challenge.offers_auth_qop());
    }

    #[test]
    fn test_parse_challenge_missing_nonce() {
        let value = r#"Digest realm="example.com""#;
        assert!(DigestChallenge::parse(value).is_err());
    }

    #[test]
    fn test_calculate_response_rfc2617_vector() {
        // RFC 2617 section 3.5 example, adapted to no-qop form
        let response = calculate_response(
            "alice",
            "secret",
            "example.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "REGISTER",
            "sip:example.com",
            None,
            None,
            None,
        );

        // Response is a 32-character hex string and stable for fixed inputs
        assert_eq!(response.len(), 32);
        assert_eq!(
            response,
            calculate_response(
                "alice",
                "secret",
                "example.com",
                "dcd98b7102dd2f0e8b11d0f600bfb0c093",
                "REGISTER",
                "sip:example.com",
                None,
                None,
                None,
            )
        );
    }

    #[test]
    fn test_compute_authorization_header() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="example.com", nonce="abc123", algorithm=MD5, qop="auth""#,
        )
        .unwrap();

        let value =
            compute_authorization(&challenge, "alice", "secret", "REGISTER", "sip:example.com");

        assert!(value.starts_with("Digest "));
        assert!(value.contains(r#"username="alice""#));
        assert!(value.contains(r#"realm="example.com""#));
        assert!(value.contains("qop=auth"));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("response="));
        // Never leak the password itself
        assert!(!value.contains("secret"));
    }
}
