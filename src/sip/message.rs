//! SIP message types and parsing

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types used by the user-agent core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
        }
    }

    pub fn from_str_loose(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strip an untyped header's "Name: " prefix if present.
/// rsip's untyped header .to_string() may include the header name.
fn strip_header_prefix(value: String, name: &str) -> String {
    match value.strip_prefix(&format!("{}: ", name)) {
        Some(v) => v.to_string(),
        None => value,
    }
}

/// Extract the `tag` parameter from a From/To header value.
fn extract_tag(header_value: &str) -> Option<String> {
    header_value.split(';').find_map(|p| {
        let p = p.trim();
        p.strip_prefix("tag=").map(|t| t.to_string())
    })
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(strip_header_prefix(cid.to_string(), "Call-ID")),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.seq().ok().and_then(|s| s.to_string().parse().ok()),
            _ => None,
        })
    }

    pub fn from_header(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => Some(strip_header_prefix(from.to_string(), "From")),
            _ => None,
        })
    }

    pub fn to_header(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => Some(strip_header_prefix(to.to_string(), "To")),
            _ => None,
        })
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|v| extract_tag(&v))
    }

    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(e) => strip_header_prefix(e.to_string(), "Expires")
                .trim()
                .parse()
                .ok(),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(strip_header_prefix(cid.to_string(), "Call-ID")),
            _ => None,
        })
    }

    /// Method echoed in the CSeq header; used to route responses to the
    /// registration or call engine.
    pub fn cseq_method(&self) -> Option<SipMethod> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => {
                let value = strip_header_prefix(cseq.to_string(), "CSeq");
                value
                    .split_whitespace()
                    .nth(1)
                    .and_then(SipMethod::from_str_loose)
            }
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.seq().ok().and_then(|s| s.to_string().parse().ok()),
            _ => None,
        })
    }

    pub fn to_tag(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => extract_tag(&strip_header_prefix(to.to_string(), "To")),
            _ => None,
        })
    }

    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(e) => strip_header_prefix(e.to_string(), "Expires")
                .trim()
                .parse()
                .ok(),
            _ => None,
        })
    }

    /// WWW-Authenticate or Proxy-Authenticate challenge value, if any.
    pub fn authenticate_challenge(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::WwwAuthenticate(v) => {
                Some(strip_header_prefix(v.to_string(), "WWW-Authenticate"))
            }
            Header::ProxyAuthenticate(v) => {
                Some(strip_header_prefix(v.to_string(), "Proxy-Authenticate"))
            }
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(
            req.call_id(),
            Some("a84b4c76e66710@pc33.example.com".to_string())
        );
        assert_eq!(req.cseq(), Some(314159));
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 1800\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.cseq_method(), Some(SipMethod::Register));
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
        assert_eq!(resp.expires(), Some(1800));
    }

    #[test]
    fn test_parse_challenge_response() {
        let data = b"SIP/2.0 401 Unauthorized\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 1 REGISTER\r\n\
                     WWW-Authenticate: Digest realm=\"example.com\", nonce=\"abc123\", algorithm=MD5, qop=\"auth\"\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 401);

        let challenge = resp.authenticate_challenge().unwrap();
        assert!(challenge.contains("realm=\"example.com\""));
        assert!(challenge.contains("nonce=\"abc123\""));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(SipMessage::parse(b"not a sip message at all\r\n\r\n").is_err());
    }
}
