//! Client-side SIP message construction
//!
//! Requests are assembled from untyped rsip headers; the engines keep the
//! dialog bookkeeping (Call-ID, tags, CSeq) and pass it in explicitly.

use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use crate::domain::profile::SipProfile;
use rand::Rng;
use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;

const USER_AGENT: &str = concat!("sipua/", env!("CARGO_PKG_VERSION"));

/// Generate a Via branch parameter with the RFC 3261 magic cookie
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("z9hG4bK{:x}", random)
}

/// Generate a From/To tag
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("{:x}", random)
}

/// Generate a Call-ID scoped to the local domain
pub fn generate_call_id(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("{:x}@{}", random, domain)
}

/// Normalize a user-supplied call address into a SIP URI string.
pub fn normalize_address(address: &str) -> Result<String, SipError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(SipError::InvalidMessage("Empty call address".to_string()));
    }
    if address.starts_with("sip:") || address.starts_with("sips:") {
        Ok(address.to_string())
    } else {
        Ok(format!("sip:{}", address))
    }
}

/// In-dialog (or registration-session) identity shared by every request
/// the engines send.
#[derive(Debug, Clone)]
pub struct DialogIdentity {
    pub call_id: String,
    /// Full From header value including our tag
    pub from: String,
    /// Remote URI placed in To (and the request line for in-dialog requests)
    pub to_uri: String,
    /// Remote tag, present once the dialog is established
    pub to_tag: Option<String>,
}

impl DialogIdentity {
    fn to_value(&self) -> String {
        match &self.to_tag {
            Some(tag) => format!("<{}>;tag={}", self.to_uri, tag),
            None => format!("<{}>", self.to_uri),
        }
    }
}

fn base_headers(
    identity: &DialogIdentity,
    method: SipMethod,
    cseq: u32,
    branch: &str,
    local_addr: SocketAddr,
) -> Vec<Header> {
    vec![
        Header::Via(format!("SIP/2.0/UDP {};branch={}", local_addr, branch).into()),
        Header::MaxForwards("70".into()),
        Header::From(identity.from.clone().into()),
        Header::To(identity.to_value().into()),
        Header::CallId(identity.call_id.clone().into()),
        Header::CSeq(format!("{} {}", cseq, method.as_str()).into()),
        Header::UserAgent(USER_AGENT.into()),
    ]
}

fn finish_request(
    method: SipMethod,
    uri: &str,
    mut headers: Vec<Header>,
    body: Vec<u8>,
    content_type: Option<&str>,
) -> Result<SipRequest, SipError> {
    if let Some(ct) = content_type {
        headers.push(Header::ContentType(ct.into()));
    }
    headers.push(Header::ContentLength(body.len().to_string().into()));

    let uri: Uri = uri.to_string().try_into()?;

    Ok(SipRequest::new(Request {
        method: method.to_rsip(),
        uri,
        version: Version::V2,
        headers: Headers::from(headers),
        body,
    }))
}

/// Build a REGISTER request binding `profile` to its registrar.
#[allow(clippy::too_many_arguments)]
pub fn register_request(
    profile: &SipProfile,
    local_addr: SocketAddr,
    identity: &DialogIdentity,
    cseq: u32,
    expires: u32,
    authorization: Option<&str>,
) -> Result<SipRequest, SipError> {
    let request_uri = format!("sip:{}", profile.domain);
    let branch = generate_branch();

    let mut headers = base_headers(identity, SipMethod::Register, cseq, &branch, local_addr);
    headers.push(Header::Contact(
        format!("<sip:{}@{}>", profile.username, local_addr).into(),
    ));
    headers.push(Header::Expires(expires.to_string().into()));
    if let Some(value) = authorization {
        headers.push(Header::Authorization(value.into()));
    }

    finish_request(SipMethod::Register, &request_uri, headers, Vec::new(), None)
}

/// Build an INVITE (or re-INVITE when `to_tag` is already set on the
/// identity) carrying an SDP offer. Returns the request and its branch,
/// which the caller must retain for CANCEL.
pub fn invite_request(
    profile: &SipProfile,
    local_addr: SocketAddr,
    identity: &DialogIdentity,
    cseq: u32,
    sdp: &str,
) -> Result<(SipRequest, String), SipError> {
    let branch = generate_branch();

    let mut headers = base_headers(identity, SipMethod::Invite, cseq, &branch, local_addr);
    headers.push(Header::Contact(
        format!("<sip:{}@{}>", profile.username, local_addr).into(),
    ));

    let request = finish_request(
        SipMethod::Invite,
        &identity.to_uri,
        headers,
        sdp.as_bytes().to_vec(),
        Some("application/sdp"),
    )?;

    Ok((request, branch))
}

/// Build the ACK confirming a final INVITE response. A 2xx ACK gets a
/// fresh branch; a non-2xx ACK reuses the INVITE branch.
pub fn ack_request(
    identity: &DialogIdentity,
    local_addr: SocketAddr,
    invite_cseq: u32,
    branch: &str,
) -> Result<SipRequest, SipError> {
    let headers = base_headers(identity, SipMethod::Ack, invite_cseq, branch, local_addr);
    finish_request(SipMethod::Ack, &identity.to_uri, headers, Vec::new(), None)
}

/// Build a CANCEL for a pending INVITE. Mirrors the INVITE's branch and
/// CSeq number per RFC 3261 section 9.1.
pub fn cancel_request(
    identity: &DialogIdentity,
    local_addr: SocketAddr,
    invite_cseq: u32,
    invite_branch: &str,
) -> Result<SipRequest, SipError> {
    // CANCEL is addressed like the original request, before any To tag
    let untagged = DialogIdentity {
        to_tag: None,
        ..identity.clone()
    };
    let headers = base_headers(
        &untagged,
        SipMethod::Cancel,
        invite_cseq,
        invite_branch,
        local_addr,
    );
    finish_request(SipMethod::Cancel, &identity.to_uri, headers, Vec::new(), None)
}

/// Build an in-dialog BYE.
pub fn bye_request(
    identity: &DialogIdentity,
    local_addr: SocketAddr,
    cseq: u32,
) -> Result<SipRequest, SipError> {
    let branch = generate_branch();
    let headers = base_headers(identity, SipMethod::Bye, cseq, &branch, local_addr);
    finish_request(SipMethod::Bye, &identity.to_uri, headers, Vec::new(), None)
}

/// Build a response to an inbound request, copying the essential headers.
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    contact: Option<String>,
    extra_headers: Vec<Header>,
    body: Vec<u8>,
    content_type: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            contact: None,
            extra_headers: Vec::new(),
            body: Vec::new(),
            content_type: None,
        }
    }

    pub fn header(mut self, header: Header) -> Self {
        self.extra_headers.push(header);
        self
    }

    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn sdp_body(mut self, sdp: &str) -> Self {
        self.body = sdp.as_bytes().to_vec();
        self.content_type = Some("application/sdp".to_string());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers: Vec<Header> = Vec::new();

        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(_) => {
                    let value = request
                        .to_header()
                        .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;
                    let tagged = match (&self.to_tag, value.contains(";tag=")) {
                        (Some(tag), false) => format!("{};tag={}", value, tag),
                        _ => value,
                    };
                    headers.push(Header::To(tagged.into()));
                }
                _ => {}
            }
        }

        if let Some(contact) = &self.contact {
            headers.push(Header::Contact(contact.clone().into()));
        }
        headers.extend(self.extra_headers.iter().cloned());
        if let Some(ct) = &self.content_type {
            headers.push(Header::ContentType(ct.clone().into()));
        }
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        Ok(SipResponse::new(Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::{build_profile, UserProfile};
    use crate::sip::transport::TransportProtocol;

    fn profile() -> SipProfile {
        build_profile(&UserProfile {
            username: "alice".to_string(),
            domain: "example.com".to_string(),
            password: "secret".to_string(),
            port: 5060,
            protocol: TransportProtocol::Udp,
        })
        .unwrap()
    }

    fn identity() -> DialogIdentity {
        DialogIdentity {
            call_id: "abc@example.com".to_string(),
            from: "<sip:alice@example.com>;tag=ff00".to_string(),
            to_uri: "sip:alice@example.com".to_string(),
            to_tag: None,
        }
    }

    fn local() -> SocketAddr {
        "192.168.1.10:5060".parse().unwrap()
    }

    #[test]
    fn test_register_request() {
        let req =
            register_request(&profile(), local(), &identity(), 1, 3600, None).unwrap();

        let wire = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        assert!(wire.starts_with("REGISTER sip:example.com SIP/2.0\r\n"));
        assert!(wire.contains("CSeq: 1 REGISTER"));
        assert!(wire.contains("Expires: 3600"));
        assert!(wire.contains("branch=z9hG4bK"));
        assert!(wire.contains("Contact: <sip:alice@192.168.1.10:5060>"));
        assert!(!wire.contains("Authorization"));
    }

    #[test]
    fn test_register_request_with_authorization() {
        let req = register_request(
            &profile(),
            local(),
            &identity(),
            2,
            3600,
            Some(r#"Digest username="alice", realm="example.com""#),
        )
        .unwrap();

        let wire = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        assert!(wire.contains("CSeq: 2 REGISTER"));
        assert!(wire.contains(r#"Digest username="alice""#));
    }

    #[test]
    fn test_invite_and_cancel_share_branch() {
        let mut id = identity();
        id.to_uri = "sip:bob@example.com".to_string();

        let (invite, branch) =
            invite_request(&profile(), local(), &id, 1, "v=0\r\n").unwrap();
        let cancel = cancel_request(&id, local(), 1, &branch).unwrap();

        let invite_wire = String::from_utf8(invite.to_bytes().to_vec()).unwrap();
        let cancel_wire = String::from_utf8(cancel.to_bytes().to_vec()).unwrap();

        assert!(invite_wire.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
        assert!(invite_wire.contains("Content-Type: application/sdp"));
        assert!(cancel_wire.starts_with("CANCEL sip:bob@example.com SIP/2.0\r\n"));
        assert!(cancel_wire.contains("CSeq: 1 CANCEL"));
        assert!(cancel_wire.contains(&format!("branch={}", branch)));
    }

    #[test]
    fn test_bye_carries_remote_tag() {
        let mut id = identity();
        id.to_uri = "sip:bob@example.com".to_string();
        id.to_tag = Some("beef".to_string());

        let bye = bye_request(&id, local(), 2).unwrap();
        let wire = String::from_utf8(bye.to_bytes().to_vec()).unwrap();

        assert!(wire.starts_with("BYE sip:bob@example.com SIP/2.0\r\n"));
        assert!(wire.contains("To: <sip:bob@example.com>;tag=beef"));
        assert!(wire.contains("CSeq: 2 BYE"));
    }

    #[test]
    fn test_response_builder_adds_to_tag() {
        let data = b"INVITE sip:alice@example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKremote\r\n\
                     From: <sip:bob@example.com>;tag=remote1\r\n\
                     To: <sip:alice@example.com>\r\n\
                     Call-ID: in@example.com\r\n\
                     CSeq: 1 INVITE\r\n\
                     Content-Length: 0\r\n\r\n";
        let request = SipRequest::parse(data).unwrap();

        let response = ResponseBuilder::new(180)
            .to_tag("local1")
            .build_for_request(&request)
            .unwrap();

        let wire = String::from_utf8(response.to_bytes().to_vec()).unwrap();
        assert!(wire.starts_with("SIP/2.0 180 "));
        assert!(wire.contains("To: <sip:alice@example.com>;tag=local1"));
        assert!(wire.contains("Call-ID: in@example.com"));
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("bob@example.com").unwrap(),
            "sip:bob@example.com"
        );
        assert_eq!(
            normalize_address("sip:bob@example.com").unwrap(),
            "sip:bob@example.com"
        );
        assert!(normalize_address("  ").is_err());
    }

    #[test]
    fn test_branch_and_tags_are_unique() {
        assert_ne!(generate_branch(), generate_branch());
        assert_ne!(generate_tag(), generate_tag());
        assert!(generate_branch().starts_with("z9hG4bK"));
        assert!(generate_call_id("example.com").ends_with("@example.com"));
    }
}
