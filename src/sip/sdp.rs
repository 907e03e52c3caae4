//! Minimal audio SDP offers and hold/resume direction rewriting

use rand::Rng;
use std::net::IpAddr;

/// Media direction advertised in an SDP body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn attribute(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "a=sendrecv",
            MediaDirection::SendOnly => "a=sendonly",
            MediaDirection::RecvOnly => "a=recvonly",
            MediaDirection::Inactive => "a=inactive",
        }
    }
}

/// Build a minimal PCMU/PCMA audio offer.
pub fn audio_offer(local_ip: IpAddr, audio_port: u16) -> String {
    let mut rng = rand::thread_rng();
    let session_id: u32 = rng.gen();

    format!(
        "v=0\r\n\
         o=- {sid} {sid} IN IP4 {ip}\r\n\
         s=sipua\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 0 8\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=sendrecv\r\n",
        sid = session_id,
        ip = local_ip,
        port = audio_port
    )
}

/// Rewrite the direction attribute of an existing SDP body, used for
/// hold (sendonly) and resume (sendrecv) re-INVITEs.
pub fn with_direction(sdp: &str, direction: MediaDirection) -> String {
    let mut result = Vec::new();
    let mut replaced = false;

    for line in sdp.lines() {
        if line.starts_with("a=sendrecv")
            || line.starts_with("a=sendonly")
            || line.starts_with("a=recvonly")
            || line.starts_with("a=inactive")
        {
            result.push(direction.attribute().to_string());
            replaced = true;
        } else {
            result.push(line.to_string());
        }
    }

    if !replaced {
        result.push(direction.attribute().to_string());
    }

    let mut joined = result.join("\r\n");
    joined.push_str("\r\n");
    joined
}

/// Detect the direction attribute of an SDP body. Absence of any
/// direction attribute means sendrecv per RFC 3264.
pub fn detect_direction(sdp: &str) -> MediaDirection {
    if sdp.contains("a=inactive") {
        MediaDirection::Inactive
    } else if sdp.contains("a=sendonly") {
        MediaDirection::SendOnly
    } else if sdp.contains("a=recvonly") {
        MediaDirection::RecvOnly
    } else {
        MediaDirection::SendRecv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_offer_shape() {
        let sdp = audio_offer("192.168.1.10".parse().unwrap(), 5004);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.10"));
        assert!(sdp.contains("m=audio 5004 RTP/AVP 0 8"));
        assert!(sdp.contains("a=sendrecv"));
    }

    #[test]
    fn test_hold_rewrite() {
        let sdp = audio_offer("192.168.1.10".parse().unwrap(), 5004);

        let held = with_direction(&sdp, MediaDirection::SendOnly);
        assert!(held.contains("a=sendonly"));
        assert!(!held.contains("a=sendrecv"));

        let resumed = with_direction(&held, MediaDirection::SendRecv);
        assert!(resumed.contains("a=sendrecv"));
        assert!(!resumed.contains("a=sendonly"));
    }

    #[test]
    fn test_rewrite_appends_when_absent() {
        let sdp = "v=0\r\nm=audio 5004 RTP/AVP 0\r\n";
        let held = with_direction(sdp, MediaDirection::SendOnly);
        assert!(held.contains("a=sendonly"));
    }

    #[test]
    fn test_detect_direction() {
        assert_eq!(
            detect_direction("v=0\r\na=sendonly\r\n"),
            MediaDirection::SendOnly
        );
        assert_eq!(
            detect_direction("v=0\r\na=inactive\r\n"),
            MediaDirection::Inactive
        );
        assert_eq!(detect_direction("v=0\r\n"), MediaDirection::SendRecv);
    }
}
