//! Single-call INVITE dialog: setup, answer, hold/resume, teardown

use super::{schedule_timer, TimerEvent};
use crate::config::Config;
use crate::domain::call::{CallDirection, CallHandle, CallProgress};
use crate::domain::error::CallError;
use crate::domain::event::Event;
use crate::domain::profile::SipProfile;
use crate::engine::notifier::EventNotifier;
use crate::sip::builder::{
    ack_request, bye_request, cancel_request, generate_branch, generate_call_id, generate_tag,
    invite_request, normalize_address, DialogIdentity, ResponseBuilder,
};
use crate::sip::message::{SipMethod, SipRequest, SipResponse};
use crate::sip::sdp::{self, MediaDirection};
use crate::sip::transport::{OutgoingMessage, Transport, TransportProtocol};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A hold or resume re-INVITE awaiting its final response.
struct PendingReinvite {
    hold: bool,
    cseq: u32,
    branch: String,
    reply: oneshot::Sender<Result<(), CallError>>,
}

/// Everything the engine tracks for the one live call.
struct CallSession {
    handle: CallHandle,
    direction: CallDirection,
    progress: CallProgress,
    profile: SipProfile,
    identity: DialogIdentity,
    remote_addr: SocketAddr,
    protocol: TransportProtocol,
    /// Our outgoing CSeq within the dialog
    cseq: u32,
    invite_cseq: u32,
    invite_branch: String,
    /// Tag we placed in From (outbound) or To (inbound)
    local_tag: String,
    local_sdp: String,
    muted: bool,
    speaker: bool,
    pending_reinvite: Option<PendingReinvite>,
    /// Original INVITE of an inbound call, kept until answered
    incoming_invite: Option<SipRequest>,
}

pub(crate) struct CallEngine {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    timer_tx: mpsc::Sender<TimerEvent>,
    session: Option<CallSession>,
    generation: u64,
}

impl CallEngine {
    pub(crate) fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        timer_tx: mpsc::Sender<TimerEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            timer_tx,
            session: None,
            generation: 0,
        }
    }

    /// Place an outbound call. The reply resolves as soon as the INVITE
    /// is on the wire; progress is reported through events.
    pub(crate) async fn make_call(
        &mut self,
        address: &str,
        profile: &SipProfile,
        registrar: SocketAddr,
        notifier: &mut EventNotifier,
        reply: oneshot::Sender<Result<CallHandle, CallError>>,
    ) {
        if self.session.is_some() {
            let _ = reply.send(Err(CallError::CallInProgress));
            return;
        }

        let to_uri = match normalize_address(address) {
            Ok(uri) => uri,
            Err(_) => {
                let _ = reply.send(Err(CallError::InvalidAddress(address.to_string())));
                return;
            }
        };

        let local_addr = self.transport.local_addr();
        let local_sdp = sdp::audio_offer(local_addr.ip(), self.config.sip.audio_port);
        let local_tag = generate_tag();
        let identity = DialogIdentity {
            call_id: generate_call_id(&profile.domain),
            from: format!("<{}>;tag={}", profile.uri, local_tag),
            to_uri,
            to_tag: None,
        };

        let (request, branch) = match invite_request(profile, local_addr, &identity, 1, &local_sdp)
        {
            Ok(built) => built,
            Err(e) => {
                let _ = reply.send(Err(CallError::Engine(e.to_string())));
                return;
            }
        };

        let outgoing = OutgoingMessage {
            data: request.to_bytes(),
            destination: registrar,
            protocol: profile.protocol,
        };
        if let Err(e) = self.transport.send(outgoing).await {
            let _ = reply.send(Err(CallError::TransportFailure(e.to_string())));
            return;
        }

        let handle = CallHandle::generate();
        info!(call = %handle, to = %identity.to_uri, "Outbound call started");

        let mut session = CallSession {
            handle,
            direction: CallDirection::Outbound,
            progress: CallProgress::Idle,
            profile: profile.clone(),
            identity,
            remote_addr: registrar,
            protocol: profile.protocol,
            cseq: 1,
            invite_cseq: 1,
            invite_branch: branch,
            local_tag,
            local_sdp,
            muted: false,
            speaker: false,
            pending_reinvite: None,
            incoming_invite: None,
        };
        transition(&mut session, CallProgress::Calling, notifier);

        self.generation += 1;
        schedule_timer(
            &self.timer_tx,
            self.config.timers.call_setup_timeout(),
            TimerEvent::CallSetupTimeout {
                generation: self.generation,
            },
        );

        self.session = Some(session);
        let _ = reply.send(Ok(handle));
    }

    /// Answer a ringing inbound call with 200 OK.
    pub(crate) async fn accept(
        &mut self,
        handle: CallHandle,
        notifier: &mut EventNotifier,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let Some(mut session) = self.session.take() else {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        };
        if session.handle != handle
            || session.direction != CallDirection::Inbound
            || session.progress != CallProgress::Ringing
        {
            self.session = Some(session);
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        }
        let Some(invite) = session.incoming_invite.clone() else {
            self.session = Some(session);
            let _ = reply.send(Err(CallError::Engine("missing stored INVITE".into())));
            return;
        };

        let local_addr = self.transport.local_addr();
        let contact = format!("<sip:{}@{}>", session.profile.username, local_addr);
        let response = ResponseBuilder::new(200)
            .to_tag(&session.local_tag)
            .contact(contact)
            .sdp_body(&session.local_sdp)
            .build_for_request(&invite);
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.session = Some(session);
                let _ = reply.send(Err(CallError::Engine(e.to_string())));
                return;
            }
        };

        let outgoing = OutgoingMessage {
            data: response.to_bytes(),
            destination: session.remote_addr,
            protocol: session.protocol,
        };
        if let Err(e) = self.transport.send(outgoing).await {
            self.session = Some(session);
            let _ = reply.send(Err(CallError::TransportFailure(e.to_string())));
            return;
        }

        info!(call = %handle, "Inbound call answered");
        transition(&mut session, CallProgress::Active, notifier);
        self.session = Some(session);
        let _ = reply.send(Ok(()));
    }

    /// Decline a ringing inbound call with 486 Busy Here.
    pub(crate) async fn reject(
        &mut self,
        handle: CallHandle,
        notifier: &mut EventNotifier,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let Some(mut session) = self.session.take() else {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        };
        if session.handle != handle
            || session.direction != CallDirection::Inbound
            || session.progress != CallProgress::Ringing
        {
            self.session = Some(session);
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        }

        info!(call = %handle, "Inbound call declined");
        if let Some(invite) = session.incoming_invite.clone() {
            self.respond_to(&invite, 486, Some(&session.local_tag), session.remote_addr, session.protocol)
                .await;
        }
        self.generation += 1;
        transition(&mut session, CallProgress::Ended, notifier);
        let _ = reply.send(Ok(()));
        // session dropped
    }

    /// Terminate the call whatever its stage: BYE when established,
    /// CANCEL for a pending outbound INVITE, 486 for an unanswered
    /// inbound one.
    pub(crate) async fn end_call(
        &mut self,
        handle: CallHandle,
        notifier: &mut EventNotifier,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let Some(mut session) = self.session.take() else {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        };
        if session.handle != handle {
            self.session = Some(session);
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        }

        if let Err(e) = self.send_teardown(&mut session).await {
            self.session = Some(session);
            let _ = reply.send(Err(e));
            return;
        }

        info!(call = %handle, "Call ended locally");
        self.generation += 1;
        if let Some(pending) = session.pending_reinvite.take() {
            let _ = pending.reply.send(Err(CallError::Engine("call ended".into())));
        }
        transition(&mut session, CallProgress::Ended, notifier);
        let _ = reply.send(Ok(()));
    }

    /// Hold (`on = true`) or resume via a re-INVITE rewriting the SDP
    /// direction. The reply resolves on the re-INVITE's final response.
    pub(crate) async fn hold(
        &mut self,
        handle: CallHandle,
        on: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        };
        if session.handle != handle || !session.progress.is_established() {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        }
        if session.pending_reinvite.is_some() {
            let _ = reply.send(Err(CallError::Engine("re-INVITE already in progress".into())));
            return;
        }
        let already_there = (on && session.progress == CallProgress::Held)
            || (!on && session.progress == CallProgress::Active);
        if already_there {
            let _ = reply.send(Ok(()));
            return;
        }

        let direction = if on {
            MediaDirection::SendOnly
        } else {
            MediaDirection::SendRecv
        };
        let sdp = sdp::with_direction(&session.local_sdp, direction);

        session.cseq += 1;
        let built = invite_request(
            &session.profile,
            self.transport.local_addr(),
            &session.identity,
            session.cseq,
            &sdp,
        );
        let (request, branch) = match built {
            Ok(built) => built,
            Err(e) => {
                let _ = reply.send(Err(CallError::Engine(e.to_string())));
                return;
            }
        };

        let outgoing = OutgoingMessage {
            data: request.to_bytes(),
            destination: session.remote_addr,
            protocol: session.protocol,
        };
        if let Err(e) = self.transport.send(outgoing).await {
            let _ = reply.send(Err(CallError::TransportFailure(e.to_string())));
            return;
        }

        debug!(call = %handle, hold = on, "re-INVITE sent");
        session.local_sdp = sdp;
        session.pending_reinvite = Some(PendingReinvite {
            hold: on,
            cseq: session.cseq,
            branch,
            reply,
        });

        self.generation += 1;
        schedule_timer(
            &self.timer_tx,
            self.config.timers.reinvite_timeout(),
            TimerEvent::ReinviteTimeout {
                generation: self.generation,
            },
        );
    }

    /// Local microphone flag. Signaling is untouched; the media layer
    /// reads this when wiring audio.
    pub(crate) fn set_mute(
        &mut self,
        handle: CallHandle,
        muted: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let result = match self.session.as_mut() {
            Some(session) if session.handle == handle && !session.progress.is_terminal() => {
                session.muted = muted;
                debug!(call = %handle, muted = session.muted, "Mute flag updated");
                Ok(())
            }
            _ => Err(CallError::NoActiveCall),
        };
        let _ = reply.send(result);
    }

    /// Local speaker-route flag, same contract as mute.
    pub(crate) fn set_speaker(
        &mut self,
        handle: CallHandle,
        speaker: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        let result = match self.session.as_mut() {
            Some(session) if session.handle == handle && !session.progress.is_terminal() => {
                session.speaker = speaker;
                debug!(call = %handle, speaker = session.speaker, "Speaker flag updated");
                Ok(())
            }
            _ => Err(CallError::NoActiveCall),
        };
        let _ = reply.send(result);
    }

    pub(crate) async fn on_response(&mut self, resp: &SipResponse, notifier: &mut EventNotifier) {
        let matches_session = self
            .session
            .as_ref()
            .map(|s| resp.call_id().as_deref() == Some(s.identity.call_id.as_str()))
            .unwrap_or(false);
        if !matches_session {
            debug!("Discarding call response for unknown Call-ID");
            return;
        }

        match resp.cseq_method() {
            Some(SipMethod::Invite) => self.on_invite_response(resp, notifier).await,
            Some(SipMethod::Bye) | Some(SipMethod::Cancel) => {
                debug!(status = resp.status_code(), "Teardown response received");
            }
            other => debug!(?other, "Ignoring response"),
        }
    }

    async fn on_invite_response(&mut self, resp: &SipResponse, notifier: &mut EventNotifier) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let status = resp.status_code();

        let is_reinvite = session
            .pending_reinvite
            .as_ref()
            .map(|p| resp.cseq() == Some(p.cseq))
            .unwrap_or(false);
        if is_reinvite {
            self.on_reinvite_response(&mut session, resp, notifier).await;
            if !session.progress.is_terminal() {
                self.session = Some(session);
            }
            return;
        }

        if session.direction != CallDirection::Outbound
            || resp.cseq() != Some(session.invite_cseq)
        {
            debug!(status, "Ignoring INVITE response outside setup");
            self.session = Some(session);
            return;
        }

        match status {
            180 | 183 => {
                transition(&mut session, CallProgress::Ringing, notifier);
                self.session = Some(session);
            }
            100..=199 => {
                self.session = Some(session);
            }
            200..=299 => {
                session.identity.to_tag = resp.to_tag();
                self.generation += 1;
                self.send_ack(&session, session.invite_cseq, &generate_branch())
                    .await;
                info!(call = %session.handle, "Call answered");
                transition(&mut session, CallProgress::Active, notifier);
                self.session = Some(session);
            }
            _ => {
                // Final rejection: ACK it and surface the failure
                session.identity.to_tag = resp.to_tag();
                let branch = session.invite_branch.clone();
                self.send_ack(&session, session.invite_cseq, &branch).await;
                self.fail_call(&mut session, CallError::RemoteRejected(status), notifier);
            }
        }
    }

    async fn on_reinvite_response(
        &mut self,
        session: &mut CallSession,
        resp: &SipResponse,
        notifier: &mut EventNotifier,
    ) {
        let status = resp.status_code();
        match status {
            100..=199 => {}
            200..=299 => {
                if let Some(pending) = session.pending_reinvite.take() {
                    self.generation += 1;
                    self.send_ack(session, pending.cseq, &generate_branch())
                        .await;
                    let target = if pending.hold {
                        CallProgress::Held
                    } else {
                        CallProgress::Active
                    };
                    transition(session, target, notifier);
                    let _ = pending.reply.send(Ok(()));
                }
            }
            _ => {
                if let Some(pending) = session.pending_reinvite.take() {
                    self.generation += 1;
                    warn!(status, "re-INVITE rejected, call stays in its current state");
                    self.send_ack(session, pending.cseq, &pending.branch).await;
                    let _ = pending.reply.send(Err(CallError::RemoteRejected(status)));
                }
            }
        }
    }

    /// Dispatch an inbound request. `registered_profile` is `Some` only
    /// while a registration is active; without one, new INVITEs get 480.
    pub(crate) async fn on_request(
        &mut self,
        req: &SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        registered_profile: Option<&SipProfile>,
        notifier: &mut EventNotifier,
    ) {
        match req.method() {
            Some(SipMethod::Invite) => {
                self.on_invite_request(req, source, protocol, registered_profile, notifier)
                    .await;
            }
            Some(SipMethod::Ack) => debug!("ACK received"),
            Some(SipMethod::Bye) => self.on_bye(req, source, protocol, notifier).await,
            Some(SipMethod::Cancel) => self.on_cancel(req, source, protocol, notifier).await,
            other => {
                debug!(?other, "Discarding unsupported request");
            }
        }
    }

    async fn on_invite_request(
        &mut self,
        req: &SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        registered_profile: Option<&SipProfile>,
        notifier: &mut EventNotifier,
    ) {
        if let Some(session) = self.session.as_ref() {
            if req.call_id().as_deref() == Some(session.identity.call_id.as_str()) {
                // Remote hold/resume; answer with our current SDP
                let remote_direction =
                    sdp::detect_direction(&String::from_utf8_lossy(req.body()));
                debug!(?remote_direction, "Remote re-INVITE");
                let sdp = session.local_sdp.clone();
                let tag = session.local_tag.clone();
                let response = ResponseBuilder::new(200)
                    .to_tag(&tag)
                    .sdp_body(&sdp)
                    .build_for_request(req);
                self.send_built(response, source, protocol).await;
                return;
            }
            warn!("Rejecting INVITE while another call is in progress");
            self.respond_to(req, 486, Some(&generate_tag()), source, protocol)
                .await;
            return;
        }

        let Some(profile) = registered_profile else {
            info!("Rejecting INVITE while unregistered");
            self.respond_to(req, 480, Some(&generate_tag()), source, protocol)
                .await;
            return;
        };

        let local_tag = generate_tag();
        let from_value = match req.to_header() {
            Some(value) if !value.contains(";tag=") => format!("{};tag={}", value, local_tag),
            Some(value) => value,
            None => format!("<{}>;tag={}", profile.uri, local_tag),
        };
        let identity = DialogIdentity {
            call_id: req
                .call_id()
                .unwrap_or_else(|| generate_call_id(&profile.domain)),
            from: from_value,
            to_uri: req
                .from_header()
                .map(|v| uri_from_name_addr(&v))
                .unwrap_or_default(),
            to_tag: req.from_tag(),
        };

        let handle = CallHandle::generate();
        info!(call = %handle, from = %identity.to_uri, "Inbound call ringing");

        let local_addr = self.transport.local_addr();
        let local_sdp = sdp::audio_offer(local_addr.ip(), self.config.sip.audio_port);
        let ringing = ResponseBuilder::new(180)
            .to_tag(&local_tag)
            .contact(format!("<sip:{}@{}>", profile.username, local_addr))
            .build_for_request(req);
        self.send_built(ringing, source, protocol).await;

        let mut session = CallSession {
            handle,
            direction: CallDirection::Inbound,
            progress: CallProgress::Idle,
            profile: profile.clone(),
            identity,
            remote_addr: source,
            protocol,
            cseq: 0,
            invite_cseq: req.cseq().unwrap_or(1),
            invite_branch: String::new(),
            local_tag,
            local_sdp,
            muted: false,
            speaker: false,
            pending_reinvite: None,
            incoming_invite: Some(req.clone()),
        };
        self.generation += 1;
        transition(&mut session, CallProgress::Ringing, notifier);
        self.session = Some(session);
    }

    async fn on_bye(
        &mut self,
        req: &SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        notifier: &mut EventNotifier,
    ) {
        let Some(mut session) = self.session.take() else {
            self.respond_to(req, 481, None, source, protocol).await;
            return;
        };
        if req.call_id().as_deref() != Some(session.identity.call_id.as_str()) {
            self.session = Some(session);
            self.respond_to(req, 481, None, source, protocol).await;
            return;
        }

        self.respond_to(req, 200, None, source, protocol).await;
        info!(call = %session.handle, "Remote ended the call");
        self.generation += 1;
        if let Some(pending) = session.pending_reinvite.take() {
            let _ = pending.reply.send(Err(CallError::Engine("call ended".into())));
        }
        transition(&mut session, CallProgress::Ended, notifier);
    }

    async fn on_cancel(
        &mut self,
        req: &SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        notifier: &mut EventNotifier,
    ) {
        let cancellable = self
            .session
            .as_ref()
            .map(|s| {
                s.direction == CallDirection::Inbound
                    && s.progress == CallProgress::Ringing
                    && req.call_id().as_deref() == Some(s.identity.call_id.as_str())
            })
            .unwrap_or(false);
        if !cancellable {
            self.respond_to(req, 481, None, source, protocol).await;
            return;
        }

        self.respond_to(req, 200, None, source, protocol).await;
        if let Some(mut session) = self.session.take() {
            info!(call = %session.handle, "Remote cancelled before answer");
            if let Some(invite) = session.incoming_invite.clone() {
                self.respond_to(&invite, 487, Some(&session.local_tag), source, protocol)
                    .await;
            }
            self.generation += 1;
            transition(&mut session, CallProgress::Ended, notifier);
        }
    }

    pub(crate) async fn on_timer(&mut self, event: TimerEvent, notifier: &mut EventNotifier) {
        match event {
            TimerEvent::CallSetupTimeout { generation } if generation == self.generation => {
                let Some(mut session) = self.session.take() else {
                    return;
                };
                let pending_outbound = session.direction == CallDirection::Outbound
                    && matches!(session.progress, CallProgress::Calling | CallProgress::Ringing);
                if !pending_outbound {
                    self.session = Some(session);
                    return;
                }

                warn!(call = %session.handle, "Call setup timed out");
                let cancel = cancel_request(
                    &session.identity,
                    self.transport.local_addr(),
                    session.invite_cseq,
                    &session.invite_branch,
                );
                if let Ok(cancel) = cancel {
                    self.send_raw(cancel.to_bytes(), session.remote_addr, session.protocol)
                        .await;
                }
                self.fail_call(&mut session, CallError::Timeout, notifier);
            }
            TimerEvent::ReinviteTimeout { generation } if generation == self.generation => {
                if let Some(session) = self.session.as_mut() {
                    if let Some(pending) = session.pending_reinvite.take() {
                        warn!(call = %session.handle, "re-INVITE timed out");
                        let _ = pending.reply.send(Err(CallError::Timeout));
                    }
                }
            }
            _ => {}
        }
    }

    /// Tear down any live call on shutdown; best effort, no reply.
    pub(crate) async fn hangup_all(&mut self, notifier: &mut EventNotifier) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = self.send_teardown(&mut session).await {
                warn!("Teardown on shutdown failed: {}", e);
            }
            self.generation += 1;
            if let Some(pending) = session.pending_reinvite.take() {
                let _ = pending.reply.send(Err(CallError::Engine("call ended".into())));
            }
            transition(&mut session, CallProgress::Ended, notifier);
        }
    }

    /// Pick and send the right teardown message for the session's stage.
    async fn send_teardown(&mut self, session: &mut CallSession) -> Result<(), CallError> {
        match (session.direction, session.progress) {
            (_, CallProgress::Active) | (_, CallProgress::Held) => {
                session.cseq += 1;
                let bye = bye_request(&session.identity, self.transport.local_addr(), session.cseq)
                    .map_err(|e| CallError::Engine(e.to_string()))?;
                self.send_raw(bye.to_bytes(), session.remote_addr, session.protocol)
                    .await;
                Ok(())
            }
            (CallDirection::Outbound, CallProgress::Calling)
            | (CallDirection::Outbound, CallProgress::Ringing) => {
                let cancel = cancel_request(
                    &session.identity,
                    self.transport.local_addr(),
                    session.invite_cseq,
                    &session.invite_branch,
                )
                .map_err(|e| CallError::Engine(e.to_string()))?;
                self.send_raw(cancel.to_bytes(), session.remote_addr, session.protocol)
                    .await;
                Ok(())
            }
            (CallDirection::Inbound, CallProgress::Ringing) => {
                if let Some(invite) = session.incoming_invite.clone() {
                    self.respond_to(
                        &invite,
                        486,
                        Some(&session.local_tag),
                        session.remote_addr,
                        session.protocol,
                    )
                    .await;
                }
                Ok(())
            }
            _ => Err(CallError::NoActiveCall),
        }
    }

    fn fail_call(
        &mut self,
        session: &mut CallSession,
        error: CallError,
        notifier: &mut EventNotifier,
    ) {
        self.generation += 1;
        warn!(call = %session.handle, error = %error, "Call failed");
        notifier.emit(Event::call_failure(session.handle, error.to_string()));
        transition(session, CallProgress::Ended, notifier);
    }

    async fn send_ack(&self, session: &CallSession, cseq: u32, branch: &str) {
        match ack_request(&session.identity, self.transport.local_addr(), cseq, branch) {
            Ok(ack) => {
                self.send_raw(ack.to_bytes(), session.remote_addr, session.protocol)
                    .await;
            }
            Err(e) => warn!("Failed to build ACK: {}", e),
        }
    }

    async fn respond_to(
        &self,
        req: &SipRequest,
        status: u16,
        to_tag: Option<&str>,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) {
        let mut builder = ResponseBuilder::new(status);
        if let Some(tag) = to_tag {
            builder = builder.to_tag(tag);
        }
        self.send_built(builder.build_for_request(req), destination, protocol)
            .await;
    }

    async fn send_built(
        &self,
        response: Result<SipResponse, crate::sip::message::SipError>,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) {
        match response {
            Ok(response) => self.send_raw(response.to_bytes(), destination, protocol).await,
            Err(e) => warn!("Failed to build response: {}", e),
        }
    }

    async fn send_raw(&self, data: bytes::Bytes, destination: SocketAddr, protocol: TransportProtocol) {
        let outgoing = OutgoingMessage {
            data,
            destination,
            protocol,
        };
        if let Err(e) = self.transport.send(outgoing).await {
            warn!("Failed to send to {}: {}", destination, e);
        }
    }
}

/// Apply a progress transition, emitting the event. Invalid transitions
/// are logged and dropped rather than corrupting the session.
fn transition(session: &mut CallSession, new_state: CallProgress, notifier: &mut EventNotifier) {
    if session.progress == new_state {
        return;
    }
    if !session.progress.can_transition_to(&new_state) {
        warn!(
            call = %session.handle,
            from = session.progress.name(),
            to = new_state.name(),
            "Invalid call state transition"
        );
        return;
    }
    info!(
        call = %session.handle,
        from = session.progress.name(),
        to = new_state.name(),
        "Call state changed"
    );
    session.progress = new_state;
    notifier.emit(Event::call_state_changed(session.handle, new_state));
}

/// Extract the bare URI out of a name-addr header value.
fn uri_from_name_addr(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    value.split(';').next().unwrap_or(value).trim().to_string()
}
