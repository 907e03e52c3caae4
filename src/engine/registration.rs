//! REGISTER lifecycle: open, refresh, retry, digest challenge, close

use super::{schedule_timer, TimerEvent};
use crate::config::Config;
use crate::domain::error::RegistrationError;
use crate::domain::event::Event;
use crate::domain::profile::{
    build_profile, CredentialStore, SipProfile, StaticCredentials, UserProfile,
};
use crate::domain::registration::RegistrationState;
use crate::engine::notifier::EventNotifier;
use crate::sip::auth::{compute_authorization, DigestChallenge};
use crate::sip::builder::{generate_call_id, generate_tag, register_request, DialogIdentity};
use crate::sip::message::SipResponse;
use crate::sip::transport::{OutgoingMessage, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<(), RegistrationError>>;

pub(crate) struct RegistrationEngine {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    timer_tx: mpsc::Sender<TimerEvent>,
    state: RegistrationState,
    profile: Option<SipProfile>,
    registrar: Option<SocketAddr>,
    credentials: Option<Arc<dyn CredentialStore>>,
    identity: Option<DialogIdentity>,
    cseq: u32,
    attempts: u32,
    auth_retry_done: bool,
    current_timeout: Duration,
    last_authorization: Option<String>,
    pending: Option<Reply>,
    generation: u64,
}

impl RegistrationEngine {
    pub(crate) fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        timer_tx: mpsc::Sender<TimerEvent>,
    ) -> Self {
        let current_timeout = config.timers.register_timeout();
        Self {
            config,
            transport,
            timer_tx,
            state: RegistrationState::Unregistered,
            profile: None,
            registrar: None,
            credentials: None,
            identity: None,
            cseq: 0,
            attempts: 0,
            auth_retry_done: false,
            current_timeout,
            last_authorization: None,
            pending: None,
            generation: 0,
        }
    }

    pub(crate) fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.state.is_registered()
    }

    pub(crate) fn profile(&self) -> Option<&SipProfile> {
        self.profile.as_ref()
    }

    pub(crate) fn registrar(&self) -> Option<SocketAddr> {
        self.registrar
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            RegistrationState::Registering
                | RegistrationState::Registered
                | RegistrationState::Expiring
        )
    }

    /// Begin registering `profile`. The reply resolves at the terminal
    /// outcome: Registered, Failed or Cancelled.
    pub(crate) async fn open(
        &mut self,
        user: UserProfile,
        notifier: &mut EventNotifier,
        reply: Reply,
    ) {
        let profile = match build_profile(&user) {
            Ok(profile) => profile,
            Err(e) => {
                let _ = reply.send(Err(RegistrationError::InvalidProfile(e)));
                return;
            }
        };

        if self.is_open() {
            let same_profile = self
                .profile
                .as_ref()
                .map(|p| p.uri == profile.uri)
                .unwrap_or(false);
            let result = if same_profile && self.state.is_registered() {
                Ok(())
            } else {
                Err(RegistrationError::AlreadyOpen)
            };
            let _ = reply.send(result);
            return;
        }

        if !self.transport.supports_protocol(profile.protocol) {
            let _ = reply.send(Err(RegistrationError::Transport(format!(
                "{} transport not supported",
                profile.protocol.as_str()
            ))));
            return;
        }

        let registrar = match self.resolve_registrar(&profile).await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(aor = %profile.uri, registrar = %registrar, "Opening registration");

        self.credentials = Some(Arc::new(StaticCredentials::new(
            user.username.clone(),
            user.password.clone(),
        )));
        self.identity = Some(DialogIdentity {
            call_id: generate_call_id(&profile.domain),
            from: format!("<{}>;tag={}", profile.uri, generate_tag()),
            to_uri: profile.uri.clone(),
            to_tag: None,
        });
        self.registrar = Some(registrar);
        self.profile = Some(profile);
        self.cseq = 1;
        self.attempts = 0;
        self.auth_retry_done = false;
        self.current_timeout = self.config.timers.register_timeout();
        self.last_authorization = None;
        self.generation += 1;
        self.pending = Some(reply);

        self.set_state(RegistrationState::Registering, notifier);
        self.send_register(notifier).await;
    }

    /// Idempotent: sends a single unregister when currently Registered,
    /// cancels timers and any in-flight attempt, always ends Unregistered.
    pub(crate) async fn close(&mut self, notifier: &mut EventNotifier) {
        self.generation += 1;

        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(RegistrationError::Cancelled));
        }

        if self.state.is_registered() {
            self.cseq += 1;
            self.send_unregister().await;
        }

        if self.state != RegistrationState::Unregistered {
            self.set_state(RegistrationState::Unregistered, notifier);
        }

        self.profile = None;
        self.registrar = None;
        self.credentials = None;
        self.identity = None;
        self.last_authorization = None;
        self.attempts = 0;
        self.auth_retry_done = false;
    }

    pub(crate) async fn on_response(&mut self, resp: &SipResponse, notifier: &mut EventNotifier) {
        let Some(identity) = self.identity.as_ref() else {
            debug!("Discarding REGISTER response with no open registration");
            return;
        };
        if resp.call_id().as_deref() != Some(identity.call_id.as_str()) {
            warn!("Discarding REGISTER response for unknown Call-ID");
            return;
        }
        if self.state != RegistrationState::Registering {
            debug!(state = self.state.name(), "Ignoring late REGISTER response");
            return;
        }

        let status = resp.status_code();
        match status {
            100..=199 => {}
            200..=299 => self.on_registered(resp, notifier),
            401 | 407 => self.on_challenge(resp, notifier).await,
            _ => self.fail(RegistrationError::ServerRejected(status), notifier),
        }
    }

    pub(crate) async fn on_timer(&mut self, event: TimerEvent, notifier: &mut EventNotifier) {
        match event {
            TimerEvent::RegisterTimeout { generation }
                if generation == self.generation
                    && self.state == RegistrationState::Registering =>
            {
                if self.attempts >= self.config.timers.register_max_attempts {
                    self.fail(RegistrationError::Timeout, notifier);
                } else {
                    debug!(attempt = self.attempts + 1, "REGISTER timed out, retrying");
                    self.current_timeout *= 2;
                    self.send_register(notifier).await;
                }
            }
            TimerEvent::RegisterRefresh { generation }
                if generation == self.generation && self.state.is_registered() =>
            {
                info!("Registration nearing expiry, re-registering");
                self.set_state(RegistrationState::Expiring, notifier);
                self.generation += 1;
                self.cseq += 1;
                self.attempts = 0;
                self.auth_retry_done = false;
                self.last_authorization = None;
                self.current_timeout = self.config.timers.register_timeout();
                self.set_state(RegistrationState::Registering, notifier);
                self.send_register(notifier).await;
            }
            // Stale generation or state: the timer was cancelled
            _ => {}
        }
    }

    fn on_registered(&mut self, resp: &SipResponse, notifier: &mut EventNotifier) {
        self.generation += 1;
        self.attempts = 0;
        self.auth_retry_done = false;
        self.current_timeout = self.config.timers.register_timeout();

        let granted = match resp.expires() {
            Some(0) | None => self.config.sip.register_expires,
            Some(expires) => expires,
        };

        self.set_state(RegistrationState::Registered, notifier);
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Ok(()));
        }

        // Re-register at 90% of the granted lifetime
        let refresh = Duration::from_secs_f64(f64::from(granted) * 0.9);
        schedule_timer(
            &self.timer_tx,
            refresh,
            TimerEvent::RegisterRefresh {
                generation: self.generation,
            },
        );
        info!(expires = granted, refresh_in = ?refresh, "Registration accepted");
    }

    async fn on_challenge(&mut self, resp: &SipResponse, notifier: &mut EventNotifier) {
        if self.auth_retry_done {
            self.fail(RegistrationError::AuthFailed, notifier);
            return;
        }

        let Some(challenge_value) = resp.authenticate_challenge() else {
            warn!("Challenge response without WWW-Authenticate header");
            self.fail(RegistrationError::AuthFailed, notifier);
            return;
        };
        let challenge = match DigestChallenge::parse(&challenge_value) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("Unparseable digest challenge: {}", e);
                self.fail(RegistrationError::AuthFailed, notifier);
                return;
            }
        };

        let (username, request_uri) = match self.profile.as_ref() {
            Some(profile) => (profile.username.clone(), format!("sip:{}", profile.domain)),
            None => {
                self.fail(RegistrationError::Engine("no open profile".into()), notifier);
                return;
            }
        };
        let password = self
            .credentials
            .as_ref()
            .and_then(|store| store.password_for(&username, &challenge.realm));
        let Some(password) = password else {
            warn!(realm = %challenge.realm, "No credentials for challenge");
            self.fail(RegistrationError::AuthFailed, notifier);
            return;
        };

        debug!(realm = %challenge.realm, "Answering digest challenge");
        self.last_authorization = Some(compute_authorization(
            &challenge,
            &username,
            &password,
            "REGISTER",
            &request_uri,
        ));
        self.auth_retry_done = true;
        self.cseq += 1;
        self.attempts = 0;
        self.generation += 1;
        self.current_timeout = self.config.timers.register_timeout();
        self.send_register(notifier).await;
    }

    /// Send one REGISTER for the open profile and arm the transaction
    /// timeout. Counts as one attempt toward the retry limit.
    async fn send_register(&mut self, notifier: &mut EventNotifier) {
        let (profile, registrar, identity) = match (
            self.profile.clone(),
            self.registrar,
            self.identity.clone(),
        ) {
            (Some(profile), Some(registrar), Some(identity)) => (profile, registrar, identity),
            _ => {
                self.fail(RegistrationError::Engine("no open profile".into()), notifier);
                return;
            }
        };

        let request = match register_request(
            &profile,
            self.transport.local_addr(),
            &identity,
            self.cseq,
            self.config.sip.register_expires,
            self.last_authorization.as_deref(),
        ) {
            Ok(request) => request,
            Err(e) => {
                self.fail(RegistrationError::Engine(e.to_string()), notifier);
                return;
            }
        };

        self.attempts += 1;
        let outgoing = OutgoingMessage {
            data: request.to_bytes(),
            destination: registrar,
            protocol: profile.protocol,
        };
        if let Err(e) = self.transport.send(outgoing).await {
            warn!("Failed to send REGISTER: {}", e);
            if self.attempts >= self.config.timers.register_max_attempts {
                self.fail(RegistrationError::Transport(e.to_string()), notifier);
                return;
            }
            // Fall through: the timeout drives the retry
        }

        schedule_timer(
            &self.timer_tx,
            self.current_timeout,
            TimerEvent::RegisterTimeout {
                generation: self.generation,
            },
        );
    }

    /// Best-effort Expires: 0 REGISTER; no retries, no timers.
    async fn send_unregister(&mut self) {
        let (profile, registrar, identity) = match (
            self.profile.as_ref(),
            self.registrar,
            self.identity.as_ref(),
        ) {
            (Some(profile), Some(registrar), Some(identity)) => (profile, registrar, identity),
            _ => return,
        };

        match register_request(
            profile,
            self.transport.local_addr(),
            identity,
            self.cseq,
            0,
            self.last_authorization.as_deref(),
        ) {
            Ok(request) => {
                let outgoing = OutgoingMessage {
                    data: request.to_bytes(),
                    destination: registrar,
                    protocol: profile.protocol,
                };
                if let Err(e) = self.transport.send(outgoing).await {
                    warn!("Failed to send unregister: {}", e);
                }
            }
            Err(e) => warn!("Failed to build unregister: {}", e),
        }
    }

    fn fail(&mut self, error: RegistrationError, notifier: &mut EventNotifier) {
        self.generation += 1;
        warn!(error = %error, "Registration failed");
        self.set_state(RegistrationState::Failed(error.to_string()), notifier);
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn set_state(&mut self, new_state: RegistrationState, notifier: &mut EventNotifier) {
        if self.state == new_state {
            return;
        }
        if !self.state.can_transition_to(&new_state) {
            warn!(
                from = self.state.name(),
                to = new_state.name(),
                "Invalid registration state transition"
            );
            return;
        }
        info!(
            from = self.state.name(),
            to = new_state.name(),
            "Registration state changed"
        );
        self.state = new_state.clone();
        notifier.emit(Event::registration_changed(new_state));
    }

    async fn resolve_registrar(
        &self,
        profile: &SipProfile,
    ) -> Result<SocketAddr, RegistrationError> {
        if let Some(addr) = self.config.sip.registrar_addr {
            return Ok(addr);
        }
        let host = profile.registrar_host();
        let mut addrs = tokio::net::lookup_host(&host)
            .await
            .map_err(|e| RegistrationError::Transport(format!("DNS lookup failed: {}", e)))?;
        addrs
            .next()
            .ok_or_else(|| RegistrationError::Transport(format!("No address for {}", host)))
    }
}
