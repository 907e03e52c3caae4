//! Engine task and the public user-agent handle
//!
//! All SIP state lives inside one spawned task that owns the
//! registration and call engines. The cloneable [`SipUserAgent`] handle
//! talks to it over a command channel; timers and transport deliveries
//! arrive on their own channels and are serialized by the same loop, so
//! the engines never need locks.

mod call;
pub mod notifier;
mod registration;

use crate::config::Config;
use crate::domain::call::CallHandle;
use crate::domain::error::{CallError, CoreError, RegistrationError};
use crate::domain::profile::UserProfile;
use crate::domain::registration::RegistrationState;
use crate::sip::message::{SipMessage, SipMethod};
use crate::sip::transport::{IncomingMessage, Transport};
use call::CallEngine;
use notifier::{EventNotifier, EventStream, SubscriberId};
use registration::RegistrationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Timers post back into the engine loop instead of firing callbacks.
/// Each carries the generation it was armed under; a bumped generation
/// cancels every timer armed before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    RegisterTimeout { generation: u64 },
    RegisterRefresh { generation: u64 },
    CallSetupTimeout { generation: u64 },
    ReinviteTimeout { generation: u64 },
}

/// Arm a one-shot timer that posts `event` back to the engine loop.
pub(crate) fn schedule_timer(tx: &mpsc::Sender<TimerEvent>, after: Duration, event: TimerEvent) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        // Engine gone means the timer no longer matters
        let _ = tx.send(event).await;
    });
}

enum Command {
    Register {
        profile: UserProfile,
        reply: oneshot::Sender<Result<(), RegistrationError>>,
    },
    Unregister {
        reply: oneshot::Sender<()>,
    },
    RegistrationState {
        reply: oneshot::Sender<RegistrationState>,
    },
    Call {
        address: String,
        reply: oneshot::Sender<Result<CallHandle, CallError>>,
    },
    Accept {
        handle: CallHandle,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        handle: CallHandle,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall {
        handle: CallHandle,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hold {
        handle: CallHandle,
        on: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetMute {
        handle: CallHandle,
        muted: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetSpeaker {
        handle: CallHandle,
        speaker: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Subscribe {
        reply: oneshot::Sender<EventStream>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Engine {
    registration: RegistrationEngine,
    call: CallEngine,
    notifier: EventNotifier,
    command_rx: mpsc::Receiver<Command>,
    timer_rx: mpsc::Receiver<TimerEvent>,
    incoming_rx: mpsc::Receiver<IncomingMessage>,
}

impl Engine {
    async fn run(mut self) {
        info!("SIP engine started");

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    // All handles dropped
                    None => break,
                },
                Some(event) = self.timer_rx.recv() => {
                    self.handle_timer(event).await;
                }
                Some(incoming) = self.incoming_rx.recv() => {
                    self.handle_incoming(incoming).await;
                }
            }
        }

        info!("SIP engine stopped");
    }

    /// Returns true on shutdown.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Register { profile, reply } => {
                self.registration
                    .open(profile, &mut self.notifier, reply)
                    .await;
            }
            Command::Unregister { reply } => {
                self.registration.close(&mut self.notifier).await;
                let _ = reply.send(());
            }
            Command::RegistrationState { reply } => {
                let _ = reply.send(self.registration.state().clone());
            }
            Command::Call { address, reply } => {
                if !self.registration.is_registered() {
                    let _ = reply.send(Err(CallError::NotRegistered));
                    return false;
                }
                match (
                    self.registration.profile().cloned(),
                    self.registration.registrar(),
                ) {
                    (Some(profile), Some(registrar)) => {
                        self.call
                            .make_call(&address, &profile, registrar, &mut self.notifier, reply)
                            .await;
                    }
                    _ => {
                        let _ = reply.send(Err(CallError::Engine(
                            "registration incomplete".into(),
                        )));
                    }
                }
            }
            Command::Accept { handle, reply } => {
                self.call.accept(handle, &mut self.notifier, reply).await;
            }
            Command::Reject { handle, reply } => {
                self.call.reject(handle, &mut self.notifier, reply).await;
            }
            Command::EndCall { handle, reply } => {
                self.call.end_call(handle, &mut self.notifier, reply).await;
            }
            Command::Hold { handle, on, reply } => {
                self.call.hold(handle, on, reply).await;
            }
            Command::SetMute {
                handle,
                muted,
                reply,
            } => {
                self.call.set_mute(handle, muted, reply);
            }
            Command::SetSpeaker {
                handle,
                speaker,
                reply,
            } => {
                self.call.set_speaker(handle, speaker, reply);
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.notifier.subscribe());
            }
            Command::Unsubscribe { id } => {
                self.notifier.unsubscribe(id);
            }
            Command::Shutdown { reply } => {
                self.call.hangup_all(&mut self.notifier).await;
                self.registration.close(&mut self.notifier).await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RegisterTimeout { .. } | TimerEvent::RegisterRefresh { .. } => {
                self.registration.on_timer(event, &mut self.notifier).await;
            }
            TimerEvent::CallSetupTimeout { .. } | TimerEvent::ReinviteTimeout { .. } => {
                self.call.on_timer(event, &mut self.notifier).await;
            }
        }
    }

    /// Route one transport delivery: requests go to the call engine,
    /// responses are routed by their CSeq method.
    async fn handle_incoming(&mut self, incoming: IncomingMessage) {
        match incoming.message {
            SipMessage::Request(request) => {
                let profile = if self.registration.is_registered() {
                    self.registration.profile().cloned()
                } else {
                    None
                };
                self.call
                    .on_request(
                        &request,
                        incoming.source,
                        incoming.protocol,
                        profile.as_ref(),
                        &mut self.notifier,
                    )
                    .await;
            }
            SipMessage::Response(response) => match response.cseq_method() {
                Some(SipMethod::Register) => {
                    self.registration
                        .on_response(&response, &mut self.notifier)
                        .await;
                }
                Some(SipMethod::Invite) | Some(SipMethod::Bye) | Some(SipMethod::Cancel) => {
                    self.call.on_response(&response, &mut self.notifier).await;
                }
                other => {
                    warn!(method = ?other, "Discarding response with unroutable CSeq");
                }
            },
        }
    }
}

/// Cloneable handle to a running SIP user agent.
///
/// Every method forwards a command to the engine task and awaits the
/// outcome, so calls are safe from any task.
#[derive(Clone)]
pub struct SipUserAgent {
    command_tx: mpsc::Sender<Command>,
}

impl SipUserAgent {
    /// Spawn the engine over an already-constructed transport.
    /// `incoming_rx` is the delivery channel returned when the
    /// transport was built.
    pub fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        incoming_rx: mpsc::Receiver<IncomingMessage>,
    ) -> Result<Self, CoreError> {
        if !transport.is_available() {
            return Err(CoreError::UnsupportedPlatform);
        }

        let config = Arc::new(config);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (timer_tx, timer_rx) = mpsc::channel(64);

        let engine = Engine {
            registration: RegistrationEngine::new(
                Arc::clone(&config),
                Arc::clone(&transport),
                timer_tx.clone(),
            ),
            call: CallEngine::new(Arc::clone(&config), transport, timer_tx),
            notifier: EventNotifier::new(),
            command_rx,
            timer_rx,
            incoming_rx,
        };
        tokio::spawn(engine.run());

        Ok(Self { command_tx })
    }

    /// Validate `profile` and register it. Resolves once registration
    /// reaches a terminal outcome; renewals then run in the background.
    pub async fn register(&self, profile: UserProfile) -> Result<(), RegistrationError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Register { profile, reply })
            .await
            .map_err(|_| RegistrationError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| RegistrationError::Engine("engine stopped".into()))?
    }

    /// Drop the current registration. Idempotent.
    pub async fn unregister(&self) -> Result<(), RegistrationError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Unregister { reply })
            .await
            .map_err(|_| RegistrationError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| RegistrationError::Engine("engine stopped".into()))
    }

    pub async fn registration_state(&self) -> Result<RegistrationState, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::RegistrationState { reply })
            .await
            .map_err(|_| CoreError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| CoreError::Engine("engine stopped".into()))
    }

    /// Place an outbound call. Resolves once the INVITE is sent; watch
    /// the event stream for progress.
    pub async fn call(&self, address: impl Into<String>) -> Result<CallHandle, CallError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Call {
                address: address.into(),
                reply,
            })
            .await
            .map_err(|_| CallError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| CallError::Engine("engine stopped".into()))?
    }

    /// Answer a ringing inbound call.
    pub async fn accept(&self, handle: CallHandle) -> Result<(), CallError> {
        self.call_command(|reply| Command::Accept { handle, reply })
            .await
    }

    /// Decline a ringing inbound call.
    pub async fn reject(&self, handle: CallHandle) -> Result<(), CallError> {
        self.call_command(|reply| Command::Reject { handle, reply })
            .await
    }

    /// Terminate the call at any stage.
    pub async fn end_call(&self, handle: CallHandle) -> Result<(), CallError> {
        self.call_command(|reply| Command::EndCall { handle, reply })
            .await
    }

    /// Put the call on hold or resume it. Resolves on the re-INVITE's
    /// final response.
    pub async fn hold(&self, handle: CallHandle, on: bool) -> Result<(), CallError> {
        self.call_command(|reply| Command::Hold { handle, on, reply })
            .await
    }

    pub async fn set_mute(&self, handle: CallHandle, muted: bool) -> Result<(), CallError> {
        self.call_command(|reply| Command::SetMute {
            handle,
            muted,
            reply,
        })
        .await
    }

    pub async fn set_speaker(&self, handle: CallHandle, speaker: bool) -> Result<(), CallError> {
        self.call_command(|reply| Command::SetSpeaker {
            handle,
            speaker,
            reply,
        })
        .await
    }

    /// Open an ordered stream of engine events.
    pub async fn subscribe(&self) -> Result<EventStream, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| CoreError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| CoreError::Engine("engine stopped".into()))
    }

    /// Detach a subscriber. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), CoreError> {
        self.command_tx
            .send(Command::Unsubscribe { id })
            .await
            .map_err(|_| CoreError::Engine("engine stopped".into()))
    }

    /// Hang up, unregister and stop the engine task.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| CoreError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| CoreError::Engine("engine stopped".into()))
    }

    async fn call_command<F>(&self, build: F) -> Result<(), CallError>
    where
        F: FnOnce(oneshot::Sender<Result<(), CallError>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| CallError::Engine("engine stopped".into()))?;
        rx.await
            .map_err(|_| CallError::Engine("engine stopped".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_timer_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        schedule_timer(
            &tx,
            Duration::from_millis(5),
            TimerEvent::RegisterTimeout { generation: 7 },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event, TimerEvent::RegisterTimeout { generation: 7 });
    }

    #[tokio::test]
    async fn test_timers_are_ordered_by_deadline() {
        let (tx, mut rx) = mpsc::channel(4);
        schedule_timer(
            &tx,
            Duration::from_millis(30),
            TimerEvent::RegisterRefresh { generation: 1 },
        );
        schedule_timer(
            &tx,
            Duration::from_millis(5),
            TimerEvent::RegisterTimeout { generation: 1 },
        );

        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::RegisterTimeout { generation: 1 }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::RegisterRefresh { generation: 1 }
        );
    }
}
