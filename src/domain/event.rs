//! Events emitted by the engine to external observers

use super::call::{CallHandle, CallProgress};
use super::registration::RegistrationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of an engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    /// Registration state changed
    RegistrationChanged { state: RegistrationState },
    /// A call moved to a new state
    CallStateChanged {
        handle: CallHandle,
        state: CallProgress,
    },
    /// A call failed; the call also transitions to Ended
    CallFailure { handle: CallHandle, reason: String },
}

/// One observable engine event, delivered in emission order per subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub meta: EventMeta,
    pub kind: EventKind,
}

impl Event {
    pub fn registration_changed(state: RegistrationState) -> Self {
        Self {
            meta: EventMeta::new(),
            kind: EventKind::RegistrationChanged { state },
        }
    }

    pub fn call_state_changed(handle: CallHandle, state: CallProgress) -> Self {
        Self {
            meta: EventMeta::new(),
            kind: EventKind::CallStateChanged { handle, state },
        }
    }

    pub fn call_failure(handle: CallHandle, reason: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::new(),
            kind: EventKind::CallFailure {
                handle,
                reason: reason.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_serializable() {
        let event = Event::registration_changed(RegistrationState::Registered);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("RegistrationChanged"));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back.kind,
            EventKind::RegistrationChanged {
                state: RegistrationState::Registered
            }
        ));
    }

    #[test]
    fn test_call_failure_event() {
        let handle = CallHandle::generate();
        let event = Event::call_failure(handle, "remote rejected with status 486");
        match event.kind {
            EventKind::CallFailure { handle: h, reason } => {
                assert_eq!(h, handle);
                assert!(reason.contains("486"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
