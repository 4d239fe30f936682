//! Engine Event Stream
//!
//! Observable lifecycle notifications from the signing engine. Events carry
//! state names, request ids, and error codes only; payloads, keys, and
//! derivation paths never cross this boundary.

use serde::Serialize;

use crate::error::ErrorCode;
use crate::types::{Layer, SigningState};
use crate::{log_error, log_info};

/// Lifecycle notification emitted by the signing engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The request state machine moved between states
    StateChanged {
        request_id: u64,
        from: SigningState,
        to: SigningState,
    },
    /// The request finished with a signature
    Completed {
        request_id: u64,
        layer: Layer,
        kind: &'static str,
    },
    /// The request finished without a signature
    Failed { request_id: u64, code: ErrorCode },
}

impl EngineEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            EngineEvent::StateChanged { request_id, .. }
            | EngineEvent::Completed { request_id, .. }
            | EngineEvent::Failed { request_id, .. } => *request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Completed { .. } | EngineEvent::Failed { .. }
        )
    }
}

/// Fire-and-forget consumer of engine events.
///
/// Implementations must not block: the engine emits from inside its state
/// loop and will not wait for delivery.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Sink that forwards every event to the logging module
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::StateChanged {
                request_id,
                from,
                to,
            } => {
                log_info!(
                    "engine",
                    "Signing state changed",
                    request = request_id,
                    from = from,
                    to = to,
                );
            }
            EngineEvent::Completed {
                request_id,
                layer,
                kind,
            } => {
                log_info!(
                    "engine",
                    "Signing request completed",
                    request = request_id,
                    layer = layer,
                    kind = kind,
                );
            }
            EngineEvent::Failed { request_id, code } => {
                log_error!(
                    "engine",
                    "Signing request failed",
                    request = request_id,
                    code = format!("{:?}", code),
                );
            }
        }
    }
}

/// Sink that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_accessor() {
        let event = EngineEvent::StateChanged {
            request_id: 7,
            from: SigningState::Idle,
            to: SigningState::Signing,
        };
        assert_eq!(event.request_id(), 7);

        let event = EngineEvent::Failed {
            request_id: 9,
            code: ErrorCode::UserDeclined,
        };
        assert_eq!(event.request_id(), 9);
    }

    #[test]
    fn test_terminal_classification() {
        let transition = EngineEvent::StateChanged {
            request_id: 1,
            from: SigningState::Idle,
            to: SigningState::DerivingKey,
        };
        assert!(!transition.is_terminal());

        let done = EngineEvent::Completed {
            request_id: 1,
            layer: Layer::Bitcoin,
            kind: "transaction",
        };
        assert!(done.is_terminal());

        let failed = EngineEvent::Failed {
            request_id: 1,
            code: ErrorCode::DeviceIntegrityFailed,
        };
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_event_serialization_has_no_payload_fields() {
        let event = EngineEvent::Failed {
            request_id: 3,
            code: ErrorCode::VaultUnlockFailed,
        };
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"event\":\"failed\""));
        assert!(json.contains("\"code\":\"vault_unlock_failed\""));
        assert!(!json.contains("message"));
        assert!(!json.contains("path"));
    }

    #[test]
    fn test_sinks_accept_events() {
        let event = EngineEvent::Completed {
            request_id: 2,
            layer: Layer::Taproot,
            kind: "message",
        };
        NullSink.emit(event.clone());
        LogSink.emit(event);
    }
}
