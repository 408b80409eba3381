//! Audit event publisher port
//!
//! Credential lifecycle changes are announced on an event bus owned by the
//! wider platform. The broker publishes inside its unit-of-work: a failed
//! publish rolls the surrounding write back.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::telemetry;

/// Lifecycle event emitted by the credential service.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialEvent {
    /// `credential.created` or `credential.deleted`
    pub kind: CredentialEventKind,
    pub credential_id: Uuid,
    pub user_id: Uuid,
    pub provider_identifier: String,
    pub credential_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CredentialEventKind {
    #[serde(rename = "credential.created")]
    Created,
    #[serde(rename = "credential.deleted")]
    Deleted,
}

impl CredentialEvent {
    pub fn new(
        kind: CredentialEventKind,
        credential_id: Uuid,
        user_id: Uuid,
        provider_identifier: &str,
        credential_type: &str,
    ) -> Self {
        Self {
            kind,
            credential_id,
            user_id,
            provider_identifier: provider_identifier.to_string(),
            credential_type: credential_type.to_string(),
            trace_id: telemetry::current_trace_id(),
        }
    }
}

/// Outbound port to the audit event bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: CredentialEvent) -> Result<(), String>;
}

/// Default publisher: structured log lines. The platform bus is wired in by
/// deployments that have one.
#[derive(Debug, Default, Clone)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: CredentialEvent) -> Result<(), String> {
        tracing::info!(
            kind = ?event.kind,
            credential_id = %event.credential_id,
            user_id = %event.user_id,
            provider_identifier = %event.provider_identifier,
            credential_type = %event.credential_type,
            "Credential lifecycle event"
        );
        Ok(())
    }
}

pub mod testing {
    //! Scriptable publisher for service-level tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub events: Mutex<Vec<CredentialEvent>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingPublisher {
        pub fn failing() -> Self {
            let publisher = Self::default();
            publisher
                .fail
                .store(true, std::sync::atomic::Ordering::SeqCst);
            publisher
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: CredentialEvent) -> Result<(), String> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("event bus unavailable".to_string());
            }
            self.events
                .lock()
                .expect("event log lock poisoned")
                .push(event);
            Ok(())
        }
    }
}
