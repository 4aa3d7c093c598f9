//! Kubernetes Event recording for signing outcomes
//!
//! Events are attached to the CertificateSigningRequest they describe, so
//! `kubectl describe csr <name>` shows why a request was or wasn't signed.
//!
//! Publishing is **fire-and-forget**: failures are logged as warnings and
//! never propagate. A lost event must never fail a signing that succeeded.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What was attempted (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                object = resource_ref.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    /// A certificate was written to the request's status
    pub const SIGNED: &str = "Signed";
    /// The embedded certificate request could not be parsed
    pub const SIGNING_FAILED: &str = "SigningFailed";
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    /// Decoding the PKCS#10 request
    pub const PARSE: &str = "Parse";
    /// Issuing the certificate
    pub const SIGN: &str = "Sign";
}

/// Human-readable notes attached to events
pub mod notes {
    /// Note for [`super::reasons::SIGNED`]
    pub const SIGNED: &str = "The CSR has been signed";
    /// Note for [`super::reasons::SIGNING_FAILED`]
    pub const UNPARSEABLE: &str = "Unable to parse the CSR request";
}

#[cfg(test)]
pub(crate) mod testing {
    //! A publisher that remembers what it was asked to publish

    use std::sync::Mutex;

    use super::*;

    /// One recorded call to [`EventPublisher::publish`]
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedEvent {
        pub object: String,
        pub warning: bool,
        pub reason: String,
        pub action: String,
        pub note: Option<String>,
    }

    #[derive(Default)]
    pub struct RecordingEventPublisher {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEventPublisher {
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
            self.events()
                .into_iter()
                .filter(|e| e.reason == reason)
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEventPublisher {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            action: &str,
            note: Option<String>,
        ) {
            self.events.lock().unwrap().push(RecordedEvent {
                object: resource_ref.name.clone().unwrap_or_default(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
        }
    }
}
