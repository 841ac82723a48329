//! Reconcile failure reporting
//!
//! Failed attempts surface as Warning Events on the object they were for, so
//! they show up in `kubectl describe` next to it. Reporting is best effort
//! and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::identity::{ObjectKey, ResourceIdentity};
use crate::Error;

/// Cancellation context of an attempt that ran past its deadline
pub(crate) const ATTEMPT_TIMEOUT: &str = "attempt-timeout";

const RECONCILE_ACTION: &str = "Reconcile";

/// How a reconcile attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The reconciler returned an error
    Errored,
    /// The attempt was cut off by the attempt timeout
    TimedOut,
}

impl Failure {
    /// Classify the error an attempt ended with
    pub fn of(error: &Error) -> Self {
        match error.context() {
            Some(ATTEMPT_TIMEOUT) => Failure::TimedOut,
            _ => Failure::Errored,
        }
    }

    /// Event reason, shown under REASON in `kubectl get events`
    pub fn reason(self) -> &'static str {
        match self {
            Failure::Errored => "ReconcileFailed",
            Failure::TimedOut => "ReconcileTimedOut",
        }
    }
}

/// Sink for failed reconcile attempts
#[async_trait]
pub trait FailureReporter: Send + Sync {
    /// Report that reconciling `key` of kind `identity` failed
    async fn report(
        &self,
        identity: &ResourceIdentity,
        key: &ObjectKey,
        failure: Failure,
        message: String,
    );
}

/// Reports failures as Kubernetes Events on the failing object
pub struct EventReporter {
    recorder: Recorder,
}

impl EventReporter {
    /// Reporter attributed to `controller`, and to this pod when `POD_NAME` is set
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl FailureReporter for EventReporter {
    async fn report(
        &self,
        identity: &ResourceIdentity,
        key: &ObjectKey,
        failure: Failure,
        message: String,
    ) {
        let event = Event {
            type_: EventType::Warning,
            reason: failure.reason().to_string(),
            note: Some(message),
            action: RECONCILE_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &regarding(identity, key))
            .await
        {
            warn!(kind = %identity, key = %key, error = %e, "Failed to record reconcile failure");
        }
    }
}

/// Reporter that drops every failure
pub struct NoopReporter;

#[async_trait]
impl FailureReporter for NoopReporter {
    async fn report(&self, _: &ResourceIdentity, _: &ObjectKey, _: Failure, _: String) {}
}

fn regarding(identity: &ResourceIdentity, key: &ObjectKey) -> ObjectReference {
    ObjectReference {
        api_version: Some(identity.api_version()),
        kind: Some(identity.kind.clone()),
        namespace: key.namespace.clone(),
        name: Some(key.name.clone()),
        ..Default::default()
    }
}
