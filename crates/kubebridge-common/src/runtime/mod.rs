//! Watch/dispatch runtime
//!
//! Each resource kind runs on a `kube::runtime::Controller`: change
//! notifications are collapsed into object keys, work is serialized per key,
//! and different keys are reconciled concurrently. Failed attempts are
//! reported on the object through a [`FailureReporter`].

mod deletions;
mod manager;
mod report;

pub use kube::runtime::controller::Action;
pub use manager::{
    default_error_policy, ControllerDef, ControllerManager, ManagerOptions, Reconciler,
    RunningManager, DEFAULT_REQUEUE, DEFAULT_WORKERS, WATCH_TIMEOUT_SECS,
};
pub use report::{EventReporter, Failure, FailureReporter, NoopReporter};
