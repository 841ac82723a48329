//! Common types for kubebridge: identities, schemas, client set, and the reconcile runtime

#![deny(missing_docs)]

pub mod clientset;
pub mod error;
pub mod identity;
pub mod kube_utils;
pub mod model;
pub mod runtime;
pub mod schema;
pub mod telemetry;

pub use clientset::{ClientSet, ObjectGetter, TypedClient};
pub use error::{Error, StoreError};
pub use identity::{GroupVersion, ObjectKey, ResourceIdentity};
pub use model::{Bridge, Coremodel};
pub use schema::SchemaDescriptor;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the resource kinds served by the bridge
pub const BRIDGE_API_GROUP: &str = "core.kubebridge.io";

/// Reporting component name on published Events
pub const CONTROLLER_NAME: &str = "kubebridge";
