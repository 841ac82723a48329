//! DataSource resource kind for kubebridge
//!
//! The `DataSource` custom resource, its store contract, and the controller
//! that mirrors it into the store.

#![deny(missing_docs)]

pub mod controller;
pub mod coremodel;
pub mod crd;
pub mod mapping;
pub mod store;

pub use controller::{DataSourceReconciler, SyncOutcome};
pub use coremodel::DataSourceModel;
pub use crd::{DataSource, DataSourceSpec};
pub use store::{DataSourceRecord, DataSourceStore, MemoryStore};
