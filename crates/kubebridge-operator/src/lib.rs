//! kubebridge operator: keeps control-plane resources and the internal store in agreement

#![deny(missing_docs)]

pub mod config;
pub mod registry;
pub mod service;

pub use config::BridgeConfig;
pub use registry::{provide_registry, ModelRegistry};
pub use service::BridgeService;
