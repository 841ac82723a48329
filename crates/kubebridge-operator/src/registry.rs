//! Model registry
//!
//! The static list of resource kinds the bridge serves.

use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use kubebridge_common::clientset::build_crd;
use kubebridge_common::{Coremodel, Error};
use kubebridge_datasource::{DataSourceModel, DataSourceStore};

/// Ordered list of resource kinds
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<dyn Coremodel>>,
}

impl ModelRegistry {
    /// Registry serving `models`, in order
    pub fn new(models: Vec<Arc<dyn Coremodel>>) -> Self {
        Self { models }
    }

    /// Registered resource kinds
    pub fn coremodels(&self) -> &[Arc<dyn Coremodel>] {
        &self.models
    }

    /// Type definitions registered for every kind
    pub fn crds(&self) -> Vec<CustomResourceDefinition> {
        self.models
            .iter()
            .map(|m| build_crd(m.schema().identity(), m.schema().open_api_shape()))
            .collect()
    }
}

/// Registry of every built-in kind, backed by `store`
///
/// Fails if a compiled model has drifted from its canonical schema.
pub fn provide_registry(store: Arc<dyn DataSourceStore>) -> Result<ModelRegistry, Error> {
    let datasource: Arc<dyn Coremodel> = Arc::new(DataSourceModel::provide(store)?);
    Ok(ModelRegistry::new(vec![datasource]))
}
