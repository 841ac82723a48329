//! Schema descriptors
//!
//! A [`SchemaDescriptor`] binds a resource kind's compiled data model, its
//! canonical schema lineage, and its control-plane identity into one
//! immutable value. Construction is the startup gate: if the compiled type
//! and the canonical schema have diverged, the descriptor is never built and
//! the bridge never starts.

mod compat;
mod lineage;

use std::any::type_name;
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::core::ObjectList;
use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub use compat::{check_assignable, validate_instance, Violation};
pub use lineage::{Lineage, SchemaSource, SyntacticVersion, VersionedSchema};

use crate::identity::ResourceIdentity;
use crate::Error;

/// Compiled types standing for a resource kind at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeTypes {
    /// Type name of the single-object resource type
    pub resource: &'static str,
    /// Type name of the list type
    pub list: &'static str,
}

/// Immutable binding of identity, canonical schema, and OpenAPI shape
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    identity: ResourceIdentity,
    lineage: Arc<Lineage>,
    version: SyntacticVersion,
    open_api: JSONSchemaProps,
    runtime_types: RuntimeTypes,
}

impl SchemaDescriptor {
    /// Load a canonical schema and validate a compiled model against it.
    ///
    /// `T` is the representative data model (usually the resource's spec
    /// struct) and `K` the compiled resource type. Fails with:
    /// - `SchemaSource` if the lineage cannot be read or parsed
    /// - `SchemaMismatch` if `K` declares a different identity, no schema is
    ///   compatible with `version`, or a sample of `T` does not decode under it
    /// - `SchemaIncompatible` if `T` is not structurally assignable to it
    pub fn load<T, K>(
        source: &SchemaSource,
        version: SyntacticVersion,
        identity: ResourceIdentity,
        open_api: JSONSchemaProps,
    ) -> Result<Self, Error>
    where
        T: JsonSchema + Serialize + DeserializeOwned + Default,
        K: Resource<DynamicType = ()> + Clone,
    {
        let lineage = Lineage::load(source)?;
        let name = lineage.name().to_string();

        let declared = ResourceIdentity::of::<K>();
        if declared != identity {
            return Err(Error::schema_mismatch(
                &name,
                format!(
                    "resource type {} declares {}, descriptor declares {}",
                    type_name::<K>(),
                    declared,
                    identity
                ),
            ));
        }

        let resolved = lineage.resolve(version)?;

        let generated = serde_json::to_value(schemars::schema_for!(T)).map_err(|e| {
            Error::schema_mismatch(&name, format!("cannot render schema of {}: {}", type_name::<T>(), e))
        })?;
        check_assignable(&resolved.schema, &generated)
            .map_err(|(field, msg)| Error::schema_incompatible(&name, field, msg))?;

        let sample = serde_json::to_value(T::default()).map_err(|e| {
            Error::schema_mismatch(&name, format!("cannot encode {}: {}", type_name::<T>(), e))
        })?;
        validate_instance(&resolved.schema, &sample).map_err(|(field, msg)| {
            Error::schema_mismatch(&name, format!("{}: {}", field, msg))
        })?;
        serde_json::from_value::<T>(sample).map_err(|e| {
            Error::schema_mismatch(&name, format!("cannot decode {}: {}", type_name::<T>(), e))
        })?;

        debug!(
            schema = %name,
            version = %resolved.version,
            identity = %identity,
            "Schema descriptor loaded"
        );

        Ok(Self {
            identity,
            version: resolved.version,
            lineage: Arc::new(lineage),
            open_api,
            runtime_types: RuntimeTypes {
                resource: type_name::<K>(),
                list: type_name::<ObjectList<K>>(),
            },
        })
    }

    /// Canonical name of the schematized object (the lineage name)
    pub fn name(&self) -> &str {
        self.lineage.name()
    }

    /// Control-plane identity of the resource type
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Schema version the compiled model was validated against
    pub fn version(&self) -> SyntacticVersion {
        self.version
    }

    /// The full canonical lineage
    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// OpenAPI v3 shape registered with the control plane
    pub fn open_api_shape(&self) -> &JSONSchemaProps {
        &self.open_api
    }

    /// Compiled resource and list types of the kind
    pub fn runtime_sample_types(&self) -> RuntimeTypes {
        self.runtime_types
    }
}
