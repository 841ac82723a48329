//! DataSource CRD
//!
//! A DataSource describes a connection to an external data backend. The
//! bridge mirrors every DataSource into the internal store.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use kubebridge_common::{Error, ResourceIdentity, BRIDGE_API_GROUP};

/// API version of the DataSource kind
pub const DATASOURCE_VERSION: &str = "v1alpha1";

/// Kind name of the DataSource resource
pub const DATASOURCE_KIND: &str = "DataSource";

/// DataSource is a connection to an external data backend.
///
/// Example:
/// ```yaml
/// apiVersion: core.kubebridge.io/v1alpha1
/// kind: DataSource
/// metadata:
///   name: prometheus
///   namespace: team-a
/// spec:
///   type: prometheus
///   access: proxy
///   url: http://prometheus.monitoring:9090
///   isDefault: true
///   jsonData: '{"httpMethod":"POST"}'
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.kubebridge.io",
    version = "v1alpha1",
    kind = "DataSource",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Default","type":"boolean","jsonPath":".spec.isDefault"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSourceSpec {
    /// Backend type (e.g. "prometheus", "postgres")
    #[serde(rename = "type")]
    pub type_: String,

    /// Access mode: "proxy" (server-side) or "direct" (browser)
    pub access: String,

    /// Backend URL
    pub url: String,

    /// Backend password
    pub password: String,

    /// Database name, for backends that have one
    pub database: String,

    /// Backend user
    pub user: String,

    /// Whether HTTP basic auth is used
    pub basic_auth: bool,

    /// Basic auth user
    pub basic_auth_user: String,

    /// Basic auth password
    pub basic_auth_password: String,

    /// Whether cookies and auth headers are forwarded on cross-site requests
    pub with_credentials: bool,

    /// Whether this is the default data source
    pub is_default: bool,

    /// Backend-specific settings, as JSON text
    pub json_data: String,
}

/// Control-plane identity of the DataSource kind
pub fn identity() -> ResourceIdentity {
    ResourceIdentity::new(BRIDGE_API_GROUP, DATASOURCE_VERSION, DATASOURCE_KIND)
}

/// OpenAPI v3 schema registered for the DataSource kind
pub fn open_api_shape() -> Result<JSONSchemaProps, Error> {
    DataSource::crd()
        .spec
        .versions
        .into_iter()
        .find(|v| v.name == DATASOURCE_VERSION)
        .and_then(|v| v.schema)
        .and_then(|s| s.open_api_v3_schema)
        .ok_or_else(|| {
            Error::internal_with_context("datasource", "generated CRD carries no OpenAPI schema")
        })
}
