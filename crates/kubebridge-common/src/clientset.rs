//! Dynamic client set
//!
//! Built once at startup from the registered schema descriptors. For each
//! descriptor the resource type is registered with the control plane
//! (idempotently) and one [`TypedClient`] is created. The set is read-only
//! after [`ClientSet::build`] returns and is shared by handle across
//! controllers; nothing is constructed lazily.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;

use async_trait::async_trait;
use futures::future;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::identity::{GroupVersion, ObjectKey, ResourceIdentity};
use crate::schema::SchemaDescriptor;
use crate::{Error, CONTROLLER_NAME};

/// Outcome of registering a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The type definition was created by this call
    Created,
    /// The type definition was already present
    AlreadyExists,
}

/// Registers resource types with the control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TypeRegistrar: Send + Sync {
    /// Make sure the type definition for `identity` exists with `shape`.
    ///
    /// "Already exists" is a success. Any other failure is returned.
    async fn register_type(
        &self,
        identity: &ResourceIdentity,
        shape: &JSONSchemaProps,
    ) -> Result<Registration, Error>;
}

/// Registers resource types as CustomResourceDefinitions
pub struct KubeTypeRegistrar {
    client: Client,
}

impl KubeTypeRegistrar {
    /// Create a registrar using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TypeRegistrar for KubeTypeRegistrar {
    async fn register_type(
        &self,
        identity: &ResourceIdentity,
        shape: &JSONSchemaProps,
    ) -> Result<Registration, Error> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let name = identity.crd_name();
        let existing = crds.get_opt(&name).await?;

        // server-side apply leaves an up-to-date definition untouched
        let params = PatchParams::apply(CONTROLLER_NAME).force();
        crds.patch(&name, &params, &Patch::Apply(&build_crd(identity, shape)))
            .await?;

        if existing.is_some() {
            debug!(crd = %name, "Resource type already registered");
            Ok(Registration::AlreadyExists)
        } else {
            info!(crd = %name, "Registered resource type");
            Ok(Registration::Created)
        }
    }
}

/// Build the CustomResourceDefinition registering `identity`
///
/// Namespaced, a single served and stored version, validated by `shape`.
pub fn build_crd(identity: &ResourceIdentity, shape: &JSONSchemaProps) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(identity.crd_name()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: identity.group.clone(),
            scope: "Namespaced".to_string(),
            names: CustomResourceDefinitionNames {
                kind: identity.kind.clone(),
                plural: identity.plural(),
                singular: Some(identity.kind.to_lowercase()),
                list_kind: Some(format!("{}List", identity.kind)),
                ..Default::default()
            },
            versions: vec![CustomResourceDefinitionVersion {
                name: identity.version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(shape.clone()),
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// Reads single objects from the control plane
///
/// The seam between reconcilers and the network client; not-found is `None`.
#[async_trait]
pub trait ObjectGetter<K>: Send + Sync {
    /// Fetch the object at `key`, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error>;
}

/// Network client bound to exactly one resource identity
#[derive(Clone)]
pub struct TypedClient {
    client: Client,
    identity: ResourceIdentity,
}

impl TypedClient {
    /// Create a client for `identity` over a shared transport
    pub fn new(client: Client, identity: ResourceIdentity) -> Self {
        Self { client, identity }
    }

    /// Identity this client serves
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Typed API handle; refuses `K` whose static identity is not this client's
    pub fn api<K>(&self, namespace: Option<&str>) -> Result<Api<K>, Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let requested = ResourceIdentity::of::<K>();
        if requested != self.identity {
            return Err(Error::KindMismatch {
                expected: self.identity.to_string(),
                actual: requested.to_string(),
            });
        }
        Ok(match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        })
    }

    /// List objects, across all namespaces when `namespace` is `None`
    pub async fn list<K>(&self, namespace: Option<&str>) -> Result<Vec<K>, Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(namespace)?;
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl<K> ObjectGetter<K> for TypedClient
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        let api = self.api::<K>(key.namespace.as_deref())?;
        Ok(api.get_opt(&key.name).await?)
    }
}

/// Registered types and their clients, keyed by (group, version) then kind
pub struct ClientSet {
    clients: HashMap<GroupVersion, BTreeMap<String, TypedClient>>,
}

impl ClientSet {
    /// Register every descriptor's type and build one client per identity.
    ///
    /// Registrations run concurrently; the first failure aborts the build.
    /// Duplicate identities are rejected before anything is registered.
    pub async fn build(
        client: Client,
        registrar: &dyn TypeRegistrar,
        descriptors: &[SchemaDescriptor],
    ) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for descriptor in descriptors {
            if !seen.insert(descriptor.identity()) {
                return Err(Error::DuplicateIdentity {
                    identity: descriptor.identity().to_string(),
                });
            }
        }

        future::try_join_all(descriptors.iter().map(|descriptor| {
            registrar.register_type(descriptor.identity(), descriptor.open_api_shape())
        }))
        .await?;

        let mut clients: HashMap<GroupVersion, BTreeMap<String, TypedClient>> = HashMap::new();
        for descriptor in descriptors {
            let identity = descriptor.identity().clone();
            clients
                .entry(identity.group_version())
                .or_default()
                .insert(identity.kind.clone(), TypedClient::new(client.clone(), identity));
        }

        info!(
            types = descriptors.len(),
            group_versions = clients.len(),
            "Client set built"
        );

        Ok(Self { clients })
    }

    /// Client for `identity`; never constructs one lazily
    pub fn client_for(&self, identity: &ResourceIdentity) -> Result<TypedClient, Error> {
        self.clients
            .get(&identity.group_version())
            .and_then(|kinds| kinds.get(&identity.kind))
            .cloned()
            .ok_or_else(|| Error::NotRegistered {
                identity: identity.to_string(),
            })
    }

    /// Every identity with a client, in (group, version, kind) order
    pub fn identities(&self) -> Vec<ResourceIdentity> {
        let mut ids: Vec<_> = self
            .clients
            .values()
            .flat_map(|kinds| kinds.values().map(|c| c.identity().clone()))
            .collect();
        ids.sort();
        ids
    }
}
