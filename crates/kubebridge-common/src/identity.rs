//! Resource identities and object keys
//!
//! A [`ResourceIdentity`] names a resource type (group, version, kind) and
//! keys both schemas and clients. An [`ObjectKey`] names one object of that
//! type and is what a reconciler is handed.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::discovery::ApiResource;
use kube::Resource;

use crate::kube_utils::pluralize_kind;

/// The (group, version, kind) triple identifying a resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    /// API group (e.g. "core.kubebridge.io")
    pub group: String,
    /// API version within the group (e.g. "v1alpha1")
    pub version: String,
    /// Kind (e.g. "DataSource")
    pub kind: String,
}

impl ResourceIdentity {
    /// Create a new identity
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Identity declared by a compiled resource type
    pub fn of<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    /// The group/version half of the identity
    pub fn group_version(&self) -> GroupVersion {
        GroupVersion {
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }

    /// Full apiVersion string ("group/version", or "version" for the core group)
    pub fn api_version(&self) -> String {
        self.group_version().api_version()
    }

    /// Lowercased plural resource name (e.g. "datasources")
    pub fn plural(&self) -> String {
        pluralize_kind(&self.kind)
    }

    /// Name of the CustomResourceDefinition registering this type
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural(), self.group)
    }

    /// Build the dynamic `ApiResource` for this identity
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            api_version: self.api_version(),
            plural: self.plural(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// The (group, version) pair keying cached clients
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersion {
    /// API group
    pub group: String,
    /// API version
    pub version: String,
}

impl GroupVersion {
    /// Full apiVersion string
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.api_version())
    }
}

/// Key of one object: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key for the object described by `meta`, if it is named
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let name = meta.name.clone()?;
        Some(Self {
            namespace: meta.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}
