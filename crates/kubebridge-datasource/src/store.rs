//! Store contract for data sources
//!
//! The bridge only assumes the CRUD contract below. Records are addressed by
//! the control-plane UID for reads and writes, and by namespace and name for
//! deletes. Names are only unique within a namespace.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use kubebridge_common::{Error, StoreError};

/// The internal-store representation of a DataSource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceRecord {
    /// Control-plane UID; the stable key of the record
    pub uid: String,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Control-plane resourceVersion the record was written from
    pub resource_version: String,
    /// Backend type
    #[serde(rename = "type")]
    pub type_: String,
    /// Access mode
    pub access: String,
    /// Backend URL
    pub url: String,
    /// Backend password
    pub password: String,
    /// Database name
    pub database: String,
    /// Backend user
    pub user: String,
    /// Whether HTTP basic auth is used
    pub basic_auth: bool,
    /// Basic auth user
    pub basic_auth_user: String,
    /// Basic auth password
    pub basic_auth_password: String,
    /// Whether credentials are forwarded on cross-site requests
    pub with_credentials: bool,
    /// Whether this is the default data source
    pub is_default: bool,
    /// Backend-specific settings
    pub json_data: Value,
}

impl DataSourceRecord {
    /// Optimistic-concurrency version derived from the resourceVersion
    pub fn store_version(&self) -> Result<i64, Error> {
        self.resource_version
            .parse::<i64>()
            .map_err(|_| Error::InvalidResourceVersion {
                name: self.name.clone(),
                value: self.resource_version.clone(),
            })
    }
}

/// CRUD contract of the data source store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataSourceStore: Send + Sync {
    /// Record with `uid`; `StoreError::NotFound` if there is none
    async fn get(&self, uid: &str) -> Result<DataSourceRecord, StoreError>;

    /// Create a record; fails if one with the same UID exists
    async fn insert(&self, record: &DataSourceRecord) -> Result<(), StoreError>;

    /// Overwrite the record with the same UID
    async fn update(&self, record: &DataSourceRecord) -> Result<(), StoreError>;

    /// Remove the record for `namespace`/`name`; `StoreError::NotFound` if
    /// there is none
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// In-memory store keyed by UID
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, DataSourceRecord>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by UID
    pub fn records(&self) -> Vec<DataSourceRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.uid.cmp(&b.uid));
        records
    }
}

fn version_of(record: &DataSourceRecord) -> Result<i64, StoreError> {
    record
        .resource_version
        .parse::<i64>()
        .map_err(|_| StoreError::stale(&record.uid, "resourceVersion is not a store version"))
}

#[async_trait]
impl DataSourceStore for MemoryStore {
    async fn get(&self, uid: &str) -> Result<DataSourceRecord, StoreError> {
        self.records
            .get(uid)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::not_found(uid))
    }

    async fn insert(&self, record: &DataSourceRecord) -> Result<(), StoreError> {
        match self.records.entry(record.uid.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict {
                uid: record.uid.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                debug!(uid = %record.uid, name = %record.name, "Inserted data source");
                Ok(())
            }
        }
    }

    async fn update(&self, record: &DataSourceRecord) -> Result<(), StoreError> {
        let incoming = version_of(record)?;
        let mut current = self
            .records
            .get_mut(&record.uid)
            .ok_or_else(|| StoreError::not_found(&record.uid))?;

        if let Ok(stored) = current.resource_version.parse::<i64>() {
            if stored > incoming {
                return Err(StoreError::stale(
                    &record.uid,
                    format!("stored version {} is newer than {}", stored, incoming),
                ));
            }
        }
        *current = record.clone();
        debug!(uid = %record.uid, version = incoming, "Updated data source");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let uid = self
            .records
            .iter()
            .find(|r| r.value().namespace == namespace && r.value().name == name)
            .map(|r| r.key().clone())
            .ok_or_else(|| StoreError::not_found(format!("{}/{}", namespace, name)))?;
        self.records.remove(&uid);
        debug!(uid = %uid, namespace, name, "Deleted data source");
        Ok(())
    }
}
