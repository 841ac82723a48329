//! Control-plane object to store record projection
//!
//! Every spec field maps to exactly one record field. Secure JSON data has no
//! counterpart in the resource and is never written here.

use serde_json::{Map, Value};
use tracing::warn;

use kubebridge_common::Error;

use crate::crd::DataSource;
use crate::store::DataSourceRecord;

/// Project a DataSource onto its store record
///
/// Fails when the object has no name or UID, since the record could not be
/// addressed.
pub fn to_record(ds: &DataSource) -> Result<DataSourceRecord, Error> {
    let meta = &ds.metadata;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Error::validation_for("<unnamed>", "object has no name"))?;
    let uid = meta
        .uid
        .clone()
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| Error::validation_for(&name, "object has no UID"))?;
    let spec = &ds.spec;

    Ok(DataSourceRecord {
        json_data: parse_json_data(&name, &spec.json_data),
        uid,
        name,
        namespace: meta.namespace.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        type_: spec.type_.clone(),
        access: spec.access.clone(),
        url: spec.url.clone(),
        password: spec.password.clone(),
        database: spec.database.clone(),
        user: spec.user.clone(),
        basic_auth: spec.basic_auth,
        basic_auth_user: spec.basic_auth_user.clone(),
        basic_auth_password: spec.basic_auth_password.clone(),
        with_credentials: spec.with_credentials,
        is_default: spec.is_default,
    })
}

/// Parse the opaque jsonData text; empty or malformed text becomes `{}`
fn parse_json_data(name: &str, text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(datasource = %name, error = %e, "Malformed jsonData, storing empty object");
            Value::Object(Map::new())
        }
    }
}
