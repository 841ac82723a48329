//! DataSource coremodel
//!
//! Binds the DataSource kind to the bridge: its schema descriptor (validated
//! against the embedded lineage) and its controller.

use std::sync::Arc;

use kubebridge_common::runtime::ControllerDef;
use kubebridge_common::schema::{SchemaSource, SyntacticVersion};
use kubebridge_common::{Bridge, Coremodel, Error, SchemaDescriptor};
use tracing::info;

use crate::controller::{DataSourceReconciler, CONTROLLER_NAME};
use crate::crd::{self, DataSource, DataSourceSpec};
use crate::store::DataSourceStore;

/// Canonical lineage of the DataSource model
pub const LINEAGE: SchemaSource = SchemaSource::Embedded {
    name: "datasource.json",
    contents: include_str!("../schema/datasource.json"),
};

/// Schema version the compiled model targets
pub const SCHEMA_VERSION: SyntacticVersion = SyntacticVersion::new(0, 0);

/// The DataSource resource kind
pub struct DataSourceModel {
    schema: SchemaDescriptor,
    store: Arc<dyn DataSourceStore>,
}

impl DataSourceModel {
    /// Validate the compiled model against its lineage and bind it to `store`
    pub fn provide(store: Arc<dyn DataSourceStore>) -> Result<Self, Error> {
        let schema = SchemaDescriptor::load::<DataSourceSpec, DataSource>(
            &LINEAGE,
            SCHEMA_VERSION,
            crd::identity(),
            crd::open_api_shape()?,
        )?;
        Ok(Self { schema, store })
    }
}

impl Coremodel for DataSourceModel {
    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn attach_controller(&self, bridge: &mut dyn Bridge) -> Result<(), Error> {
        let client = bridge.client_for(self.schema.identity())?;
        let reconciler = DataSourceReconciler::new(Arc::new(client.clone()), self.store.clone());
        bridge.add_controller(ControllerDef::watching::<DataSource>(
            CONTROLLER_NAME,
            &client,
            Arc::new(reconciler),
        )?)?;
        info!(controller = CONTROLLER_NAME, kind = %self.schema.identity(), "Attached controller");
        Ok(())
    }
}
