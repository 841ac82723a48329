//! Resource-kind capability set
//!
//! Every resource kind the bridge serves is a [`Coremodel`]: it exposes its
//! schema descriptor and, once the client set exists, attaches its controller
//! through the [`Bridge`] it is handed.

use crate::clientset::TypedClient;
use crate::identity::ResourceIdentity;
use crate::runtime::ControllerDef;
use crate::schema::SchemaDescriptor;
use crate::Error;

/// What a resource kind offers the bridge
pub trait Coremodel: Send + Sync {
    /// Schema descriptor validated at construction
    fn schema(&self) -> &SchemaDescriptor;

    /// Build this kind's controller and register it with `bridge`
    fn attach_controller(&self, bridge: &mut dyn Bridge) -> Result<(), Error>;
}

/// What the bridge offers a resource kind while it is being wired
pub trait Bridge {
    /// Client for a registered identity
    fn client_for(&self, identity: &ResourceIdentity) -> Result<TypedClient, Error>;

    /// Register a controller with the watch/dispatch runtime
    fn add_controller(&mut self, controller: ControllerDef) -> Result<(), Error>;
}
