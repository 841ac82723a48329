//! Bridge service
//!
//! Composes the registered kinds, the client set, and the controller manager:
//! every kind's type is registered and given a client, every kind attaches
//! its controller, and the controllers run until [`BridgeService::stop`].

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kubebridge_common::clientset::{KubeTypeRegistrar, TypeRegistrar};
use kubebridge_common::kube_utils::create_client;
use kubebridge_common::runtime::{
    ControllerDef, ControllerManager, EventReporter, FailureReporter, RunningManager,
};
use kubebridge_common::{
    Bridge, ClientSet, Error, ResourceIdentity, SchemaDescriptor, TypedClient, CONTROLLER_NAME,
};

use crate::config::BridgeConfig;
use crate::registry::ModelRegistry;

/// A running bridge
pub struct BridgeService {
    clients: Arc<ClientSet>,
    running: RunningManager,
    shutdown_grace: Duration,
}

/// What kinds see while attaching their controllers
struct Wiring<'a> {
    clients: &'a ClientSet,
    manager: ControllerManager,
}

impl Bridge for Wiring<'_> {
    fn client_for(&self, identity: &ResourceIdentity) -> Result<TypedClient, Error> {
        self.clients.client_for(identity)
    }

    fn add_controller(&mut self, controller: ControllerDef) -> Result<(), Error> {
        self.manager.add(controller)
    }
}

impl BridgeService {
    /// Connect to the cluster described by `config` and start every kind in `registry`
    pub async fn start(config: &BridgeConfig, registry: &ModelRegistry) -> Result<Self, Error> {
        config.validate()?;
        let client = create_client(config.kubeconfig.as_deref()).await?;
        let registrar = KubeTypeRegistrar::new(client.clone());
        let failures = Arc::new(EventReporter::new(client.clone(), CONTROLLER_NAME));
        Self::start_with(client, &registrar, failures, config, registry).await
    }

    /// Start with explicit collaborators
    ///
    /// Fails without starting anything if a type cannot be registered or a
    /// kind cannot attach its controller.
    pub async fn start_with(
        client: Client,
        registrar: &dyn TypeRegistrar,
        failures: Arc<dyn FailureReporter>,
        config: &BridgeConfig,
        registry: &ModelRegistry,
    ) -> Result<Self, Error> {
        let descriptors: Vec<SchemaDescriptor> = registry
            .coremodels()
            .iter()
            .map(|model| model.schema().clone())
            .collect();
        let clients = Arc::new(ClientSet::build(client, registrar, &descriptors).await?);

        let mut wiring = Wiring {
            clients: &clients,
            manager: ControllerManager::new(config.manager_options(), failures),
        };
        for model in registry.coremodels() {
            model.attach_controller(&mut wiring)?;
        }
        let controllers = wiring.manager.controller_names().join(",");
        let running = wiring.manager.start();

        info!(
            kinds = descriptors.len(),
            controllers = %controllers,
            "Bridge service started"
        );

        Ok(Self {
            clients,
            running,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Client for `identity`, for access outside the reconcile path
    pub fn client_for(&self, identity: &ResourceIdentity) -> Result<TypedClient, Error> {
        self.clients.client_for(identity)
    }

    /// Shared handle to the client set
    pub fn client_set(&self) -> Arc<ClientSet> {
        self.clients.clone()
    }

    /// Number of running controllers
    pub fn controller_count(&self) -> usize {
        self.running.controller_count()
    }

    /// Configured grace period for [`BridgeService::stop_gracefully`]
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Stop the controllers, waiting for in-flight reconciles until `abort` fires
    pub async fn stop(self, abort: CancellationToken) {
        self.running.stop(abort).await;
        info!("Bridge service stopped");
    }

    /// Stop, cancelling in-flight reconciles after the configured grace period
    pub async fn stop_gracefully(self) {
        let abort = CancellationToken::new();
        let timer = {
            let abort = abort.clone();
            let grace = self.shutdown_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                abort.cancel();
            })
        };
        self.stop(abort).await;
        timer.abort();
    }
}
