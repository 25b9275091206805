use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::error::{CoordinatorError, Result};
use crate::persistence::PersistenceGateway;
use crate::plugin::{Plugin, PluginCatalog, PluginRegistry};

/// Builder for constructing a [`Coordinator`] with explicit dependencies.
///
/// Plugins come from two places: the catalog, which builds every name in
/// `config.plugin_names`, and instances registered directly with
/// [`CoordinatorBuilder::with_plugin`]. Direct instances win on a name clash.
///
/// # Example
///
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(CoordinatorConfig::new(["CondorPlugin"]))
///     .with_gateway(Arc::new(gateway))
///     .with_catalog(catalog)
///     .build()
///     .await?;
/// ```
pub struct CoordinatorBuilder<G: PersistenceGateway + 'static> {
    config: CoordinatorConfig,
    gateway: Option<Arc<G>>,
    catalog: PluginCatalog,
    instances: Vec<(String, Arc<dyn Plugin>)>,
}

impl<G: PersistenceGateway + 'static> fmt::Debug for CoordinatorBuilder<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CoordinatorBuilder");
        debug.field("config", &self.config);
        debug.field("gateway_set", &self.gateway.is_some());
        debug.field("catalog", &self.catalog);
        debug.field(
            "instances",
            &self.instances.iter().map(|(name, _)| name).collect::<Vec<_>>(),
        );

        if self.gateway.is_some() {
            debug.field("gateway_type", &type_name::<G>());
        }

        debug.finish()
    }
}

impl<G: PersistenceGateway + 'static> CoordinatorBuilder<G> {
    /// Create a new builder with the given configuration.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            gateway: None,
            catalog: PluginCatalog::new(),
            instances: Vec::new(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the persistence gateway.
    pub fn with_gateway(mut self, gateway: Arc<G>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the catalog used to build configured plugins.
    pub fn with_catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Register a ready-made plugin under `name`.
    pub fn with_plugin(mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        self.instances.push((name.into(), plugin));
        self
    }

    /// Load plugins, register the status vocabulary and start the coordinator.
    ///
    /// # Errors
    ///
    /// Returns `MissingDependency` without a gateway, `PluginLoad` or
    /// `NoPlugins` if the plugin set cannot be assembled, and `Persistence`
    /// if the states cannot be registered.
    pub async fn build(self) -> Result<Coordinator<G>> {
        let gateway = self
            .gateway
            .ok_or(CoordinatorError::MissingDependency("gateway"))?;
        let plugins = PluginRegistry::assemble(&self.config, &self.catalog, self.instances)?;

        Coordinator::start(self.config, plugins, gateway).await
    }
}
