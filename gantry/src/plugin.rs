use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::job::RunJob;

/// Out-of-band submission parameters passed through to plugins untouched.
pub type SubmitInfo = serde_json::Map<String, serde_json::Value>;

/// Jobs a plugin took or refused during `submit`.
#[derive(Clone, Debug, Default)]
pub struct SubmitOutcome {
    pub accepted: Vec<RunJob>,
    pub rejected: Vec<RunJob>,
}

/// Result of one tracking pass over a plugin's jobs.
#[derive(Clone, Debug, Default)]
pub struct TrackOutcome {
    /// Jobs whose status moved and must be written back.
    pub changed: Vec<RunJob>,
    /// Jobs the backend considers done.
    pub finished: Vec<RunJob>,
}

/// Backend-specific implementation of the job lifecycle for one class of
/// batch or grid resource manager.
///
/// Implementations own their transport, credentials and polling protocol.
/// Calls may block on external systems; the coordinator bounds them with the
/// configured timeout.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Statuses this backend can assign to a job.
    fn states(&self) -> Vec<String>;

    /// Pre-flight validation such as proxy or credential checks.
    async fn check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn submit(
        &self,
        jobs: Vec<RunJob>,
        info: Option<&SubmitInfo>,
    ) -> anyhow::Result<SubmitOutcome>;

    async fn track(&self, jobs: Vec<RunJob>) -> anyhow::Result<TrackOutcome>;

    async fn kill(&self, jobs: &[RunJob]) -> anyhow::Result<()>;

    /// Backend-side teardown once a job leaves the running set.
    async fn complete(&self, jobs: &[RunJob]) -> anyhow::Result<()>;
}

/// Plugin call kinds, used for error reporting and telemetry labels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PluginOperation {
    Check,
    Submit,
    Track,
    Kill,
    Complete,
}

impl PluginOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginOperation::Check => "check",
            PluginOperation::Submit => "submit",
            PluginOperation::Track => "track",
            PluginOperation::Kill => "kill",
            PluginOperation::Complete => "complete",
        }
    }
}

impl fmt::Display for PluginOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constructor for a named plugin.
pub type PluginFactory =
    Arc<dyn Fn(&CoordinatorConfig) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;

/// Static table of the plugins this process knows how to build.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("PluginCatalog").field("names", &names).finish()
    }
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&CoordinatorConfig) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Builder-style variant of [`PluginCatalog::register`].
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&CoordinatorConfig) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the plugin registered under `name`.
    pub fn instantiate(&self, name: &str, config: &CoordinatorConfig) -> Result<Arc<dyn Plugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CoordinatorError::PluginLoad {
                plugin: name.to_string(),
                source: anyhow::anyhow!("no factory registered under this name"),
            })?;
        factory(config).map_err(|source| CoordinatorError::PluginLoad {
            plugin: name.to_string(),
            source,
        })
    }
}

/// Live plugin instances keyed by name. Read-only once built.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("names", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Instantiate every plugin named in `config.plugin_names`.
    ///
    /// Any name the catalog cannot build aborts loading.
    pub fn load(config: &CoordinatorConfig, catalog: &PluginCatalog) -> Result<Self> {
        Self::assemble(config, catalog, Vec::new())
    }

    /// Combine pre-built instances with catalog-built ones. Instances take
    /// precedence over catalog entries of the same name.
    pub fn assemble(
        config: &CoordinatorConfig,
        catalog: &PluginCatalog,
        instances: Vec<(String, Arc<dyn Plugin>)>,
    ) -> Result<Self> {
        let mut plugins: BTreeMap<String, Arc<dyn Plugin>> = instances.into_iter().collect();

        for name in &config.plugin_names {
            if plugins.contains_key(name) {
                continue;
            }
            let plugin = catalog.instantiate(name, config)?;
            tracing::info!(plugin = %name, "loaded plugin");
            plugins.insert(name.clone(), plugin);
        }

        if plugins.is_empty() {
            return Err(CoordinatorError::NoPlugins);
        }

        Ok(Self { plugins })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Plugin>)> {
        self.plugins.iter().map(|(name, plugin)| (name.as_str(), plugin))
    }

    /// Union of every loaded plugin's declared statuses.
    pub fn states(&self) -> BTreeSet<String> {
        self.plugins
            .values()
            .flat_map(|plugin| plugin.states())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPlugin {
        states: Vec<&'static str>,
    }

    #[async_trait]
    impl Plugin for StaticPlugin {
        fn states(&self) -> Vec<String> {
            self.states.iter().map(|s| s.to_string()).collect()
        }

        async fn submit(
            &self,
            jobs: Vec<RunJob>,
            _info: Option<&SubmitInfo>,
        ) -> anyhow::Result<SubmitOutcome> {
            Ok(SubmitOutcome {
                accepted: jobs,
                rejected: Vec::new(),
            })
        }

        async fn track(&self, _jobs: Vec<RunJob>) -> anyhow::Result<TrackOutcome> {
            Ok(TrackOutcome::default())
        }

        async fn kill(&self, _jobs: &[RunJob]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn complete(&self, _jobs: &[RunJob]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn catalog() -> PluginCatalog {
        PluginCatalog::new()
            .with("TestPlugin", |_config| {
                Ok(Arc::new(StaticPlugin {
                    states: vec!["Dead", "Gone"],
                }) as Arc<dyn Plugin>)
            })
            .with("CondorPlugin", |_config| {
                Ok(Arc::new(StaticPlugin {
                    states: vec!["Idle", "Running", "Held", "Complete", "Gone"],
                }) as Arc<dyn Plugin>)
            })
            .with("BrokenPlugin", |_config| {
                Err(anyhow::anyhow!("proxy certificate missing"))
            })
    }

    #[test]
    fn loads_configured_plugins() {
        let config = CoordinatorConfig::new(["TestPlugin", "CondorPlugin"]);
        let registry = PluginRegistry::load(&config, &catalog()).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("TestPlugin"));
        assert!(registry.contains("CondorPlugin"));
        assert_eq!(
            registry.states().into_iter().collect::<Vec<_>>(),
            vec!["Complete", "Dead", "Gone", "Held", "Idle", "Running"]
        );
    }

    #[test]
    fn unknown_name_is_fatal() {
        let config = CoordinatorConfig::new(["TestPlugin", "gLitePlugin"]);
        let err = PluginRegistry::load(&config, &catalog()).unwrap_err();
        match err {
            CoordinatorError::PluginLoad { plugin, .. } => assert_eq!(plugin, "gLitePlugin"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn factory_failure_is_fatal() {
        let config = CoordinatorConfig::new(["BrokenPlugin"]);
        let err = PluginRegistry::load(&config, &catalog()).unwrap_err();
        assert!(err.to_string().contains("proxy certificate missing"));
    }

    #[test]
    fn empty_configuration_is_rejected() {
        let config = CoordinatorConfig::default();
        assert!(matches!(
            PluginRegistry::load(&config, &catalog()),
            Err(CoordinatorError::NoPlugins)
        ));
    }

    #[test]
    fn instances_shadow_catalog_entries() {
        let config = CoordinatorConfig::new(["TestPlugin"]);
        let fake: Arc<dyn Plugin> = Arc::new(StaticPlugin {
            states: vec!["Scripted"],
        });
        let registry =
            PluginRegistry::assemble(&config, &catalog(), vec![("TestPlugin".into(), fake)])
                .unwrap();
        assert_eq!(
            registry.states().into_iter().collect::<Vec<_>>(),
            vec!["Scripted"]
        );
    }
}
