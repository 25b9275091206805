use std::time::Duration;

use thiserror::Error;

use crate::plugin::PluginOperation;

/// Errors surfaced by the coordinator.
///
/// `UnknownStatus` and `UnroutablePlugin` are consistency errors: they mean
/// the loaded plugins and the durable state disagree, and they are never
/// corrected locally. Gateway failures pass through untouched as
/// `Persistence`.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("status {status:?} is not registered; the loaded plugins do not produce it")]
    UnknownStatus { status: String },

    #[error("{operation} references plugin {plugin:?}, which is not loaded")]
    UnroutablePlugin {
        plugin: String,
        operation: PluginOperation,
    },

    #[error("failed to load plugin {plugin:?}: {source}")]
    PluginLoad {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no plugins configured")]
    NoPlugins,

    #[error("{0} dependency missing")]
    MissingDependency(&'static str),

    #[error("plugin {plugin:?} failed during {operation}: {source}")]
    Plugin {
        plugin: String,
        operation: PluginOperation,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin {plugin:?} did not finish {operation} within {timeout:?}")]
    PluginTimeout {
        plugin: String,
        operation: PluginOperation,
        timeout: Duration,
    },

    #[error("pre-flight check failed for plugin {plugin:?}: {source}")]
    PluginCheck {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Persistence(anyhow::Error),
}

impl CoordinatorError {
    /// True for errors that indicate a mismatch between configuration and
    /// durable state rather than a transient failure.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            CoordinatorError::UnknownStatus { .. } | CoordinatorError::UnroutablePlugin { .. }
        )
    }

    pub(crate) fn plugin(
        plugin: impl Into<String>,
        operation: PluginOperation,
        source: anyhow::Error,
    ) -> Self {
        CoordinatorError::Plugin {
            plugin: plugin.into(),
            operation,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
