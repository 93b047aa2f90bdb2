//! Coordinator configuration (`claimgrid.toml`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};

pub const DEFAULT_MAX_POTENTIAL_NODES: usize = 128;
pub const DEFAULT_MAX_RESERVED_FOR: usize = 32;
pub const DEFAULT_FINALIZER: &str = "claimgrid.io/delete-protection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Master switch. When off, PreFilter skips every workload.
    pub enabled: bool,
    /// Namespaces whose workloads are skipped as if disabled.
    pub disabled_namespaces: Vec<String>,
    /// Allow claims whose allocation is delegated to a controller.
    pub control_plane_controller: bool,
    /// Upper bound on `ControlPlaneContext.spec.potential_nodes`.
    pub max_potential_nodes: usize,
    /// Upper bound on `ResourceClaim.status.reserved_for`.
    pub max_reserved_for: usize,
    /// Finalizer protecting claims allocated by the coordinator.
    pub finalizer: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_namespaces: Vec::new(),
            control_plane_controller: true,
            max_potential_nodes: DEFAULT_MAX_POTENTIAL_NODES,
            max_reserved_for: DEFAULT_MAX_RESERVED_FOR,
            finalizer: DEFAULT_FINALIZER.to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.max_potential_nodes == 0 {
            return Err(CoordinatorError::Config(
                "max_potential_nodes must be at least 1".to_string(),
            ));
        }
        if self.max_reserved_for == 0 {
            return Err(CoordinatorError::Config(
                "max_reserved_for must be at least 1".to_string(),
            ));
        }
        if self.finalizer.trim().is_empty() {
            return Err(CoordinatorError::Config("finalizer must not be empty".to_string()));
        }
        Ok(())
    }

    /// Whether the coordinator handles workloads in `namespace`.
    pub fn enabled_for(&self, namespace: &str) -> bool {
        self.enabled && !self.disabled_namespaces.iter().any(|ns| ns == namespace)
    }
}
