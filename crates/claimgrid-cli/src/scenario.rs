//! Scenario files. A scenario is a TOML snapshot of everything one
//! scheduling attempt sees: the workload, candidate nodes and stored objects.
//!
//! ```toml
//! [workload]
//! namespace = "default"
//! name = "inference"
//! uid = "w-1"
//!
//! [[workload.claims]]
//! name = "gpu"
//! source = { type = "claim_name", claim_name = "gpu-claim" }
//!
//! [[nodes]]
//! name = "node-a"
//!
//! [[classes]]
//! meta = { name = "gpu" }
//! selectors = ['device.driver == "gpu.example.com"']
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

use claimgrid_scheduler::CoordinatorConfig;
use claimgrid_state::{
    ControlPlaneContext, DeviceClass, Node, ResourceClaim, ResourceSlice, StateStore, Workload,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Coordinator settings; a `--config` file takes precedence.
    #[serde(default)]
    pub config: Option<CoordinatorConfig>,
    pub workload: Workload,
    /// Candidate nodes in the order the host would try them.
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub classes: Vec<DeviceClass>,
    #[serde(default)]
    pub claims: Vec<ResourceClaim>,
    #[serde(default)]
    pub slices: Vec<ResourceSlice>,
    #[serde(default)]
    pub contexts: Vec<ControlPlaneContext>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing scenario {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        if let Some(config) = &scenario.config {
            config.validate()?;
        }
        Ok(scenario)
    }

    /// Write every object of the scenario into `store`.
    pub fn populate(&self, store: &StateStore) -> anyhow::Result<()> {
        for class in &self.classes {
            store
                .create(class)
                .with_context(|| format!("creating device class {}", class.meta.name))?;
        }
        for slice in &self.slices {
            store
                .create(slice)
                .with_context(|| format!("creating resource slice {}", slice.meta.name))?;
        }
        for claim in &self.claims {
            store
                .create(claim)
                .with_context(|| format!("creating resource claim {}", claim.meta.key()))?;
        }
        for context in &self.contexts {
            store
                .create(context)
                .with_context(|| format!("creating control plane context {}", context.meta.key()))?;
        }
        debug!(
            classes = self.classes.len(),
            slices = self.slices.len(),
            claims = self.claims.len(),
            contexts = self.contexts.len(),
            "scenario loaded"
        );
        Ok(())
    }
}
