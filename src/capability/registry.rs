use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Capability, Context};
use crate::error::{EngineError, Result};

/// Catalog entry handed to planners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
}

/// Name → capability table, immutable once built
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    /// Build a registry from a static list; duplicate names are rejected
    pub fn from_capabilities(
        capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
    ) -> Result<Self> {
        let mut builder = Self::builder();
        for capability in capabilities {
            builder = builder.register(capability);
        }
        builder.build()
    }

    /// Registry with the built-in capabilities
    pub fn with_builtins() -> Result<Self> {
        Self::from_capabilities(super::builtin::all())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn catalog(&self) -> Vec<CapabilityInfo> {
        self.capabilities
            .values()
            .map(|capability| CapabilityInfo {
                name: capability.name().to_string(),
                description: capability.description().to_string(),
            })
            .collect()
    }

    /// Catalog serialized for inclusion in planning prompts
    pub fn catalog_json(&self) -> String {
        serde_json::to_string_pretty(&self.catalog()).unwrap_or_else(|_| "[]".to_string())
    }

    /// Names of capabilities whose pre-filter accepts the context
    pub fn candidates(&self, context: &Context) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|(_, capability)| capability.can_handle(context))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Collects capabilities and fails the build on the first duplicate name
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistryBuilder {
    pub fn register(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn build(self) -> Result<CapabilityRegistry> {
        let mut capabilities = BTreeMap::new();
        for capability in self.capabilities {
            let name = capability.name().to_string();
            if capabilities.contains_key(&name) {
                return Err(EngineError::DuplicateCapability(name));
            }
            capabilities.insert(name, capability);
        }
        tracing::debug!(count = capabilities.len(), "capability registry built");
        Ok(CapabilityRegistry { capabilities })
    }
}
