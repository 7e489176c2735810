//! Capabilities
//!
//! A capability is a named, pluggable unit of work. The engine addresses
//! capabilities only by name through the [`CapabilityRegistry`]; there is no
//! discovery at runtime, every capability is registered explicitly at startup.

use anyhow::Result;
use async_trait::async_trait;

pub mod builtin;
pub mod registry;
pub mod result;

pub use builtin::{EchoCapability, ShellCapability, SleepCapability};
pub use registry::{CapabilityInfo, CapabilityRegistry, CapabilityRegistryBuilder};
pub use result::{merge_details, overlay_arguments, Context, ResultStatus, StepResult};

#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique, stable identifier
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether a human must confirm before this capability runs inside a plan
    fn requires_approval(&self) -> bool {
        false
    }

    /// Cheap pre-filter used when suggesting capabilities for a context.
    /// Executors never consult it.
    fn can_handle(&self, _context: &Context) -> bool {
        true
    }

    /// Run the capability. A returned `Err` and an `Ok` result with
    /// [`ResultStatus::Failure`] are both treated as step failures.
    async fn execute(&self, context: Context) -> Result<StepResult>;
}
