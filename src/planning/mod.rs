//! Planning and remediation
//!
//! Both talk to the reasoning backend and share the same strict-then-lenient
//! JSON handling in [`json`].

pub mod json;
pub mod planner;
pub mod remediation;
pub mod types;

pub use planner::{parse_plan, parse_workflow, Planner};
pub use remediation::{FailFastAdvisor, LlmRemediationAdvisor, RemediationAdvisor};
pub use types::{PlanStep, RemediationAction, RemediationPlan, WorkflowNode};
