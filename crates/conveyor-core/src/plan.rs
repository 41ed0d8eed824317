//! Execution plans and the factory seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{JobConfig, ResourceConfig};
use crate::version::{BuildInput, Version};
use crate::Result;

/// An ordered execution plan, handed to the engine together with its build.
///
/// Opaque to everything between the factory and the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub steps: Vec<PlanStep>,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanStep {
    /// Fetch one input at its committed version.
    Get {
        name: String,
        resource: String,
        version: Version,
    },
    /// Run one task from the job's plan template.
    Task {
        name: String,
        config: serde_json::Value,
    },
    /// Push one output.
    Put {
        name: String,
        resource: String,
        params: serde_json::Value,
    },
}

/// Turns a job, its resources, and committed input versions into a plan.
#[async_trait]
pub trait PlanFactory: Send + Sync {
    async fn create(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
        inputs: &[BuildInput],
    ) -> Result<Plan>;
}
