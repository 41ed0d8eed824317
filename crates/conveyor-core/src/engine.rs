//! Engine seam.
//!
//! The engine owns build execution. The scheduler hands it a (build, plan)
//! pair and walks away; resuming the accepted build happens on a task of
//! its own and is never joined by the scheduling tick.

use std::sync::Arc;

use async_trait::async_trait;

use crate::build::Build;
use crate::plan::Plan;
use crate::Result;

/// A build the engine has accepted, ready to run.
#[async_trait]
pub trait EngineBuild: Send + Sync {
    /// Drive the build to completion.
    async fn resume(&self);
}

/// Accepts scheduled builds for execution.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn create_build(&self, build: &Build, plan: Plan) -> Result<Arc<dyn EngineBuild>>;
}
