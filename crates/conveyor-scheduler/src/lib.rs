//! Build scheduling for the Conveyor CI platform.
//!
//! The per-tick decision engine for a single job: decide when to create a
//! build, lease it for exclusive scheduling work, discover and commit its
//! input versions, materialize an execution plan, and hand off to the
//! engine. Mutual exclusion across scheduler replicas is delegated
//! entirely to the store's lease and atomic-create primitives.

pub mod factory;
pub mod scheduler;

pub use factory::StepPlanFactory;
pub use scheduler::{CompletionHandle, Scheduler, VersionSource};
