//! Store contract and PostgreSQL implementations.

pub mod build;
pub mod pipeline;

pub use build::{BuildRepo, PgBuildRepo, SchedulingLease};
pub use pipeline::{PgPipelineRepo, PipelineRepo};
