//! Job and resource configuration.
//!
//! Configuration is immutable within a scheduling tick; the scheduler
//! receives it fully parsed and never writes it back.

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Configuration for a single job in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name, unique within the pipeline.
    pub name: String,
    /// Named inputs, in declaration order.
    #[serde(default)]
    pub inputs: Vec<JobInput>,
    /// Named outputs pushed after the tasks run.
    #[serde(default)]
    pub outputs: Vec<JobOutput>,
    /// Plan template: tasks executed between the input gets and output puts.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    /// Maximum number of builds of this job allowed to run at once.
    pub max_in_flight: Option<u32>,
    /// Serial groups this job participates in. A non-empty list also caps
    /// the job at one running build.
    #[serde(default)]
    pub serial_groups: Vec<String>,
    /// Whether the job is paused.
    #[serde(default)]
    pub paused: bool,
}

/// One declared input of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    /// Input name, unique within the job.
    pub name: String,
    /// Name of the resource this input fetches.
    pub resource: String,
    /// Whether new versions of this input trigger builds.
    #[serde(default)]
    pub trigger: bool,
    /// Which versions qualify. Absent means latest.
    pub version: Option<VersionConstraint>,
}

/// Gate on which versions of an input qualify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionConstraint {
    /// Newest available version.
    Latest,
    /// Build once per discovered version.
    Every,
    /// Exactly this version.
    Pinned(Version),
}

/// One declared output of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    /// Output name, unique within the job.
    pub name: String,
    /// Name of the resource this output pushes to.
    pub resource: String,
    /// Resource-specific push parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One task of the job's plan template. The task body is opaque to the
/// scheduler; the engine interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub config: serde_json::Value,
}

/// A named external resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource name, unique within the pipeline.
    pub name: String,
    /// Resource type (e.g. "git", "registry-image").
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Type-specific source parameters.
    pub source: serde_json::Value,
}
