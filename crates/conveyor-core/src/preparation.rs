//! Per-build preparation records.
//!
//! Preparation is the observable answer to "why is this build not running
//! yet". The record is created with its build, mutated only by the
//! scheduling procedure while it holds the build's lease, and never
//! deleted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::BuildId;

/// Whether one concern is currently holding a build back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreparationStatus {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "blocking")]
    Blocking,
    #[serde(rename = "not-blocking")]
    NotBlocking,
}

impl PreparationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreparationStatus::Unknown => "unknown",
            PreparationStatus::Blocking => "blocking",
            PreparationStatus::NotBlocking => "not-blocking",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unknown" => Some(PreparationStatus::Unknown),
            "blocking" => Some(PreparationStatus::Blocking),
            "not-blocking" => Some(PreparationStatus::NotBlocking),
            _ => None,
        }
    }
}

/// Observable record describing what is holding a build back.
///
/// Every persisted update is one coherent snapshot: the record owns its
/// input map, and `Clone` deep-copies it, so a snapshot handed across the
/// store boundary never aliases a map a later update will mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPreparation {
    pub build_id: BuildId,
    pub paused_pipeline: PreparationStatus,
    pub paused_job: PreparationStatus,
    pub max_running_builds: PreparationStatus,
    /// Per-input status, keyed by input name.
    pub inputs: HashMap<String, PreparationStatus>,
    pub inputs_satisfied: PreparationStatus,
}

impl BuildPreparation {
    /// Fresh record for a newly created build: everything unknown.
    pub fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            paused_pipeline: PreparationStatus::Unknown,
            paused_job: PreparationStatus::Unknown,
            max_running_builds: PreparationStatus::Unknown,
            inputs: HashMap::new(),
            inputs_satisfied: PreparationStatus::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_exact() {
        assert_eq!(PreparationStatus::Unknown.as_str(), "unknown");
        assert_eq!(PreparationStatus::Blocking.as_str(), "blocking");
        assert_eq!(PreparationStatus::NotBlocking.as_str(), "not-blocking");

        let serialized = serde_json::to_string(&PreparationStatus::NotBlocking).unwrap();
        assert_eq!(serialized, "\"not-blocking\"");

        for status in [
            PreparationStatus::Unknown,
            PreparationStatus::Blocking,
            PreparationStatus::NotBlocking,
        ] {
            assert_eq!(PreparationStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn new_preparation_is_all_unknown() {
        let preparation = BuildPreparation::new(BuildId::new());
        assert_eq!(preparation.paused_pipeline, PreparationStatus::Unknown);
        assert_eq!(preparation.paused_job, PreparationStatus::Unknown);
        assert_eq!(preparation.max_running_builds, PreparationStatus::Unknown);
        assert_eq!(preparation.inputs_satisfied, PreparationStatus::Unknown);
        assert!(preparation.inputs.is_empty());
    }

    #[test]
    fn clones_do_not_share_the_input_map() {
        let mut original = BuildPreparation::new(BuildId::new());
        original
            .inputs
            .insert("a".to_string(), PreparationStatus::Blocking);

        let snapshot = original.clone();
        original
            .inputs
            .insert("a".to_string(), PreparationStatus::NotBlocking);

        assert_eq!(
            snapshot.inputs.get("a"),
            Some(&PreparationStatus::Blocking)
        );
    }
}
