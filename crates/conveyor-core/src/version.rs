//! Resource versions, build inputs, and the version index snapshot.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A concrete version of a resource, as reported by its source.
///
/// Fields are kept ordered so two versions compare equal regardless of the
/// order their fields were discovered in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(pub BTreeMap<String, String>);

impl Version {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for Version {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A binding of one job input to a concrete resource version.
///
/// Once committed to a build these are immutable; the plan handed to the
/// engine must carry exactly these versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub resource: String,
    pub version: Version,
}

/// Snapshot of every version known for each resource, oldest first.
///
/// Owned by the store. The scheduler passes it around by reference and
/// never inspects it beyond handing it back to the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionIndex {
    pub resource_versions: HashMap<String, Vec<Version>>,
}

impl VersionIndex {
    /// Newest known version of a resource.
    pub fn latest(&self, resource: &str) -> Option<&Version> {
        self.resource_versions.get(resource).and_then(|v| v.last())
    }

    pub fn contains(&self, resource: &str, version: &Version) -> bool {
        self.resource_versions
            .get(resource)
            .is_some_and(|versions| versions.contains(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(pairs: &[(&str, &str)]) -> Version {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn version_equality_ignores_field_order() {
        let a: Version = [("ref", "abc"), ("branch", "main")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let b: Version = [("branch", "main"), ("ref", "abc")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn latest_is_the_newest_entry() {
        let mut index = VersionIndex::default();
        index.resource_versions.insert(
            "repo".to_string(),
            vec![version(&[("ref", "v1")]), version(&[("ref", "v2")])],
        );

        assert_eq!(index.latest("repo"), Some(&version(&[("ref", "v2")])));
        assert_eq!(index.latest("other"), None);
    }

    #[test]
    fn contains_matches_any_known_version() {
        let mut index = VersionIndex::default();
        index
            .resource_versions
            .insert("repo".to_string(), vec![version(&[("ref", "v1")])]);

        assert!(index.contains("repo", &version(&[("ref", "v1")])));
        assert!(!index.contains("repo", &version(&[("ref", "v2")])));
    }
}
