//! Multi-tenant namespace scheduler: placement cache, scheduling engine and
//! the shared state the reconcilers coordinate through.

pub mod cache;
pub mod engine;

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::quota;
use crate::scheduler::cache::{Placement, SchedulerCache};

pub use cache::least_fit_slice_num;
pub use engine::{NamespaceCandidate, ScheduleResult, SchedulerEngine};

/// Decode the `scheduled.placements` annotation (JSON `cluster -> slices`).
/// A missing annotation means no placements.
pub fn parse_placements(annotation: Option<&str>) -> Result<Vec<Placement>> {
    let Some(raw) = annotation else {
        return Ok(Vec::new());
    };
    let map: BTreeMap<String, u32> = serde_json::from_str(raw).map_err(|e| {
        OperatorError::Serialization(format!("invalid placements annotation {raw:?}: {e}"))
    })?;
    Ok(map
        .into_iter()
        .map(|(cluster, num_slices)| Placement { cluster, num_slices })
        .collect())
}

/// Encode placements as the annotation's JSON map. Keys are sorted so the
/// output is stable.
pub fn render_placements(placements: &[Placement]) -> String {
    let map: BTreeMap<&str, u32> = placements
        .iter()
        .map(|p| (p.cluster.as_str(), p.num_slices))
        .collect();
    serde_json::to_string(&map).expect("string-keyed map serializes")
}

/// Parse the `k=v[,k=v...]` cluster selector annotation.
pub fn parse_cluster_selector(annotation: Option<&str>) -> Result<BTreeMap<String, String>> {
    let mut selector = BTreeMap::new();
    let Some(raw) = annotation else {
        return Ok(selector);
    };
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            OperatorError::Configuration(format!("invalid cluster selector pair {pair:?}"))
        })?;
        selector.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(selector)
}

/// One super cluster in the declarative scheduling inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperClusterEntry {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub capacity: SuperClusterCapacity,
}

/// Declared capacity of one super cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperClusterCapacity {
    pub cpu: String,
    pub memory: String,
}

/// Parse the super cluster inventory YAML and register every entry.
pub fn load_inventory(yaml: &str, cache: &SchedulerCache) -> Result<usize> {
    let entries: Vec<SuperClusterEntry> = serde_yaml::from_str(yaml)
        .map_err(|e| OperatorError::Configuration(format!("invalid super cluster inventory: {e}")))?;
    for entry in &entries {
        let capacity = quota::parse_vector(&entry.capacity.cpu, &entry.capacity.memory)?;
        cache.add_cluster(&entry.name, entry.labels.clone(), capacity);
    }
    Ok(entries.len())
}

/// Tenants whose cache entries have not been warmed yet. Namespace
/// reconciles against a dirty tenant re-queue instead of scheduling on a
/// cold cache.
#[derive(Default)]
pub struct DirtyVirtualClusters {
    inner: Mutex<HashSet<String>>,
}

impl DirtyVirtualClusters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key is `<vc namespace>/<vc name>`.
    pub fn mark(&self, vc_key: &str) {
        self.inner.lock().expect("dirty set lock").insert(vc_key.to_string());
    }

    pub fn clear(&self, vc_key: &str) {
        self.inner.lock().expect("dirty set lock").remove(vc_key);
    }

    pub fn contains(&self, vc_key: &str) -> bool {
        self.inner.lock().expect("dirty set lock").contains(vc_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placements_round_trip() {
        let placements = vec![Placement::new("c1", 3), Placement::new("c2", 1)];
        let rendered = render_placements(&placements);
        assert_eq!(rendered, r#"{"c1":3,"c2":1}"#);
        let parsed = parse_placements(Some(&rendered)).unwrap();
        assert_eq!(parsed, placements);
    }

    #[test]
    fn test_missing_annotation_is_empty() {
        assert!(parse_placements(None).unwrap().is_empty());
    }

    #[test]
    fn test_garbage_annotation_is_error() {
        assert!(parse_placements(Some("not json")).is_err());
    }

    #[test]
    fn test_cluster_selector_parsing() {
        let selector = parse_cluster_selector(Some("zone=a, tier=ssd")).unwrap();
        assert_eq!(selector.get("zone").map(String::as_str), Some("a"));
        assert_eq!(selector.get("tier").map(String::as_str), Some("ssd"));
        assert!(parse_cluster_selector(None).unwrap().is_empty());
        assert!(parse_cluster_selector(Some("nonsense")).is_err());
    }

    #[test]
    fn test_inventory_loading() {
        let yaml = r#"
- name: c1
  labels:
    zone: a
  capacity:
    cpu: "6"
    memory: 12Gi
- name: c2
  capacity:
    cpu: "6"
    memory: 12Gi
"#;
        let cache = SchedulerCache::new();
        let count = load_inventory(yaml, &cache).unwrap();
        assert_eq!(count, 2);
        let snapshot = cache.snapshot_excluding("none");
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_dirty_set() {
        let dirty = DirtyVirtualClusters::new();
        assert!(!dirty.contains("vc-a/demo"));
        dirty.mark("vc-a/demo");
        assert!(dirty.contains("vc-a/demo"));
        dirty.clear("vc-a/demo");
        assert!(!dirty.contains("vc-a/demo"));
    }
}
