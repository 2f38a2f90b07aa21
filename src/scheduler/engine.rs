//! Scheduling engine for tenant namespaces.
//!
//! Placement is deterministic: candidate clusters are filtered by the
//! namespace's cluster selector, sorted by free capacity descending with a
//! name-ascending tie-break, and slices are assigned greedily. Commits go
//! through the cache's atomic reserve; a concurrent reservation surfaces as
//! an over-capacity conflict and the snapshot is refreshed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{OperatorError, Result};
use crate::quota::ResourceVector;
use crate::scheduler::cache::{
    least_fit_slice_num, total_slices, ClusterSnapshot, Placement, SchedulerCache,
};

const RESERVE_RETRIES: usize = 3;

/// Everything the engine needs to know about one tenant namespace.
#[derive(Debug, Clone)]
pub struct NamespaceCandidate {
    /// Cluster key (root namespace) of the owning tenant
    pub owner_cluster: String,
    /// Namespace name inside the tenant
    pub name: String,
    /// Labels of the tenant namespace
    pub labels: BTreeMap<String, String>,
    /// Super-cluster selector pairs; empty means every cluster is eligible
    pub selector: BTreeMap<String, String>,
    /// Quota envelope of the namespace
    pub quota: ResourceVector,
    /// Slice quantum from the owning ClusterVersion
    pub slice: ResourceVector,
    /// Placements currently recorded in the namespace annotation
    pub placements: Vec<Placement>,
}

impl NamespaceCandidate {
    /// Cache key for this namespace, scoped by the owning tenant.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner_cluster, self.name)
    }

    /// Slices the quota demands.
    pub fn expected_slices(&self) -> u32 {
        least_fit_slice_num(&self.quota, &self.slice).0
    }
}

/// The outcome of scheduling one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleResult {
    /// Placements now reserved for the namespace
    Scheduled(Vec<Placement>),
    /// Quota demands zero slices; all placements were released
    DeScheduled,
}

pub struct SchedulerEngine {
    cache: Arc<SchedulerCache>,
}

impl SchedulerEngine {
    pub fn new(cache: Arc<SchedulerCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<SchedulerCache> {
        &self.cache
    }

    /// Reserve slices for `candidate` so that the total matches its quota.
    pub fn schedule_namespace(&self, candidate: &NamespaceCandidate) -> Result<ScheduleResult> {
        let ns_key = candidate.key();
        let expected = candidate.expected_slices();

        if expected == 0 {
            self.cache.release(&ns_key);
            return Ok(ScheduleResult::DeScheduled);
        }

        let already = total_slices(&candidate.placements);
        if already == expected {
            self.cache
                .ensure(&ns_key, candidate.slice, &candidate.placements)?;
            return Ok(ScheduleResult::Scheduled(candidate.placements.clone()));
        }

        let mut last_err = None;
        for attempt in 0..RESERVE_RETRIES {
            let snapshot = self.cache.snapshot_excluding(&ns_key);
            let placements = assign_slices(snapshot, &candidate.selector, candidate.slice, expected)?;
            match self.cache.reserve(&ns_key, candidate.slice, &placements) {
                Ok(()) => {
                    info!(
                        namespace = %ns_key,
                        slices = expected,
                        "Reserved namespace placements"
                    );
                    return Ok(ScheduleResult::Scheduled(placements));
                }
                Err(OperatorError::OverCapacity(msg)) => {
                    debug!(
                        namespace = %ns_key,
                        attempt,
                        "Reservation conflicted, refreshing capacity snapshot: {}",
                        msg
                    );
                    last_err = Some(OperatorError::OverCapacity(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            OperatorError::OverCapacity(format!("reservation retries exhausted for {}", ns_key))
        }))
    }

    /// Release all slices held by the namespace.
    pub fn deschedule_namespace(&self, ns_key: &str) {
        self.cache.release(ns_key);
        info!(namespace = %ns_key, "Released namespace placements");
    }

    /// Rebuild one namespace's cache entry from its persisted placements.
    pub fn ensure_namespace_placements(&self, candidate: &NamespaceCandidate) -> Result<()> {
        self.cache
            .ensure(&candidate.key(), candidate.slice, &candidate.placements)
    }
}

/// True when the cluster's labels contain every selector pair.
fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
}

/// Greedy assignment over eligible clusters, most free capacity first.
fn assign_slices(
    mut snapshot: Vec<ClusterSnapshot>,
    selector: &BTreeMap<String, String>,
    slice: ResourceVector,
    expected: u32,
) -> Result<Vec<Placement>> {
    snapshot.retain(|c| selector_matches(selector, &c.labels));
    snapshot.sort_by(|a, b| {
        let fit_a = least_fit_slice_num(&a.free, &slice).0;
        let fit_b = least_fit_slice_num(&b.free, &slice).0;
        fit_b.cmp(&fit_a).then_with(|| a.name.cmp(&b.name))
    });

    let mut remaining = expected;
    let mut placements = Vec::new();
    for cluster in &snapshot {
        if remaining == 0 {
            break;
        }
        let can_take = least_fit_slice_num(&cluster.free, &slice).0.min(remaining);
        if can_take == 0 {
            continue;
        }
        placements.push(Placement::new(cluster.name.clone(), can_take));
        remaining -= can_take;
    }

    if remaining > 0 {
        return Err(OperatorError::InsufficientCapacity(format!(
            "{} of {} slice(s) cannot be placed on any super cluster",
            remaining, expected
        )));
    }
    Ok(placements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice() -> ResourceVector {
        ResourceVector::new(2000, 4 * (1 << 30))
    }

    fn engine_with(clusters: &[(&str, i64, i64)]) -> SchedulerEngine {
        let cache = Arc::new(SchedulerCache::new());
        for (name, cpu, mem) in clusters {
            cache.add_cluster(name, BTreeMap::new(), ResourceVector::new(*cpu, *mem));
        }
        SchedulerEngine::new(cache)
    }

    fn candidate(quota: ResourceVector, placements: Vec<Placement>) -> NamespaceCandidate {
        NamespaceCandidate {
            owner_cluster: "t1".to_string(),
            name: "ns1".to_string(),
            labels: BTreeMap::new(),
            selector: BTreeMap::new(),
            quota,
            slice: slice(),
            placements,
        }
    }

    #[test]
    fn test_greedy_spill_over_with_name_tiebreak() {
        // two clusters, both free [cpu=6, mem=12Gi]; demand 4 slices of (2, 4Gi)
        let engine = engine_with(&[
            ("c2", 6000, 12 * (1 << 30)),
            ("c1", 6000, 12 * (1 << 30)),
        ]);
        let cand = candidate(ResourceVector::new(8000, 16 * (1 << 30)), Vec::new());
        let result = engine.schedule_namespace(&cand).unwrap();
        assert_eq!(
            result,
            ScheduleResult::Scheduled(vec![Placement::new("c1", 3), Placement::new("c2", 1)])
        );
    }

    #[test]
    fn test_zero_quota_deschedules() {
        let engine = engine_with(&[("c1", 6000, 12 * (1 << 30))]);
        engine
            .cache()
            .reserve("t1/ns1", slice(), &[Placement::new("c1", 2)])
            .unwrap();

        let cand = candidate(ResourceVector::ZERO, vec![Placement::new("c1", 2)]);
        let result = engine.schedule_namespace(&cand).unwrap();
        assert_eq!(result, ScheduleResult::DeScheduled);
        assert!(engine.cache().placements_of("t1/ns1").is_none());
    }

    #[test]
    fn test_matching_total_only_ensures() {
        let engine = engine_with(&[("c1", 6000, 12 * (1 << 30))]);
        let placements = vec![Placement::new("c1", 2)];
        let cand = candidate(ResourceVector::new(4000, 8 * (1 << 30)), placements.clone());
        let result = engine.schedule_namespace(&cand).unwrap();
        assert_eq!(result, ScheduleResult::Scheduled(placements.clone()));
        assert_eq!(engine.cache().placements_of("t1/ns1").unwrap(), placements);
    }

    #[test]
    fn test_insufficient_capacity_surfaces() {
        let engine = engine_with(&[("c1", 2000, 4 * (1 << 30))]);
        let cand = candidate(ResourceVector::new(8000, 16 * (1 << 30)), Vec::new());
        let err = engine.schedule_namespace(&cand).unwrap_err();
        assert!(matches!(err, OperatorError::InsufficientCapacity(_)));
    }

    #[test]
    fn test_selector_restricts_candidates() {
        let cache = Arc::new(SchedulerCache::new());
        let mut zone_a = BTreeMap::new();
        zone_a.insert("zone".to_string(), "a".to_string());
        let mut zone_b = BTreeMap::new();
        zone_b.insert("zone".to_string(), "b".to_string());
        cache.add_cluster("big-b", zone_b, ResourceVector::new(60_000, 120 * (1 << 30)));
        cache.add_cluster("small-a", zone_a, ResourceVector::new(4000, 8 * (1 << 30)));
        let engine = SchedulerEngine::new(cache);

        let mut cand = candidate(ResourceVector::new(4000, 8 * (1 << 30)), Vec::new());
        cand.selector.insert("zone".to_string(), "a".to_string());

        let result = engine.schedule_namespace(&cand).unwrap();
        assert_eq!(
            result,
            ScheduleResult::Scheduled(vec![Placement::new("small-a", 2)])
        );
    }

    #[test]
    fn test_regrow_uses_own_hold_as_headroom() {
        // c1 fits 3 slices total; ns already holds 2 and quota grows to 3
        let engine = engine_with(&[("c1", 6000, 12 * (1 << 30))]);
        engine
            .cache()
            .reserve("t1/ns1", slice(), &[Placement::new("c1", 2)])
            .unwrap();

        let cand = candidate(
            ResourceVector::new(6000, 12 * (1 << 30)),
            vec![Placement::new("c1", 2)],
        );
        let result = engine.schedule_namespace(&cand).unwrap();
        assert_eq!(
            result,
            ScheduleResult::Scheduled(vec![Placement::new("c1", 3)])
        );
        assert_eq!(
            engine.cache().placements_of("t1/ns1").unwrap(),
            vec![Placement::new("c1", 3)]
        );
    }
}
