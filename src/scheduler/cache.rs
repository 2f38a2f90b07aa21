//! In-memory placement cache for the namespace scheduler.
//!
//! The cache is the placement authority; the `scheduled.placements`
//! annotation is an eventually-consistent projection of it. All public
//! operations take one lock for their critical section and never hold it
//! across I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{OperatorError, Result};
use crate::quota::ResourceVector;

/// The binding of a tenant namespace to one super cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub cluster: String,
    pub num_slices: u32,
}

impl Placement {
    pub fn new(cluster: impl Into<String>, num_slices: u32) -> Self {
        Self {
            cluster: cluster.into(),
            num_slices,
        }
    }
}

/// Total slices covered by a placement list.
pub fn total_slices(placements: &[Placement]) -> u32 {
    placements.iter().map(|p| p.num_slices).sum()
}

/// `⌊quota.r / slice.r⌋` minimised over both resource axes. The second
/// element names the limiting axis for diagnostics.
pub fn least_fit_slice_num(quota: &ResourceVector, slice: &ResourceVector) -> (u32, &'static str) {
    if slice.cpu_millis <= 0 || slice.memory_bytes <= 0 {
        return (0, "cpu");
    }
    let cpu_fit = (quota.cpu_millis / slice.cpu_millis).max(0) as u32;
    let mem_fit = (quota.memory_bytes / slice.memory_bytes).max(0) as u32;
    if cpu_fit <= mem_fit {
        (cpu_fit, "cpu")
    } else {
        (mem_fit, "memory")
    }
}

/// One super cluster's capacity, current allocation and per-namespace holds.
struct ClusterEntry {
    labels: BTreeMap<String, String>,
    capacity: ResourceVector,
    allocated: ResourceVector,
    namespaces: HashMap<String, u32>,
}

/// What one tenant namespace currently holds across clusters.
#[derive(Debug, Clone)]
struct ReservationRecord {
    slice: ResourceVector,
    placements: Vec<Placement>,
}

/// A point-in-time view of one cluster for the scheduling engine.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub free: ResourceVector,
}

#[derive(Default)]
struct CacheInner {
    clusters: HashMap<String, ClusterEntry>,
    reservations: HashMap<String, ReservationRecord>,
}

/// Thread-safe map of super clusters to reserved slices.
#[derive(Default)]
pub struct SchedulerCache {
    inner: Mutex<CacheInner>,
}

impl CacheInner {
    /// Remove and de-allocate the record held under `ns_key`, if any.
    fn take_reservation(&mut self, ns_key: &str) -> Option<ReservationRecord> {
        let record = self.reservations.remove(ns_key)?;
        for placement in &record.placements {
            if let Some(entry) = self.clusters.get_mut(&placement.cluster) {
                entry.allocated = entry
                    .allocated
                    .sub(&record.slice.scale(placement.num_slices));
                entry.namespaces.remove(ns_key);
            }
        }
        Some(record)
    }

    /// Allocate `record` or leave the cache untouched.
    fn try_apply(&mut self, ns_key: &str, record: ReservationRecord) -> Result<()> {
        let mut applied: Vec<Placement> = Vec::new();
        for placement in &record.placements {
            let demand = record.slice.scale(placement.num_slices);
            let fits = match self.clusters.get(&placement.cluster) {
                Some(entry) => entry.capacity.covers(&entry.allocated.add(&demand)),
                None => false,
            };
            if !fits {
                // roll back everything this call inserted
                for done in &applied {
                    let entry = self.clusters.get_mut(&done.cluster).expect("applied cluster");
                    entry.allocated = entry.allocated.sub(&record.slice.scale(done.num_slices));
                    entry.namespaces.remove(ns_key);
                }
                return Err(OperatorError::OverCapacity(format!(
                    "cluster {} cannot hold {} more slice(s) for {}",
                    placement.cluster, placement.num_slices, ns_key
                )));
            }
            let entry = self.clusters.get_mut(&placement.cluster).expect("checked above");
            entry.allocated = entry.allocated.add(&demand);
            entry.namespaces.insert(ns_key.to_string(), placement.num_slices);
            applied.push(placement.clone());
        }
        self.reservations.insert(ns_key.to_string(), record);
        Ok(())
    }

    fn restore(&mut self, ns_key: &str, previous: Option<ReservationRecord>) {
        if let Some(record) = previous {
            self.try_apply(ns_key, record)
                .expect("restoring a reservation that fit before");
        }
    }
}

impl SchedulerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a super cluster with its declared capacity. Re-registering
    /// updates labels and capacity but keeps existing reservations.
    pub fn add_cluster(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        capacity: ResourceVector,
    ) {
        let mut inner = self.inner.lock().expect("cache lock");
        let entry = inner.clusters.entry(name.to_string()).or_insert(ClusterEntry {
            labels: BTreeMap::new(),
            capacity: ResourceVector::ZERO,
            allocated: ResourceVector::ZERO,
            namespaces: HashMap::new(),
        });
        entry.labels = labels;
        entry.capacity = capacity;
    }

    /// Snapshot every cluster's free capacity, with `exclude_ns`'s own
    /// holds treated as free so re-reservation sees its real headroom.
    pub fn snapshot_excluding(&self, exclude_ns: &str) -> Vec<ClusterSnapshot> {
        let inner = self.inner.lock().expect("cache lock");
        let own = inner.reservations.get(exclude_ns);
        inner
            .clusters
            .iter()
            .map(|(name, entry)| {
                let mut free = entry.capacity.sub(&entry.allocated);
                if let Some(record) = own {
                    for placement in &record.placements {
                        if placement.cluster == *name {
                            free = free.add(&record.slice.scale(placement.num_slices));
                        }
                    }
                }
                ClusterSnapshot {
                    name: name.clone(),
                    labels: entry.labels.clone(),
                    free,
                }
            })
            .collect()
    }

    /// Atomically reserve `placements` for `ns_key`, replacing any previous
    /// reservation held under the same key. On failure the cache is exactly
    /// as before the call.
    pub fn reserve(
        &self,
        ns_key: &str,
        slice: ResourceVector,
        placements: &[Placement],
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("cache lock");
        let previous = inner.take_reservation(ns_key);
        let record = ReservationRecord {
            slice,
            placements: placements.to_vec(),
        };
        match inner.try_apply(ns_key, record) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.restore(ns_key, previous);
                Err(e)
            }
        }
    }

    /// Free all slices held by `ns_key`; no-op when unknown.
    pub fn release(&self, ns_key: &str) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.take_reservation(ns_key);
    }

    /// Idempotent rebuild of a single entry, used on recovery. Accepted only
    /// if the union with existing reservations stays within capacity.
    pub fn ensure(
        &self,
        ns_key: &str,
        slice: ResourceVector,
        placements: &[Placement],
    ) -> Result<()> {
        self.reserve(ns_key, slice, placements)
    }

    /// Current placements held for `ns_key`, if any.
    pub fn placements_of(&self, ns_key: &str) -> Option<Vec<Placement>> {
        let inner = self.inner.lock().expect("cache lock");
        inner.reservations.get(ns_key).map(|r| r.placements.clone())
    }

    /// Namespace keys with at least one reserved slice.
    pub fn reserved_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("cache lock");
        inner.reservations.keys().cloned().collect()
    }
}
