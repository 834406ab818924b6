//! Process-wide table id pool
//!
//! Wraps `common::TableIdAllocator` behind the single lock shared by all
//! concurrent pod reconciles, and defines the published assignment format
//! data-plane agents read from pods.

use crate::apis::metrics::set_table_ids_allocated;
use crate::error::{Error, Result};
use common::{AllocError, TableIdAllocator};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Pod annotation carrying the published table ids
pub const NETWORK_TABLES_ANNOTATION: &str = "sidelink.io/network-tables";

/// Pod identity; the uid keeps a recreated pod from inheriting stale ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PodKey {
    /// Build the key of a pod; pods without a uid are not persisted yet
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        Some(Self {
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            name: pod.name_any(),
            uid: pod.uid()?,
        })
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pool key: one table id per (pod, network)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkKey {
    pub pod: PodKey,
    /// Qualified network name (`namespace/name`)
    pub network: String,
}

impl NetworkKey {
    pub fn new(pod: &PodKey, network: impl Into<String>) -> Self {
        Self {
            pod: pod.clone(),
            network: network.into(),
        }
    }
}

/// Published assignment for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAssignment {
    #[serde(rename = "tableID")]
    pub table_id: u32,
    pub addresses: Vec<String>,
}

/// Published assignments keyed by qualified network name (sorted)
pub type PublishedNetworks = BTreeMap<String, NetworkAssignment>;

/// Read the published assignments of a pod; no annotation means none
pub fn published_networks(pod: &Pod) -> Result<PublishedNetworks> {
    match pod.annotations().get(NETWORK_TABLES_ANNOTATION) {
        None => Ok(PublishedNetworks::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| Error::InvalidAnnotation {
            object: format!(
                "pod/{}/{}",
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            ),
            key: NETWORK_TABLES_ANNOTATION.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Outcome of rebuilding the pool from live pods
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    /// Ids already held by another pod; the later pod gets a new id
    pub conflicts: usize,
    /// Pods whose annotation could not be parsed
    pub invalid: usize,
}

/// Shared table id pool
#[derive(Debug)]
pub struct TableIds {
    pool: Mutex<TableIdAllocator<NetworkKey>>,
}

/// Mutex helper that recovers from poisoning
#[inline]
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Table id pool lock poisoned, recovering (pool is still consistent)");
        poisoned.into_inner()
    })
}

impl TableIds {
    pub fn new(min: u32, max: u32) -> Self {
        info!("Table id pool covers [{}, {})", min, max);
        Self {
            pool: Mutex::new(TableIdAllocator::new(min, max)),
        }
    }

    pub fn allocate(&self, key: &NetworkKey) -> std::result::Result<u32, AllocError> {
        let mut pool = safe_lock(&self.pool);
        let id = pool.allocate(key)?;
        set_table_ids_allocated(pool.len());
        Ok(id)
    }

    pub fn release(&self, key: &NetworkKey) -> Option<u32> {
        let mut pool = safe_lock(&self.pool);
        let released = pool.release(key);
        if let Some(id) = released {
            debug!("Released table id {} of {} on {}", id, key.network, key.pod);
            set_table_ids_allocated(pool.len());
        }
        released
    }

    pub fn lookup(&self, key: &NetworkKey) -> Option<u32> {
        safe_lock(&self.pool).lookup(key)
    }

    /// Release every id held by `pod`
    pub fn release_pod(&self, pod: &PodKey) -> Vec<(String, u32)> {
        let mut pool = safe_lock(&self.pool);
        let released: Vec<(String, u32)> = pool
            .retain(|key| key.pod != *pod)
            .into_iter()
            .map(|(key, id)| (key.network, id))
            .collect();
        set_table_ids_allocated(pool.len());
        released
    }

    /// Networks and ids currently held by `pod`
    pub fn keys_for(&self, pod: &PodKey) -> Vec<(String, u32)> {
        safe_lock(&self.pool)
            .iter()
            .filter(|(key, _)| key.pod == *pod)
            .map(|(key, id)| (key.network.clone(), id))
            .collect()
    }

    /// Pods holding at least one id
    pub fn pods(&self) -> HashSet<PodKey> {
        safe_lock(&self.pool)
            .iter()
            .map(|(key, _)| key.pod.clone())
            .collect()
    }

    /// Release ids of the `candidates` pods that are not `live`
    ///
    /// Pods that are not candidates keep their ids even when absent from
    /// `live`. Returns how many ids were released.
    pub fn release_vanished(&self, candidates: &HashSet<PodKey>, live: &HashSet<PodKey>) -> usize {
        let mut pool = safe_lock(&self.pool);
        let released =
            pool.retain(|key| !candidates.contains(&key.pod) || live.contains(&key.pod));
        for (key, id) in &released {
            info!(
                "Released table id {} of {} on vanished pod {}",
                id, key.network, key.pod
            );
        }
        set_table_ids_allocated(pool.len());
        released.len()
    }

    /// Mark ids already published on `pods` as used.
    ///
    /// Must run before the first `allocate`. The first pod seen keeps a
    /// contested id.
    pub fn restore_from_pods(&self, pods: &[Pod]) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        let mut pool = safe_lock(&self.pool);

        for pod in pods {
            let Some(pod_key) = PodKey::from_pod(pod) else {
                continue;
            };
            let published = match published_networks(pod) {
                Ok(published) => published,
                Err(e) => {
                    warn!("Skipping restore of {}: {}", pod_key, e);
                    summary.invalid += 1;
                    continue;
                }
            };

            for (network, assignment) in published {
                let key = NetworkKey::new(&pod_key, network);
                match pool.restore(key, assignment.table_id) {
                    Ok(()) => summary.restored += 1,
                    Err(e) => {
                        warn!("Not restoring table id on {}: {}", pod_key, e);
                        summary.conflicts += 1;
                    }
                }
            }
        }

        set_table_ids_allocated(pool.len());
        summary
    }

    pub fn range(&self) -> (u32, u32) {
        safe_lock(&self.pool).range()
    }

    pub fn free_count(&self) -> usize {
        safe_lock(&self.pool).free_count()
    }

    pub fn len(&self) -> usize {
        safe_lock(&self.pool).len()
    }

    pub fn is_empty(&self) -> bool {
        safe_lock(&self.pool).is_empty()
    }
}
