//! Policy Store
//!
//! Versioned, immutable snapshots of the agent's tunable parameters.
//! Versions form a tree through their parent links; the store tracks which
//! versions were accepted and which one is active. Nothing is ever deleted:
//! rollback is `set_active` on an earlier accepted version.
//!
//! Readers share the lock (concurrent audit reads never block each other);
//! only `commit`, `mark_accepted` and `set_active` take it exclusively.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{LoopError, Result};

/// Tunable parameter mapping (name -> value)
pub type ParameterMap = BTreeMap<String, f64>;

/// Immutable policy snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVersion {
    pub version_id: u64,
    pub parameters: ParameterMap,
    /// None only for the root version
    pub parent_version_id: Option<u64>,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// SHA-256 of the canonical parameter encoding
    pub digest: String,
}

impl PolicyVersion {
    pub fn is_root(&self) -> bool {
        self.parent_version_id.is_none()
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    /// Check that the stored digest matches the parameters
    pub fn verify_digest(&self) -> bool {
        parameter_digest(&self.parameters) == self.digest
    }
}

/// Fingerprint a parameter map (BTreeMap order is canonical)
pub fn parameter_digest(parameters: &ParameterMap) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in parameters {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.to_bits().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct StoreInner {
    /// Index i holds version_id i + 1
    versions: Vec<Arc<PolicyVersion>>,
    accepted: BTreeSet<u64>,
    active: u64,
}

impl StoreInner {
    fn lookup(&self, version_id: u64) -> Option<&Arc<PolicyVersion>> {
        if version_id == 0 {
            return None;
        }
        self.versions.get((version_id - 1) as usize)
    }
}

/// Append-only policy version store
#[derive(Debug)]
pub struct PolicyStore {
    inner: RwLock<StoreInner>,
}

impl PolicyStore {
    /// Create a store whose root version (id 1) is accepted and active
    pub fn new(root_parameters: ParameterMap) -> Self {
        let root = PolicyVersion {
            version_id: 1,
            digest: parameter_digest(&root_parameters),
            parameters: root_parameters,
            parent_version_id: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        info!("Policy store initialized with root version 1");
        Self {
            inner: RwLock::new(StoreInner {
                versions: vec![Arc::new(root)],
                accepted: BTreeSet::from([1]),
                active: 1,
            }),
        }
    }

    /// Rebuild a store from persisted versions
    ///
    /// Versions must be contiguous from id 1 in commit order, each parent
    /// must precede its child, digests must match and `active` must be
    /// an accepted version.
    pub fn restore(
        versions: Vec<PolicyVersion>,
        accepted: BTreeSet<u64>,
        active: u64,
    ) -> Result<Self> {
        if versions.is_empty() {
            return Err(LoopError::Persistence("no versions to restore".to_string()));
        }

        for (idx, version) in versions.iter().enumerate() {
            let expected = idx as u64 + 1;
            if version.version_id != expected {
                return Err(LoopError::Persistence(format!(
                    "version ids not contiguous: expected {}, found {}",
                    expected, version.version_id
                )));
            }
            match version.parent_version_id {
                None if expected != 1 => {
                    return Err(LoopError::Persistence(format!(
                        "version {} has no parent but is not the root",
                        expected
                    )));
                }
                Some(parent) if parent >= expected => {
                    return Err(LoopError::UnknownParent(parent));
                }
                _ => {}
            }
            if !version.verify_digest() {
                return Err(LoopError::Persistence(format!(
                    "digest mismatch for version {}",
                    expected
                )));
            }
        }

        let max_id = versions.len() as u64;
        if let Some(bad) = accepted.iter().find(|id| **id == 0 || **id > max_id) {
            return Err(LoopError::NotFound(*bad));
        }
        if active == 0 || active > max_id {
            return Err(LoopError::NotFound(active));
        }
        if !accepted.contains(&active) {
            return Err(LoopError::NotAccepted(active));
        }

        info!("Restored policy store: {} versions, active {}", versions.len(), active);
        Ok(Self {
            inner: RwLock::new(StoreInner {
                versions: versions.into_iter().map(Arc::new).collect(),
                accepted,
                active,
            }),
        })
    }

    /// Commit a new version derived from `parent_version_id`
    pub fn commit(&self, parameters: ParameterMap, parent_version_id: u64) -> Result<PolicyVersion> {
        let mut inner = self.inner.write();
        if inner.lookup(parent_version_id).is_none() {
            return Err(LoopError::UnknownParent(parent_version_id));
        }

        let version = PolicyVersion {
            version_id: inner.versions.len() as u64 + 1,
            digest: parameter_digest(&parameters),
            parameters,
            parent_version_id: Some(parent_version_id),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        inner.versions.push(Arc::new(version.clone()));

        debug!(
            "Committed policy version {} (parent {})",
            version.version_id, parent_version_id
        );
        Ok(version)
    }

    pub fn get(&self, version_id: u64) -> Result<PolicyVersion> {
        self.inner
            .read()
            .lookup(version_id)
            .map(|v| (**v).clone())
            .ok_or(LoopError::NotFound(version_id))
    }

    /// Record that a version passed evaluation
    pub fn mark_accepted(&self, version_id: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.lookup(version_id).is_none() {
            return Err(LoopError::NotFound(version_id));
        }
        inner.accepted.insert(version_id);
        Ok(())
    }

    /// Make an accepted version active (also used for rollback)
    pub fn set_active(&self, version_id: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.lookup(version_id).is_none() {
            return Err(LoopError::NotFound(version_id));
        }
        if !inner.accepted.contains(&version_id) {
            return Err(LoopError::NotAccepted(version_id));
        }
        if inner.active != version_id {
            debug!("Active policy {} -> {}", inner.active, version_id);
        }
        inner.active = version_id;
        Ok(())
    }

    pub fn active(&self) -> PolicyVersion {
        let inner = self.inner.read();
        // active always indexes an existing version
        (*inner.versions[(inner.active - 1) as usize]).clone()
    }

    pub fn active_id(&self) -> u64 {
        self.inner.read().active
    }

    pub fn is_accepted(&self, version_id: u64) -> bool {
        self.inner.read().accepted.contains(&version_id)
    }

    pub fn accepted_ids(&self) -> BTreeSet<u64> {
        self.inner.read().accepted.clone()
    }

    /// All versions in commit order
    pub fn history(&self) -> Vec<PolicyVersion> {
        self.inner.read().versions.iter().map(|v| (**v).clone()).collect()
    }

    /// Ancestry from the root down to `version_id`
    pub fn lineage(&self, version_id: u64) -> Result<Vec<PolicyVersion>> {
        let inner = self.inner.read();
        let mut chain = Vec::new();
        let mut cursor = Some(version_id);

        while let Some(id) = cursor {
            let version = inner.lookup(id).ok_or(LoopError::NotFound(id))?;
            chain.push((**version).clone());
            cursor = version.parent_version_id;
        }

        chain.reverse();
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.inner.read().versions.len()
    }

    pub fn is_empty(&self) -> bool {
        // The root version always exists
        false
    }
}
