//! Policy store
//!
//! Policies and wallet bindings persisted as one pretty-printed JSON
//! document. Reads share a lock; every mutation is written to disk before
//! it becomes visible.

use crate::crypto::parse_address;
use crate::errors::{ProxyError, Result};
use crate::keystore::storage::write_atomic;
use crate::policy::rules::{Policy, PolicyDraft, DEFAULT_CHAIN_TYPE, DEFAULT_POLICY_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;
use uuid::Uuid;

/// A policy attached to a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub policy_id: String,
    pub attached_at: DateTime<Utc>,
}

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    policies: BTreeMap<String, Policy>,
    /// wallet address (lowercase `0x`) -> bindings in attach order
    #[serde(default)]
    bindings: BTreeMap<String, Vec<Binding>>,
}

/// Durable policy and binding storage
pub struct PolicyStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl PolicyStore {
    /// Open the store at `path`, starting empty when the file is absent
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)
                .map_err(|e| ProxyError::StorageError(format!("policy store: {}", e)))?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            StoreState::default()
        };

        info!(
            "Loaded {} policies from {:?}",
            state.policies.len(),
            path
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn list(&self) -> Result<Vec<Policy>> {
        Ok(self.read()?.policies.values().cloned().collect())
    }

    pub fn get(&self, id: &str) -> Result<Policy> {
        self.read()?
            .policies
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::PolicyNotFound(id.to_string()))
    }

    pub fn create(&self, draft: PolicyDraft) -> Result<Policy> {
        draft.validate()?;
        let now = Utc::now();
        let policy = Policy {
            id: Uuid::new_v4().to_string(),
            version: draft
                .version
                .unwrap_or_else(|| DEFAULT_POLICY_VERSION.to_string()),
            name: draft.name,
            chain_type: draft
                .chain_type
                .unwrap_or_else(|| DEFAULT_CHAIN_TYPE.to_string()),
            rules: draft.rules,
            created_at: now,
            updated_at: now,
        };

        self.mutate(|state| {
            state.policies.insert(policy.id.clone(), policy.clone());
            Ok(())
        })?;

        info!("Created policy {} ({})", policy.id, policy.name);
        Ok(policy)
    }

    /// Replace a policy's content, keeping its id and creation time
    pub fn update(&self, id: &str, draft: PolicyDraft) -> Result<Policy> {
        draft.validate()?;

        let updated = self.mutate(|state| {
            let existing = state
                .policies
                .get_mut(id)
                .ok_or_else(|| ProxyError::PolicyNotFound(id.to_string()))?;

            existing.name = draft.name;
            if let Some(version) = draft.version {
                existing.version = version;
            }
            if let Some(chain_type) = draft.chain_type {
                existing.chain_type = chain_type;
            }
            existing.rules = draft.rules;
            existing.updated_at = Utc::now();
            Ok(existing.clone())
        })?;

        info!("Updated policy {}", id);
        Ok(updated)
    }

    /// Delete a policy and every binding that references it
    pub fn delete(&self, id: &str) -> Result<()> {
        self.mutate(|state| {
            if state.policies.remove(id).is_none() {
                return Err(ProxyError::PolicyNotFound(id.to_string()));
            }
            for bindings in state.bindings.values_mut() {
                bindings.retain(|b| b.policy_id != id);
            }
            state.bindings.retain(|_, bindings| !bindings.is_empty());
            Ok(())
        })?;

        info!("Deleted policy {}", id);
        Ok(())
    }

    /// Bind a policy to a wallet; binding twice is a no-op
    pub fn attach(&self, wallet: &str, policy_id: &str) -> Result<Vec<Binding>> {
        let wallet = normalize_wallet(wallet)?;

        let bindings = self.mutate(|state| {
            if !state.policies.contains_key(policy_id) {
                return Err(ProxyError::PolicyNotFound(policy_id.to_string()));
            }
            let bindings = state.bindings.entry(wallet.clone()).or_default();
            if !bindings.iter().any(|b| b.policy_id == policy_id) {
                bindings.push(Binding {
                    policy_id: policy_id.to_string(),
                    attached_at: Utc::now(),
                });
            }
            Ok(bindings.clone())
        })?;

        info!("Attached policy {} to {}", policy_id, wallet);
        Ok(bindings)
    }

    pub fn detach(&self, wallet: &str, policy_id: &str) -> Result<()> {
        let wallet = normalize_wallet(wallet)?;

        self.mutate(|state| {
            let bindings = state
                .bindings
                .get_mut(&wallet)
                .ok_or_else(|| ProxyError::PolicyNotFound(policy_id.to_string()))?;
            let before = bindings.len();
            bindings.retain(|b| b.policy_id != policy_id);
            if bindings.len() == before {
                return Err(ProxyError::PolicyNotFound(policy_id.to_string()));
            }
            if bindings.is_empty() {
                state.bindings.remove(&wallet);
            }
            Ok(())
        })?;

        info!("Detached policy {} from {}", policy_id, wallet);
        Ok(())
    }

    pub fn bindings(&self, wallet: &str) -> Result<Vec<Binding>> {
        let wallet = normalize_wallet(wallet)?;
        Ok(self
            .read()?
            .bindings
            .get(&wallet)
            .cloned()
            .unwrap_or_default())
    }

    /// Policies bound to `wallet`, in attach order
    pub fn policies_for(&self, wallet: &str) -> Result<Vec<Policy>> {
        let wallet = normalize_wallet(wallet)?;
        let state = self.read()?;
        Ok(state
            .bindings
            .get(&wallet)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter_map(|b| state.policies.get(&b.policy_id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| ProxyError::InternalError("policy store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| ProxyError::InternalError("policy store lock poisoned".to_string()))
    }

    /// Apply `change` to a copy, persist it, then publish it
    fn mutate<T>(&self, change: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.write()?;
        let mut next = state.clone();
        let result = change(&mut next)?;

        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&next)?;
            write_atomic(path, json.as_bytes())?;
        }

        *state = next;
        Ok(result)
    }
}

/// Lowercase `0x` form used as the binding key
fn normalize_wallet(wallet: &str) -> Result<String> {
    Ok(format!("0x{}", hex::encode(parse_address(wallet.trim())?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::{Rule, RuleAction, RuleMethod};
    use tempfile::tempdir;

    const WALLET: &str = "0x00000000000000000000000000000000000000AA";

    fn draft(name: &str) -> PolicyDraft {
        PolicyDraft::new(
            name,
            vec![Rule::new("allow all", RuleMethod::Any, RuleAction::Allow)],
        )
    }

    #[test]
    fn test_crud_round_trip() {
        let store = PolicyStore::in_memory();
        let created = store.create(draft("first")).unwrap();
        assert_eq!(created.version, DEFAULT_POLICY_VERSION);
        assert_eq!(created.chain_type, DEFAULT_CHAIN_TYPE);
        assert_eq!(store.get(&created.id).unwrap(), created);

        let updated = store.update(&created.id, draft("renamed")).unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);

        store.delete(&created.id).unwrap();
        assert!(matches!(store.get(&created.id), Err(ProxyError::PolicyNotFound(_))));
        assert!(matches!(store.delete(&created.id), Err(ProxyError::PolicyNotFound(_))));
    }

    #[test]
    fn test_bindings_keep_attach_order() {
        let store = PolicyStore::in_memory();
        let a = store.create(draft("a")).unwrap();
        let b = store.create(draft("b")).unwrap();

        store.attach(WALLET, &b.id).unwrap();
        store.attach(&WALLET.to_lowercase(), &a.id).unwrap();
        // idempotent
        store.attach(WALLET, &b.id).unwrap();

        let names: Vec<String> = store
            .policies_for(WALLET)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        store.detach(WALLET, &b.id).unwrap();
        assert_eq!(store.bindings(WALLET).unwrap().len(), 1);
        assert!(store.detach(WALLET, &b.id).is_err());
    }

    #[test]
    fn test_delete_removes_bindings() {
        let store = PolicyStore::in_memory();
        let p = store.create(draft("p")).unwrap();
        store.attach(WALLET, &p.id).unwrap();

        store.delete(&p.id).unwrap();
        assert!(store.bindings(WALLET).unwrap().is_empty());
        assert!(store.policies_for(WALLET).unwrap().is_empty());
    }

    #[test]
    fn test_attach_unknown_policy() {
        let store = PolicyStore::in_memory();
        assert!(matches!(
            store.attach(WALLET, "missing"),
            Err(ProxyError::PolicyNotFound(_))
        ));
        assert!(matches!(
            store.attach("not-an-address", "missing"),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policies.json");

        let id = {
            let store = PolicyStore::open(&path).unwrap();
            let p = store.create(draft("durable")).unwrap();
            store.attach(WALLET, &p.id).unwrap();
            p.id
        };

        let reopened = PolicyStore::open(&path).unwrap();
        assert_eq!(reopened.get(&id).unwrap().name, "durable");
        assert_eq!(reopened.policies_for(WALLET).unwrap().len(), 1);
    }
}
