use crate::admin::Acl;
use crate::error::{ServiceError, ServiceResult};
use crate::types::{
    CoreState, CycleState, FeeAddressGovernance, Principal, SubId, SubStatus, Subscription,
};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

/// Primary subscription mapping plus the two secondary indices the scheduler
/// depends on: ascending `(next_execution_at, sub_id)` over Active entries,
/// and ownership by caller principal.
///
/// The due index makes `next_due` a range scan instead of a full sweep; under
/// ten thousand subscriptions a linear scan per tick degrades quadratically.
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    subs: BTreeMap<SubId, Subscription>,
    due: BTreeSet<(i64, SubId)>,
    by_owner: BTreeMap<Principal, BTreeSet<SubId>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_new(&mut self, sub: Subscription) -> ServiceResult<()> {
        if self.subs.contains_key(&sub.sub_id) {
            return Err(ServiceError::Conflict(format!(
                "subscription '{}' already exists",
                sub.sub_id
            )));
        }
        self.index(&sub);
        self.subs.insert(sub.sub_id.clone(), sub);
        Ok(())
    }

    /// Upsert without uniqueness check; used when rebuilding from persisted
    /// state.
    pub fn put(&mut self, sub: Subscription) {
        if let Some(old) = self.subs.get(&sub.sub_id).cloned() {
            self.unindex(&old);
        }
        self.index(&sub);
        self.subs.insert(sub.sub_id.clone(), sub);
    }

    pub fn get(&self, sub_id: &str) -> Option<&Subscription> {
        self.subs.get(sub_id)
    }

    /// Apply `f` to the subscription and re-index. Returns the post-mutation
    /// snapshot.
    pub fn update<F: FnOnce(&mut Subscription)>(
        &mut self,
        sub_id: &str,
        f: F,
    ) -> Option<Subscription> {
        let sub = self.subs.get_mut(sub_id)?;
        let old_due = (sub.next_execution_at, sub.sub_id.clone());
        let was_active = sub.status == SubStatus::Active;
        f(sub);
        let snapshot = sub.clone();
        if was_active {
            self.due.remove(&old_due);
        }
        if snapshot.status == SubStatus::Active {
            self.due
                .insert((snapshot.next_execution_at, snapshot.sub_id.clone()));
        }
        Some(snapshot)
    }

    pub fn remove(&mut self, sub_id: &str) -> Option<Subscription> {
        let sub = self.subs.remove(sub_id)?;
        self.unindex(&sub);
        Some(sub)
    }

    /// Every Active subscription with `next_execution_at <= now`, ascending.
    /// Used on boot and as a sanity query.
    pub fn overdue(&self, now: i64) -> Vec<SubId> {
        self.due
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// The `limit` soonest Active entries in `(next_execution_at, sub_id)`
    /// order.
    pub fn next_due(&self, limit: usize) -> Vec<(i64, SubId)> {
        self.due.iter().take(limit).cloned().collect()
    }

    /// Stable `(created_at, sub_id)` ordering with an opaque cursor: pass the
    /// last `sub_id` of the previous page to continue.
    pub fn list_by_principal(
        &self,
        principal: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Vec<Subscription> {
        let Some(ids) = self.by_owner.get(principal) else {
            return Vec::new();
        };

        let mut items: Vec<&Subscription> = ids.iter().filter_map(|id| self.subs.get(id)).collect();
        items.sort_by(|a, b| (a.created_at, &a.sub_id).cmp(&(b.created_at, &b.sub_id)));

        let after = cursor
            .and_then(|c| self.subs.get(c))
            .map(|s| (s.created_at, s.sub_id.clone()));

        items
            .into_iter()
            .filter(|s| match &after {
                Some((at, id)) => (s.created_at, &s.sub_id) > (*at, id),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Active entries equal the due index by construction.
    pub fn active_count(&self) -> usize {
        self.due.len()
    }

    pub fn active_count_for(&self, principal: &str) -> usize {
        self.by_owner
            .get(principal)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.subs.get(id))
                    .filter(|s| s.status == SubStatus::Active)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn status_counts(&self) -> (usize, usize, usize) {
        let mut paused = 0usize;
        let mut failing = 0usize;
        for sub in self.subs.values() {
            match sub.status {
                SubStatus::Paused => paused += 1,
                SubStatus::Active if sub.failed_payment_count > 0 => failing += 1,
                _ => {}
            }
        }
        (self.due.len(), paused, failing)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.values()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    fn index(&mut self, sub: &Subscription) {
        if sub.status == SubStatus::Active {
            self.due
                .insert((sub.next_execution_at, sub.sub_id.clone()));
        }
        self.by_owner
            .entry(sub.owner_principal.clone())
            .or_default()
            .insert(sub.sub_id.clone());
    }

    fn unindex(&mut self, sub: &Subscription) {
        self.due.remove(&(sub.next_execution_at, sub.sub_id.clone()));
        if let Some(owned) = self.by_owner.get_mut(&sub.owner_principal) {
            owned.remove(&sub.sub_id);
            if owned.is_empty() {
                self.by_owner.remove(&sub.owner_principal);
            }
        }
    }
}

pub const SCHEMA_VERSION: u32 = 1;

/// Serialized service state. Timers are deliberately absent: they are
/// ephemeral and rebuilt from the store on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub schema_version: u32,
    pub admins: BTreeSet<Principal>,
    pub readers: BTreeSet<Principal>,
    #[serde(default)]
    pub admin_bootstrapped: bool,
    pub subscriptions: Vec<Subscription>,
    pub fee_governance: FeeAddressGovernance,
    pub cycle_state: CycleState,
    #[serde(default)]
    pub encrypted_metadata: BTreeMap<SubId, String>,
    #[serde(default)]
    pub emergency_paused: BTreeSet<SubId>,
}

impl PersistedState {
    pub fn from_core(core: &CoreState) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            admins: core.acl.admins.clone(),
            readers: core.acl.readers.clone(),
            admin_bootstrapped: core.acl.bootstrapped,
            subscriptions: core.store.iter().cloned().collect(),
            fee_governance: core.fee_governance.clone(),
            cycle_state: core.cycles.clone(),
            encrypted_metadata: core.metadata.clone(),
            emergency_paused: core.emergency_paused.clone(),
        }
    }

    pub fn into_core(self) -> CoreState {
        let mut store = SubscriptionStore::new();
        for sub in self.subscriptions {
            store.put(sub);
        }
        CoreState {
            store,
            acl: Acl {
                admins: self.admins,
                readers: self.readers,
                bootstrapped: self.admin_bootstrapped,
            },
            fee_governance: self.fee_governance,
            cycles: self.cycle_state,
            metadata: self.encrypted_metadata,
            emergency_paused: self.emergency_paused,
            fatal: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read state file {}: {e}", path.display()))?;
        let st: PersistedState = serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse state file {}: {e}", path.display()))?;
        if st.schema_version != SCHEMA_VERSION {
            return Err(eyre!(
                "state file {} has schema version {}, this build supports {}. Refusing to run.",
                path.display(),
                st.schema_version,
                SCHEMA_VERSION
            ));
        }
        Ok(st)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    eyre!("failed to create state directory {}: {e}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| eyre!("failed to serialize state: {e}"))?;

        // Atomic-ish write: write to a temp file then rename, so an
        // interrupted process cannot leave a torn state file.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| eyre!("failed to write temp state file {}: {e}", tmp_path.display()))?;

        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path)
                    .map_err(|e| eyre!("failed to replace state file {}: {e}", path.display()))?;
            } else {
                return Err(eyre!(
                    "failed to replace state file {}: {err}",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

/// Saves the full core state after every externally visible mutation. A
/// persister without a path (tests, dry runs) keeps everything in memory.
#[derive(Debug, Clone)]
pub struct StatePersister {
    path: Option<PathBuf>,
}

impl StatePersister {
    pub fn to_file(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self, core: &CoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        PersistedState::from_core(core).save(path)
    }
}
