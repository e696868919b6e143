use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::db::{DealGroupStore, EmployeeStore, union_members};
use crate::error::DatabaseError;
use crate::pipeline::employee::PlacementState;
use crate::pipeline::grouping::DealGroup;
use crate::pipeline::row::GroupKey;

/// Process-local store. Ordered maps keep listings deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    placements: RwLock<BTreeMap<String, PlacementState>>,
    groups: RwLock<BTreeMap<GroupKey, DealGroup>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmployeeStore for MemoryStore {
    async fn list_placements(&self) -> Result<Vec<PlacementState>, DatabaseError> {
        Ok(self.placements.read().await.values().cloned().collect())
    }

    async fn get_placement(
        &self,
        employee_id: &str,
    ) -> Result<Option<PlacementState>, DatabaseError> {
        Ok(self.placements.read().await.get(employee_id).cloned())
    }

    async fn save_placement(&self, state: &PlacementState) -> Result<PlacementState, DatabaseError> {
        let mut placements = self.placements.write().await;
        let found = placements
            .get(&state.employee_id)
            .map(|p| p.version)
            .unwrap_or(0);
        if found != state.version {
            return Err(DatabaseError::VersionConflict {
                entity: "employee".to_string(),
                id: state.employee_id.clone(),
                expected: state.version,
                found,
            });
        }
        let mut saved = state.clone();
        saved.version = found + 1;
        placements.insert(saved.employee_id.clone(), saved.clone());
        Ok(saved)
    }
}

#[async_trait]
impl DealGroupStore for MemoryStore {
    async fn list_deal_groups(&self) -> Result<Vec<DealGroup>, DatabaseError> {
        Ok(self.groups.read().await.values().cloned().collect())
    }

    async fn get_deal_group(&self, key: &GroupKey) -> Result<Option<DealGroup>, DatabaseError> {
        Ok(self.groups.read().await.get(key).cloned())
    }

    async fn upsert_deal_group(&self, group: &DealGroup) -> Result<DealGroup, DatabaseError> {
        let mut groups = self.groups.write().await;
        let stored = groups.entry(group.key.clone()).or_insert_with(|| DealGroup {
            key: group.key.clone(),
            member_ids: Vec::new(),
            version: 0,
        });
        if union_members(&mut stored.member_ids, &group.member_ids) || stored.version == 0 {
            stored.version += 1;
        }
        Ok(stored.clone())
    }

    async fn append_group_member(
        &self,
        key: &GroupKey,
        deal_id: &str,
        expected_version: u64,
    ) -> Result<DealGroup, DatabaseError> {
        let mut groups = self.groups.write().await;
        let stored = groups.get_mut(key).ok_or_else(|| DatabaseError::NotFound {
            entity: "deal group".to_string(),
            id: key.to_string(),
        })?;
        if stored.version != expected_version {
            return Err(DatabaseError::VersionConflict {
                entity: "deal group".to_string(),
                id: key.to_string(),
                expected: expected_version,
                found: stored.version,
            });
        }
        if union_members(&mut stored.member_ids, &[deal_id.to_string()]) {
            stored.version += 1;
        }
        Ok(stored.clone())
    }
}
