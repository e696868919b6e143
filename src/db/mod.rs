//! Document store abstraction.
//!
//! The board persists two collections: employee placement state and the
//! deal-group cache. Both sit behind the [`Database`] supertrait so the
//! service can run on the embedded libSQL backend or the in-memory one.
//!
//! - `libsql` (default): libSQL file database, one JSON document per row
//! - `memory`: process-local maps, used for tests and throwaway boards

#[cfg(feature = "libsql")]
pub mod libsql;

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::DatabaseError;
use crate::pipeline::employee::PlacementState;
use crate::pipeline::grouping::DealGroup;
use crate::pipeline::row::GroupKey;

/// Create a store backend from configuration, run migrations, and return it.
pub async fn connect_from_config(config: &StoreConfig) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        StoreBackend::LibSql => {
            let default_path = crate::config::default_libsql_path();
            let path = config.libsql_path.as_deref().unwrap_or(&default_path);
            let backend = libsql::LibSqlBackend::new_local(path).await?;
            backend.run_migrations().await?;
            tracing::info!("Document store: libSQL at {}", path.display());
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "libsql"))]
        StoreBackend::LibSql => Err(DatabaseError::Pool(
            "libSQL backend not compiled in. Enable the 'libsql' feature.".to_string(),
        )),
        StoreBackend::Memory => {
            tracing::warn!("Document store: in-memory, placements are lost on restart");
            Ok(Arc::new(memory::MemoryStore::new()))
        }
    }
}

// ==================== Sub-traits ====================
//
// Versioned writes: callers pass the record with the version they last read.
// A mismatch yields `DatabaseError::VersionConflict` and nothing is written.

#[async_trait]
pub trait EmployeeStore: Send + Sync {
    async fn list_placements(&self) -> Result<Vec<PlacementState>, DatabaseError>;
    async fn get_placement(&self, employee_id: &str)
    -> Result<Option<PlacementState>, DatabaseError>;
    /// Persist `state` if the stored version equals `state.version`; returns
    /// the stored record with its new version.
    async fn save_placement(&self, state: &PlacementState) -> Result<PlacementState, DatabaseError>;
}

#[async_trait]
pub trait DealGroupStore: Send + Sync {
    async fn list_deal_groups(&self) -> Result<Vec<DealGroup>, DatabaseError>;
    async fn get_deal_group(&self, key: &GroupKey) -> Result<Option<DealGroup>, DatabaseError>;
    /// Insert or extend a group. Members are unioned with what is stored and
    /// never removed, so repeating the call is harmless.
    async fn upsert_deal_group(&self, group: &DealGroup) -> Result<DealGroup, DatabaseError>;
    /// Append one member if the stored version equals `expected_version`.
    async fn append_group_member(
        &self,
        key: &GroupKey,
        deal_id: &str,
        expected_version: u64,
    ) -> Result<DealGroup, DatabaseError>;
}

pub trait Database: EmployeeStore + DealGroupStore + Send + Sync {}

impl<T: EmployeeStore + DealGroupStore + Send + Sync> Database for T {}

/// Union `incoming` into `existing`, keeping order. Returns true if anything
/// was added.
pub(crate) fn union_members(existing: &mut Vec<String>, incoming: &[String]) -> bool {
    let mut changed = false;
    for id in incoming {
        if !existing.contains(id) {
            existing.push(id.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behavior every backend must share.

    use super::*;
    use crate::pipeline::phase::Phase;
    use crate::pipeline::row::RowKey;

    fn placed(id: &str, version: u64) -> PlacementState {
        PlacementState {
            employee_id: id.to_string(),
            rows: vec![RowKey::placement(GroupKey::new("g1"), Phase::Proposed)],
            deal_ids: vec!["d1".to_string()],
            version,
        }
    }

    pub async fn placements_are_versioned(db: &dyn Database) {
        assert!(db.get_placement("e1").await.expect("get").is_none());

        let saved = db.save_placement(&placed("e1", 0)).await.expect("insert");
        assert_eq!(saved.version, 1);

        let stale = db.save_placement(&placed("e1", 0)).await;
        assert!(matches!(
            stale,
            Err(DatabaseError::VersionConflict { expected: 0, found: 1, .. })
        ));

        let mut next = saved.clone();
        next.rows = vec![RowKey::Unassigned];
        next.deal_ids.clear();
        let updated = db.save_placement(&next).await.expect("update");
        assert_eq!(updated.version, 2);
        assert_eq!(
            db.get_placement("e1").await.expect("get"),
            Some(updated.clone())
        );
        assert_eq!(db.list_placements().await.expect("list"), vec![updated]);
    }

    pub async fn groups_only_grow(db: &dyn Database) {
        let key = GroupKey::new("g1");
        let first = db
            .upsert_deal_group(&DealGroup {
                key: key.clone(),
                member_ids: vec!["d1".to_string(), "d2".to_string()],
                version: 0,
            })
            .await
            .expect("insert");
        assert_eq!(first.version, 1);

        let again = db
            .upsert_deal_group(&DealGroup {
                key: key.clone(),
                member_ids: vec!["d3".to_string()],
                version: 0,
            })
            .await
            .expect("merge");
        assert_eq!(again.member_ids, vec!["d1", "d2", "d3"]);
        assert_eq!(again.version, 2);

        let repeat = db.upsert_deal_group(&again).await.expect("repeat");
        assert_eq!(repeat.version, 2, "no-op upsert keeps the version");

        let appended = db
            .append_group_member(&key, "d4", 2)
            .await
            .expect("append");
        assert_eq!(appended.member_ids.last().map(String::as_str), Some("d4"));
        assert_eq!(appended.version, 3);

        let stale = db.append_group_member(&key, "d5", 2).await;
        assert!(matches!(stale, Err(DatabaseError::VersionConflict { .. })));

        let missing = db.append_group_member(&GroupKey::new("nope"), "d1", 0).await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));

        assert_eq!(db.list_deal_groups().await.expect("list").len(), 1);
    }
}
