use async_trait::async_trait;
use libsql::params;

use crate::db::{DealGroupStore, EmployeeStore, union_members};
use crate::error::DatabaseError;
use crate::pipeline::employee::PlacementState;
use crate::pipeline::grouping::DealGroup;
use crate::pipeline::row::GroupKey;

use super::{LibSqlBackend, from_json, from_version, get_i64, get_text, to_json, to_version};

/// Concurrent upserts of the same group retry this many times before the
/// conflict is surfaced.
const UPSERT_ATTEMPTS: usize = 3;

fn row_to_placement(row: &libsql::Row) -> Result<PlacementState, DatabaseError> {
    Ok(PlacementState {
        employee_id: get_text(row, 0),
        rows: from_json(&get_text(row, 1))?,
        deal_ids: from_json(&get_text(row, 2))?,
        version: to_version(get_i64(row, 3)),
    })
}

fn row_to_group(row: &libsql::Row) -> Result<DealGroup, DatabaseError> {
    Ok(DealGroup {
        key: GroupKey::new(get_text(row, 0)),
        member_ids: from_json(&get_text(row, 1))?,
        version: to_version(get_i64(row, 2)),
    })
}

fn conflict(entity: &str, id: &str, expected: u64, found: u64) -> DatabaseError {
    DatabaseError::VersionConflict {
        entity: entity.to_string(),
        id: id.to_string(),
        expected,
        found,
    }
}

#[async_trait]
impl EmployeeStore for LibSqlBackend {
    async fn list_placements(&self) -> Result<Vec<PlacementState>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, rows, deal_ids, version FROM employees ORDER BY id ASC",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_placement(&row)?);
        }
        Ok(out)
    }

    async fn get_placement(
        &self,
        employee_id: &str,
    ) -> Result<Option<PlacementState>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, rows, deal_ids, version FROM employees WHERE id = ?1 LIMIT 1",
                params![employee_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_placement(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_placement(&self, state: &PlacementState) -> Result<PlacementState, DatabaseError> {
        let conn = self.connect().await?;
        let rows_json = to_json(&state.rows)?;
        let deals_json = to_json(&state.deal_ids)?;
        let next = from_version(state.version + 1)?;

        let changed = if state.version == 0 {
            conn.execute(
                "INSERT INTO employees (id, rows, deal_ids, version, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, datetime('now')) \
                 ON CONFLICT (id) DO NOTHING",
                params![state.employee_id.as_str(), rows_json, deals_json, next],
            )
            .await?
        } else {
            conn.execute(
                "UPDATE employees SET rows = ?2, deal_ids = ?3, version = ?4, updated_at = datetime('now') \
                 WHERE id = ?1 AND version = ?5",
                params![
                    state.employee_id.as_str(),
                    rows_json,
                    deals_json,
                    next,
                    from_version(state.version)?
                ],
            )
            .await?
        };

        if changed == 0 {
            let found = self
                .get_placement(&state.employee_id)
                .await?
                .map(|p| p.version)
                .unwrap_or(0);
            return Err(conflict("employee", &state.employee_id, state.version, found));
        }

        let mut saved = state.clone();
        saved.version = state.version + 1;
        Ok(saved)
    }
}

impl LibSqlBackend {
    /// Write `group` if the stored version still equals `expected`.
    async fn write_group(&self, group: &DealGroup, expected: u64) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let members = to_json(&group.member_ids)?;
        let changed = if expected == 0 {
            conn.execute(
                "INSERT INTO deal_groups (group_key, member_ids, version, updated_at) \
                 VALUES (?1, ?2, ?3, datetime('now')) \
                 ON CONFLICT (group_key) DO NOTHING",
                params![group.key.as_str(), members, from_version(group.version)?],
            )
            .await?
        } else {
            conn.execute(
                "UPDATE deal_groups SET member_ids = ?2, version = ?3, updated_at = datetime('now') \
                 WHERE group_key = ?1 AND version = ?4",
                params![
                    group.key.as_str(),
                    members,
                    from_version(group.version)?,
                    from_version(expected)?
                ],
            )
            .await?
        };
        Ok(changed > 0)
    }
}

#[async_trait]
impl DealGroupStore for LibSqlBackend {
    async fn list_deal_groups(&self) -> Result<Vec<DealGroup>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT group_key, member_ids, version FROM deal_groups ORDER BY group_key ASC",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_group(&row)?);
        }
        Ok(out)
    }

    async fn get_deal_group(&self, key: &GroupKey) -> Result<Option<DealGroup>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT group_key, member_ids, version FROM deal_groups WHERE group_key = ?1 LIMIT 1",
                params![key.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_group(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_deal_group(&self, group: &DealGroup) -> Result<DealGroup, DatabaseError> {
        let mut last_found = 0;
        for _ in 0..UPSERT_ATTEMPTS {
            let mut stored = self.get_deal_group(&group.key).await?.unwrap_or(DealGroup {
                key: group.key.clone(),
                member_ids: Vec::new(),
                version: 0,
            });
            let expected = stored.version;
            if !union_members(&mut stored.member_ids, &group.member_ids) && expected > 0 {
                return Ok(stored);
            }
            stored.version = expected + 1;
            if self.write_group(&stored, expected).await? {
                return Ok(stored);
            }
            last_found = expected;
            tracing::debug!("Deal group {} changed underneath upsert, retrying", group.key);
        }
        Err(conflict("deal group", group.key.as_str(), last_found, last_found + 1))
    }

    async fn append_group_member(
        &self,
        key: &GroupKey,
        deal_id: &str,
        expected_version: u64,
    ) -> Result<DealGroup, DatabaseError> {
        let mut stored = self
            .get_deal_group(key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "deal group".to_string(),
                id: key.to_string(),
            })?;
        if stored.version != expected_version {
            return Err(conflict("deal group", key.as_str(), expected_version, stored.version));
        }
        if !union_members(&mut stored.member_ids, &[deal_id.to_string()]) {
            return Ok(stored);
        }
        stored.version = expected_version + 1;
        if !self.write_group(&stored, expected_version).await? {
            let found = self
                .get_deal_group(key)
                .await?
                .map(|g| g.version)
                .unwrap_or(0);
            return Err(conflict("deal group", key.as_str(), expected_version, found));
        }
        Ok(stored)
    }
}
