//! Consultants and their board placements.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::pipeline::row::{GroupKey, RowKey};

/// Identity fields as delivered by the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Free-form list columns such as title, city and status.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub photo: Option<String>,
}

/// Placement state owned by the board and persisted in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementState {
    pub employee_id: String,
    pub rows: Vec<RowKey>,
    pub deal_ids: Vec<String>,
    /// Store version; 0 means never persisted.
    #[serde(default)]
    pub version: u64,
}

impl PlacementState {
    pub fn unassigned(employee_id: impl Into<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            rows: vec![RowKey::Unassigned],
            deal_ids: Vec::new(),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub email: String,
    pub fields: BTreeMap<String, String>,
    pub photo: Option<String>,
    pub rows: Vec<RowKey>,
    pub deals: Vec<String>,
    pub version: u64,
}

impl Employee {
    pub fn merge(entry: DirectoryEntry, placement: Option<PlacementState>) -> Self {
        let placement = placement.unwrap_or_else(|| PlacementState::unassigned(&entry.id));
        let mut employee = Self {
            id: entry.id,
            name: entry.name,
            email: entry.email,
            fields: entry.fields,
            photo: entry.photo,
            rows: placement.rows,
            deals: placement.deal_ids,
            version: placement.version,
        };
        employee.normalize_rows();
        employee
    }

    pub fn field_or_na(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("N/A")
    }

    pub fn placements(&self) -> impl Iterator<Item = &RowKey> {
        self.rows.iter().filter(|r| !r.is_unassigned())
    }

    pub fn placement_in(&self, group: &GroupKey) -> Option<&RowKey> {
        self.rows.iter().find(|r| r.in_group(group))
    }

    pub fn is_unassigned(&self) -> bool {
        self.placements().next().is_none()
    }

    /// Add a placement in an opportunity the employee is not placed in yet.
    pub fn add_placement(&mut self, row: RowKey) {
        if let Some(group) = row.group() {
            if self.placement_in(group).is_some() {
                return;
            }
        } else {
            return;
        }
        self.rows.retain(|r| !r.is_unassigned());
        self.rows.push(row);
    }

    /// Swap one placement for another inside the same opportunity.
    pub fn replace_placement(&mut self, from: &RowKey, to: RowKey) {
        match self.rows.iter_mut().find(|r| *r == from) {
            Some(slot) => *slot = to,
            None => self.add_placement(to),
        }
    }

    /// Drop the placement and associated deal ids for one opportunity.
    pub fn remove_placement(&mut self, group: &GroupKey, group_deal_ids: &[String]) {
        self.rows.retain(|r| !r.in_group(group));
        self.deals.retain(|id| !group_deal_ids.contains(id));
        if self.rows.is_empty() {
            self.rows.push(RowKey::Unassigned);
        }
    }

    pub fn add_deal(&mut self, deal_id: &str) {
        if !self.deals.iter().any(|d| d == deal_id) {
            self.deals.push(deal_id.to_string());
        }
    }

    /// The deal this employee owns among `member_ids`, if any.
    pub fn deal_in<'a>(&self, member_ids: &'a [String]) -> Option<&'a String> {
        member_ids.iter().find(|id| self.deals.contains(id))
    }

    /// Enforce one row per opportunity and keep the pool marker present
    /// exactly when there is no placement.
    pub fn normalize_rows(&mut self) {
        let mut seen: HashSet<GroupKey> = HashSet::new();
        self.rows.retain(|row| match row.group() {
            Some(group) => seen.insert(group.clone()),
            None => false,
        });
        if self.rows.is_empty() {
            self.rows.push(RowKey::Unassigned);
        }
    }

    pub fn has_unique_opportunities(&self) -> bool {
        let mut seen = HashSet::new();
        self.placements()
            .filter_map(RowKey::group)
            .all(|g| seen.insert(g))
    }

    pub fn placement_state(&self) -> PlacementState {
        PlacementState {
            employee_id: self.id.clone(),
            rows: self.rows.clone(),
            deal_ids: self.deals.clone(),
            version: self.version,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::employee;
    use super::*;
    use crate::pipeline::phase::Phase;

    fn row(group: &str, phase: Phase) -> RowKey {
        RowKey::placement(GroupKey::new(group), phase)
    }

    #[test]
    fn merge_without_state_starts_in_pool() {
        let entry = DirectoryEntry {
            id: "e1".to_string(),
            name: "Ann".to_string(),
            email: "ann@corp.test".to_string(),
            fields: BTreeMap::new(),
            photo: None,
        };
        let e = Employee::merge(entry, None);
        assert_eq!(e.rows, vec![RowKey::Unassigned]);
        assert_eq!(e.version, 0);
        assert_eq!(e.field_or_na("city"), "N/A");
    }

    #[test]
    fn normalize_drops_duplicate_opportunities_and_stray_pool_marker() {
        let e = employee(
            "e1",
            vec![
                RowKey::Unassigned,
                row("g1", Phase::Opportunities),
                row("g1", Phase::Proposed),
                row("g2", Phase::Interview),
            ],
        );
        assert_eq!(
            e.rows,
            vec![row("g1", Phase::Opportunities), row("g2", Phase::Interview)]
        );
        assert!(e.has_unique_opportunities());
    }

    #[test]
    fn add_then_remove_returns_to_pool() {
        let mut e = employee("e1", vec![RowKey::Unassigned]);
        e.add_placement(row("g1", Phase::Opportunities));
        e.add_deal("d1");
        assert_eq!(e.rows, vec![row("g1", Phase::Opportunities)]);

        e.add_placement(row("g1", Phase::Proposed));
        assert_eq!(e.rows.len(), 1, "second placement in g1 must be ignored");

        e.remove_placement(&GroupKey::new("g1"), &["d1".to_string()]);
        assert_eq!(e.rows, vec![RowKey::Unassigned]);
        assert!(e.deals.is_empty());
    }

    #[test]
    fn replace_keeps_position() {
        let mut e = employee(
            "e1",
            vec![row("g1", Phase::Opportunities), row("g2", Phase::Proposed)],
        );
        e.replace_placement(&row("g1", Phase::Opportunities), row("g1", Phase::Proposed));
        assert_eq!(e.rows, vec![row("g1", Phase::Proposed), row("g2", Phase::Proposed)]);
    }

    #[test]
    fn deal_in_finds_owned_member() {
        let mut e = employee("e1", vec![RowKey::Unassigned]);
        e.add_deal("d2");
        let members = vec!["d1".to_string(), "d2".to_string()];
        assert_eq!(e.deal_in(&members).map(String::as_str), Some("d2"));
    }
}
