//! Board cell identifiers.
//!
//! A row is either the unassigned pool at the top of the board or one phase
//! column of one grouped opportunity. Code inside the crate works with
//! [`RowKey`] values; the `"<groupedDealId>/<phaseName>"` and `"0"` strings
//! only exist at the HTTP and storage boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::pipeline::phase::Phase;

/// Wire value of the unassigned pool.
pub const UNASSIGNED_ROW: &str = "0";

/// Stable identifier of a grouped opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Unassigned,
    Placement { group: GroupKey, phase: Phase },
}

impl RowKey {
    pub fn placement(group: GroupKey, phase: Phase) -> Self {
        Self::Placement { group, phase }
    }

    pub fn is_unassigned(&self) -> bool {
        matches!(self, Self::Unassigned)
    }

    pub fn group(&self) -> Option<&GroupKey> {
        match self {
            Self::Unassigned => None,
            Self::Placement { group, .. } => Some(group),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Unassigned => None,
            Self::Placement { phase, .. } => Some(*phase),
        }
    }

    pub fn in_group(&self, key: &GroupKey) -> bool {
        self.group() == Some(key)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => f.write_str(UNASSIGNED_ROW),
            Self::Placement { group, phase } => write!(f, "{}/{}", group, phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKeyParseError(pub String);

impl fmt::Display for RowKeyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid row identifier '{}'", self.0)
    }
}

impl std::error::Error for RowKeyParseError {}

impl FromStr for RowKey {
    type Err = RowKeyParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed == UNASSIGNED_ROW {
            return Ok(Self::Unassigned);
        }
        let (group, phase) = trimmed
            .rsplit_once('/')
            .ok_or_else(|| RowKeyParseError(raw.to_string()))?;
        if group.is_empty() {
            return Err(RowKeyParseError(raw.to_string()));
        }
        let phase = Phase::from_db_value(phase).ok_or_else(|| RowKeyParseError(raw.to_string()))?;
        Ok(Self::placement(GroupKey::new(group), phase))
    }
}

impl Serialize for RowKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RowKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pool_and_placements() {
        assert_eq!("0".parse::<RowKey>(), Ok(RowKey::Unassigned));
        assert_eq!(
            "ab12/Non-Retained".parse::<RowKey>(),
            Ok(RowKey::placement(GroupKey::new("ab12"), Phase::NonRetained))
        );
    }

    #[test]
    fn rejects_unknown_phase_and_missing_group() {
        assert!("ab12/Won".parse::<RowKey>().is_err());
        assert!("/Proposed".parse::<RowKey>().is_err());
        assert!("ab12".parse::<RowKey>().is_err());
    }

    #[test]
    fn accessors_expose_group_and_phase() {
        let row = RowKey::placement(GroupKey::new("g1"), Phase::Proposed);
        assert_eq!(row.group().map(GroupKey::as_str), Some("g1"));
        assert_eq!(row.phase(), Some(Phase::Proposed));
        assert!(row.in_group(&GroupKey::new("g1")));
        assert!(!RowKey::Unassigned.in_group(&GroupKey::new("g1")));
    }

    #[test]
    fn serializes_as_wire_string() {
        let rows = vec![
            RowKey::Unassigned,
            RowKey::placement(GroupKey::new("g1"), Phase::Opportunities),
        ];
        let json = serde_json::to_string(&rows).expect("serialize");
        assert_eq!(json, r#"["0","g1/Opportunities"]"#);
        let back: Vec<RowKey> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, rows);
    }
}
