//! Collapse CRM deals that describe the same opportunity into one group.
//!
//! The CRM has one deal per consultant per opportunity, so a single customer
//! request shows up as several deals that only differ in their assignee and
//! phase. Deals sharing the title root, company, closing date and the
//! designated grouping field belong to one [`DealGroup`].

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::pipeline::deal::Deal;
use crate::pipeline::row::GroupKey;

static TRAILING_PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\([^()]*\)\s*$").expect("trailing parenthetical regex is valid")
});

const KEY_SEPARATOR: char = '\u{1f}';
const KEY_HEX_LEN: usize = 16;

/// Persisted grouping of deal ids under one opportunity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealGroup {
    pub key: GroupKey,
    pub member_ids: Vec<String>,
    /// Store version; 0 means never persisted.
    #[serde(default)]
    pub version: u64,
}

impl DealGroup {
    pub fn contains(&self, deal_id: &str) -> bool {
        self.member_ids.iter().any(|id| id == deal_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UngroupableReason {
    MissingGroupingField,
}

/// Deal left out of grouping, kept visible instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UngroupableDeal {
    pub deal_id: String,
    pub title: String,
    pub reason: UngroupableReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingOutcome {
    pub groups: Vec<DealGroup>,
    pub ungroupable: Vec<UngroupableDeal>,
}

/// Title with one trailing parenthetical removed, e.g. the consultant name
/// the CRM users append to cloned deals.
pub fn title_root(title: &str) -> String {
    TRAILING_PARENTHETICAL.replace(title.trim(), "").trim().to_string()
}

/// Grouping key of a deal, or the reason it cannot be grouped.
pub fn group_key(deal: &Deal, grouping_field_id: &str) -> Result<GroupKey, UngroupableReason> {
    let field = deal
        .custom_field_text(grouping_field_id)
        .ok_or(UngroupableReason::MissingGroupingField)?;

    let mut hasher = Sha256::new();
    let root = title_root(&deal.title);
    let closing = deal
        .estimated_closing_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    for (i, part) in [
        root.as_str(),
        deal.company_label().unwrap_or_default(),
        closing.as_str(),
        field.as_str(),
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            hasher.update(KEY_SEPARATOR.to_string().as_bytes());
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(GroupKey::new(&hex[..KEY_HEX_LEN]))
}

/// Group a deal list. Groups keep first-appearance order and members keep
/// input order, so the same input always yields the same outcome.
pub fn group_deals(deals: &[Deal], grouping_field_id: &str) -> GroupingOutcome {
    let mut outcome = GroupingOutcome::default();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();

    for deal in deals {
        match group_key(deal, grouping_field_id) {
            Ok(key) => {
                let slot = *index.entry(key.clone()).or_insert_with(|| {
                    outcome.groups.push(DealGroup {
                        key,
                        member_ids: Vec::new(),
                        version: 0,
                    });
                    outcome.groups.len() - 1
                });
                let group = &mut outcome.groups[slot];
                if !group.contains(&deal.id) {
                    group.member_ids.push(deal.id.clone());
                }
            }
            Err(reason) => {
                tracing::warn!(
                    deal_id = %deal.id,
                    title = %deal.title,
                    "Deal has no value for grouping field {}; listing it as ungroupable",
                    grouping_field_id
                );
                outcome.ungroupable.push(UngroupableDeal {
                    deal_id: deal.id.clone(),
                    title: deal.title.clone(),
                    reason,
                });
            }
        }
    }

    outcome
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedGroups {
    /// Computed groups with stored members folded in.
    pub groups: Vec<DealGroup>,
    /// Groups that are new or gained members and must be upserted.
    pub pending_upserts: Vec<DealGroup>,
}

/// Fold previously stored memberships into freshly computed groups.
///
/// Stored members come first so a deal created by the board keeps its group
/// even when the CRM listing has not caught up yet. Nothing is ever removed.
pub fn merge_with_stored(computed: Vec<DealGroup>, stored: &[DealGroup]) -> MergedGroups {
    let stored_by_key: HashMap<&GroupKey, &DealGroup> =
        stored.iter().map(|g| (&g.key, g)).collect();
    let mut merged = MergedGroups::default();

    for group in computed {
        let Some(previous) = stored_by_key.get(&group.key) else {
            merged.pending_upserts.push(group.clone());
            merged.groups.push(group);
            continue;
        };

        let mut members = previous.member_ids.clone();
        let mut seen: HashSet<String> = members.iter().cloned().collect();
        let mut gained = false;
        for id in group.member_ids {
            if seen.insert(id.clone()) {
                members.push(id);
                gained = true;
            }
        }

        let combined = DealGroup {
            key: group.key,
            member_ids: members,
            version: previous.version,
        };
        if gained {
            merged.pending_upserts.push(combined.clone());
        }
        merged.groups.push(combined);
    }

    merged
}
