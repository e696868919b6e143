use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stage of the sales pipeline, in board column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Opportunities,
    Proposed,
    Interview,
    Retained,
    #[serde(rename = "Non-Retained")]
    NonRetained,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Self::Opportunities,
        Self::Proposed,
        Self::Interview,
        Self::Retained,
        Self::NonRetained,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opportunities => "Opportunities",
            Self::Proposed => "Proposed",
            Self::Interview => "Interview",
            Self::Retained => "Retained",
            Self::NonRetained => "Non-Retained",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "Opportunities" => Some(Self::Opportunities),
            "Proposed" => Some(Self::Proposed),
            "Interview" => Some(Self::Interview),
            "Retained" => Some(Self::Retained),
            "Non-Retained" | "NonRetained" => Some(Self::NonRetained),
            _ => None,
        }
    }

    /// Phases an employee may enter without an existing placement in the
    /// opportunity.
    pub fn is_entry(self) -> bool {
        matches!(self, Self::Opportunities | Self::Proposed)
    }

    /// Single forward step inside one opportunity.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Self::Opportunities, Self::Proposed)
                | (Self::Proposed, Self::Interview)
                | (Self::Interview, Self::Retained)
                | (Self::Interview, Self::NonRetained)
        )
    }

    /// Environment-variable suffix used for the CRM phase-id mapping.
    pub fn env_suffix(self) -> &'static str {
        match self {
            Self::Opportunities => "OPPORTUNITIES",
            Self::Proposed => "PROPOSED",
            Self::Interview => "INTERVIEW",
            Self::Retained => "RETAINED",
            Self::NonRetained => "NON_RETAINED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bidirectional mapping between board phases and CRM deal-phase ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseMap {
    to_crm: HashMap<Phase, String>,
    from_crm: HashMap<String, Phase>,
}

impl PhaseMap {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Phase, String)>,
    {
        let mut map = Self::default();
        for (phase, id) in entries {
            map.from_crm.insert(id.clone(), phase);
            map.to_crm.insert(phase, id);
        }
        map
    }

    pub fn crm_id(&self, phase: Phase) -> Option<&str> {
        self.to_crm.get(&phase).map(String::as_str)
    }

    pub fn phase_for(&self, crm_phase_id: &str) -> Option<Phase> {
        self.from_crm.get(crm_phase_id).copied()
    }
}
