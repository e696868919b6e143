//! Drag-and-drop reconciliation.
//!
//! A drag starts on a source row (the pool or one of the employee's
//! placements), may hover over any number of rows, and ends on a target.
//! At drag-end the move is checked against the phase rules and turned into a
//! [`Transition`] or rejected. Nothing here touches the network.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::employee::Employee;
use crate::pipeline::phase::Phase;
use crate::pipeline::row::RowKey;

/// Sessions without a drop for this long are treated as abandoned.
const SESSION_TTL_SECS: i64 = 300;
/// Open sessions kept at most; the oldest is dropped when exceeded.
const MAX_SESSIONS: usize = 256;

/// Pointer events forwarded by a board client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DragEvent {
    Start { employee_id: String, source: RowKey },
    Over { target: Option<RowKey> },
    End { target: Option<RowKey> },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragSession {
    pub employee_id: String,
    pub source: RowKey,
    pub over: Option<RowKey>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// New placement in an opportunity (from the pool or another opportunity).
    Assign,
    /// Phase change inside one opportunity.
    Advance,
    /// Placement dropped back on the pool.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub employee_id: String,
    pub kind: TransitionKind,
    pub from: RowKey,
    pub to: RowKey,
}

impl Transition {
    pub fn old_phase(&self) -> Option<Phase> {
        self.from.phase()
    }

    pub fn new_phase(&self) -> Option<Phase> {
        self.to.phase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Only Opportunities and Proposed can be entered without a placement.
    EntryPhaseRequired,
    /// The employee already holds a row in the target opportunity.
    AlreadyPlaced,
    /// Backward or skipping phase change inside an opportunity.
    IllegalPhaseChange,
    /// Only Opportunities placements can go back to the pool.
    RemovalNotAllowed,
    /// The drag started on a row the employee does not hold.
    UnknownSource,
    UnknownEmployee,
}

impl RejectReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::EntryPhaseRequired => "Move not allowed: start in Opportunities or Proposed",
            Self::AlreadyPlaced => "Move not allowed: already assigned to this opportunity",
            Self::IllegalPhaseChange => "Move not allowed: phases only move forward one step",
            Self::RemovalNotAllowed => "Move not allowed: only Opportunities can be unassigned",
            Self::UnknownSource => "Move not allowed: the board changed, refresh and retry",
            Self::UnknownEmployee => "Move not allowed: unknown employee",
        }
    }
}

/// Result of checking a single move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveCheck {
    Allowed(TransitionKind),
    NoOp,
    Forbidden(RejectReason),
}

/// User-facing notice produced by a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    MoveNotAllowed {
        employee_id: String,
        reason: RejectReason,
        message: String,
    },
    MoveRedirected {
        employee_id: String,
        requested: RowKey,
        applied: RowKey,
    },
    SyncFailed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragOutcome {
    /// Drag in progress, nothing decided yet.
    Pending,
    Cancelled,
    Unchanged,
    Applied(Transition),
    Redirected {
        transition: Transition,
        requested: RowKey,
    },
    Rejected {
        employee_id: String,
        reason: RejectReason,
    },
}

impl DragOutcome {
    pub fn transition(&self) -> Option<&Transition> {
        match self {
            Self::Applied(t) | Self::Redirected { transition: t, .. } => Some(t),
            _ => None,
        }
    }

    pub fn notification(&self) -> Option<Notification> {
        match self {
            Self::Rejected {
                employee_id,
                reason,
            } => Some(Notification::MoveNotAllowed {
                employee_id: employee_id.clone(),
                reason: *reason,
                message: reason.message().to_string(),
            }),
            Self::Redirected {
                transition,
                requested,
            } => Some(Notification::MoveRedirected {
                employee_id: transition.employee_id.clone(),
                requested: requested.clone(),
                applied: transition.to.clone(),
            }),
            _ => None,
        }
    }
}

/// Legality of moving `employee` from `source` to `target`.
pub fn check_move(employee: &Employee, source: &RowKey, target: &RowKey) -> MoveCheck {
    if !source.is_unassigned() && !employee.rows.contains(source) {
        return MoveCheck::Forbidden(RejectReason::UnknownSource);
    }
    if source == target {
        return MoveCheck::NoOp;
    }

    match (source, target) {
        (RowKey::Unassigned, RowKey::Unassigned) => MoveCheck::NoOp,
        (RowKey::Placement { phase, .. }, RowKey::Unassigned) => {
            if *phase == Phase::Opportunities {
                MoveCheck::Allowed(TransitionKind::Remove)
            } else {
                MoveCheck::Forbidden(RejectReason::RemovalNotAllowed)
            }
        }
        (
            RowKey::Placement {
                group: from_group,
                phase: from_phase,
            },
            RowKey::Placement {
                group: to_group,
                phase: to_phase,
            },
        ) if from_group == to_group => {
            if from_phase.can_advance_to(*to_phase) {
                MoveCheck::Allowed(TransitionKind::Advance)
            } else {
                MoveCheck::Forbidden(RejectReason::IllegalPhaseChange)
            }
        }
        (_, RowKey::Placement { group, phase }) => {
            if employee.placement_in(group).is_some() {
                MoveCheck::Forbidden(RejectReason::AlreadyPlaced)
            } else if !phase.is_entry() {
                MoveCheck::Forbidden(RejectReason::EntryPhaseRequired)
            } else {
                MoveCheck::Allowed(TransitionKind::Assign)
            }
        }
    }
}

/// Decide a drop, trying the source opportunity at the requested phase when
/// a drop into another opportunity is refused.
pub fn decide_drop(employee: &Employee, source: &RowKey, target: &RowKey) -> DragOutcome {
    let transition = |kind, to: &RowKey| Transition {
        employee_id: employee.id.clone(),
        kind,
        from: source.clone(),
        to: to.clone(),
    };

    let reason = match check_move(employee, source, target) {
        MoveCheck::Allowed(kind) => return DragOutcome::Applied(transition(kind, target)),
        MoveCheck::NoOp => return DragOutcome::Unchanged,
        MoveCheck::Forbidden(reason) => reason,
    };

    if let (
        RowKey::Placement {
            group: from_group, ..
        },
        RowKey::Placement {
            group: to_group,
            phase: to_phase,
        },
    ) = (source, target)
        && from_group != to_group
        && reason != RejectReason::UnknownSource
    {
        let snapped = RowKey::placement(from_group.clone(), *to_phase);
        if let MoveCheck::Allowed(kind) = check_move(employee, source, &snapped) {
            return DragOutcome::Redirected {
                transition: transition(kind, &snapped),
                requested: target.clone(),
            };
        }
    }

    DragOutcome::Rejected {
        employee_id: employee.id.clone(),
        reason,
    }
}

/// Apply an accepted transition to the in-memory employee.
///
/// `group_deal_ids` lists the member deals of the opportunity being left and
/// is only used for removals.
pub fn apply_transition(employee: &mut Employee, transition: &Transition, group_deal_ids: &[String]) {
    match transition.kind {
        TransitionKind::Assign => employee.add_placement(transition.to.clone()),
        TransitionKind::Advance => employee.replace_placement(&transition.from, transition.to.clone()),
        TransitionKind::Remove => {
            if let Some(group) = transition.from.group() {
                employee.remove_placement(group, group_deal_ids);
            }
        }
    }
}

/// Open drag sessions, one per board client.
#[derive(Debug, Default)]
pub struct DragTracker {
    sessions: HashMap<String, DragSession>,
}

impl DragTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, client_id: &str) -> Option<&DragSession> {
        self.sessions.get(client_id)
    }

    /// Feed one event. `lookup` resolves employees for the drop decision.
    pub fn handle<'a, F>(&mut self, client_id: &str, event: DragEvent, lookup: F) -> DragOutcome
    where
        F: FnOnce(&str) -> Option<&'a Employee>,
    {
        match event {
            DragEvent::Start {
                employee_id,
                source,
            } => {
                let now = Utc::now();
                self.evict_stale(now);
                self.sessions.insert(
                    client_id.to_string(),
                    DragSession {
                        employee_id,
                        source,
                        over: None,
                        started_at: now,
                    },
                );
                DragOutcome::Pending
            }
            DragEvent::Over { target } => {
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.over = target;
                }
                DragOutcome::Pending
            }
            DragEvent::Cancel => {
                self.sessions.remove(client_id);
                DragOutcome::Cancelled
            }
            DragEvent::End { target } => {
                let Some(session) = self.sessions.remove(client_id) else {
                    return DragOutcome::Cancelled;
                };
                let Some(target) = target.or(session.over) else {
                    return DragOutcome::Cancelled;
                };
                match lookup(&session.employee_id) {
                    Some(employee) => decide_drop(employee, &session.source, &target),
                    None => DragOutcome::Rejected {
                        employee_id: session.employee_id,
                        reason: RejectReason::UnknownEmployee,
                    },
                }
            }
        }
    }

    /// Drop abandoned sessions and make room for one more.
    fn evict_stale(&mut self, now: DateTime<Utc>) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now - s.started_at <= Duration::seconds(SESSION_TTL_SECS));
        while self.sessions.len() >= MAX_SESSIONS {
            let Some(oldest) = self
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.started_at)
                .map(|(client, _)| client.clone())
            else {
                break;
            };
            self.sessions.remove(&oldest);
        }
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} abandoned drag sessions", evicted);
        }
    }
}
