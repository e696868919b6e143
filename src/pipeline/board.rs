//! Board state and its coordinator task.
//!
//! [`Board`] owns the deal listing, the opportunity groups, the employees and
//! the open drag sessions. It is mutated only by the task spawned in
//! [`BoardHandle::spawn`]; everyone else talks to it through the handle and
//! reads [`BoardSnapshot`]s. Network and store I/O never runs inside the
//! task, so a slow CRM call does not block other clients.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::SyncError;
use crate::pipeline::deal::Deal;
use crate::pipeline::employee::{DirectoryEntry, Employee, PlacementState};
use crate::pipeline::grouping::{DealGroup, UngroupableDeal, title_root};
use crate::pipeline::phase::{Phase, PhaseMap};
use crate::pipeline::reconciler::{DragEvent, DragOutcome, DragTracker, Transition, apply_transition};
use crate::pipeline::row::{GroupKey, RowKey};
use crate::pipeline::sync::SyncReport;

const COMMAND_BUFFER: usize = 64;

/// CRM field layout the board needs to interpret deals.
#[derive(Debug, Clone, Default)]
pub struct BoardRules {
    pub phases: PhaseMap,
    pub grouping_field_id: String,
    pub assignee_field_id: String,
}

// ==================== Snapshot DTOs ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealView {
    pub id: String,
    pub title: String,
    pub phase: Option<Phase>,
    pub assignee: Option<String>,
    pub probability: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpportunityView {
    pub key: GroupKey,
    pub title: String,
    pub company: String,
    pub closing_date: String,
    pub deals: Vec<DealView>,
    /// One row per phase, in pipeline order.
    pub rows: Vec<RowKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeView {
    pub id: String,
    pub name: String,
    pub email: String,
    pub title: String,
    pub city: String,
    pub status: String,
    pub photo: Option<String>,
    pub rows: Vec<RowKey>,
    pub deals: Vec<String>,
    pub version: u64,
}

impl From<&Employee> for EmployeeView {
    fn from(e: &Employee) -> Self {
        Self {
            id: e.id.clone(),
            name: e.name.clone(),
            email: e.email.clone(),
            title: e.field_or_na("title").to_string(),
            city: e.field_or_na("city").to_string(),
            status: e.field_or_na("status").to_string(),
            photo: e.photo.clone(),
            rows: e.rows.clone(),
            deals: e.deals.clone(),
            version: e.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardSnapshot {
    /// Bumped on every mutation.
    pub revision: u64,
    pub phases: Vec<Phase>,
    pub opportunities: Vec<OpportunityView>,
    pub ungroupable: Vec<UngroupableDeal>,
    pub employees: Vec<EmployeeView>,
}

/// Everything the sync step needs, captured at the moment of the drop.
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub transition: Transition,
    /// Employee after the transition, still carrying the loaded version.
    pub employee: Employee,
    pub group: Option<DealGroup>,
    /// Member deals of `group` by id.
    pub deals: HashMap<String, Deal>,
}

#[derive(Debug, Clone)]
pub struct DragResult {
    pub outcome: DragOutcome,
    pub pending: Option<PendingSync>,
    pub revision: u64,
}

// ==================== Board ====================

#[derive(Debug, Default)]
pub struct Board {
    rules: BoardRules,
    deals: HashMap<String, Deal>,
    groups: Vec<DealGroup>,
    ungroupable: Vec<UngroupableDeal>,
    employees: Vec<Employee>,
    tracker: DragTracker,
    revision: u64,
}

impl Board {
    pub fn new(rules: BoardRules) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn employee(&self, id: &str) -> Option<&Employee> {
        self.employees.iter().find(|e| e.id == id)
    }

    pub fn group(&self, key: &GroupKey) -> Option<&DealGroup> {
        self.groups.iter().find(|g| &g.key == key)
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let opportunities = self
            .groups
            .iter()
            .map(|group| self.opportunity_view(group))
            .collect();
        BoardSnapshot {
            revision: self.revision,
            phases: Phase::ALL.to_vec(),
            opportunities,
            ungroupable: self.ungroupable.clone(),
            employees: self.employees.iter().map(EmployeeView::from).collect(),
        }
    }

    fn opportunity_view(&self, group: &DealGroup) -> OpportunityView {
        let members: Vec<&Deal> = group
            .member_ids
            .iter()
            .filter_map(|id| self.deals.get(id))
            .collect();
        let first = members.first();
        OpportunityView {
            key: group.key.clone(),
            title: first
                .map(|d| title_root(&d.title))
                .unwrap_or_else(|| "N/A".to_string()),
            company: first
                .and_then(|d| d.company_label())
                .unwrap_or("N/A")
                .to_string(),
            closing_date: first
                .map(|d| d.closing_date_label())
                .unwrap_or_else(|| "no date".to_string()),
            deals: members
                .iter()
                .map(|d| DealView {
                    id: d.id.clone(),
                    title: d.title.clone(),
                    phase: d
                        .phase_id
                        .as_deref()
                        .and_then(|id| self.rules.phases.phase_for(id)),
                    assignee: d.custom_field_text(&self.rules.assignee_field_id),
                    probability: d.estimated_probability,
                })
                .collect(),
            rows: Phase::ALL
                .iter()
                .map(|p| RowKey::placement(group.key.clone(), *p))
                .collect(),
        }
    }

    /// Replace the deal listing and groups, then re-derive placements.
    /// Returns placements whose rows changed and should be persisted.
    pub fn load_deals(
        &mut self,
        deals: Vec<Deal>,
        groups: Vec<DealGroup>,
        ungroupable: Vec<UngroupableDeal>,
    ) -> Vec<PlacementState> {
        self.deals = deals.into_iter().map(|d| (d.id.clone(), d)).collect();
        self.groups = groups;
        self.ungroupable = ungroupable;
        self.bump();
        self.reconcile_placements()
    }

    /// Replace the employee list from fresh directory entries and stored
    /// placements. Returns placements whose rows changed.
    pub fn load_employees(
        &mut self,
        entries: Vec<DirectoryEntry>,
        placements: Vec<PlacementState>,
    ) -> Vec<PlacementState> {
        let mut by_id: HashMap<String, PlacementState> = placements
            .into_iter()
            .map(|p| (p.employee_id.clone(), p))
            .collect();
        self.employees = entries
            .into_iter()
            .map(|entry| {
                let placement = by_id.remove(&entry.id);
                Employee::merge(entry, placement)
            })
            .collect();
        if !by_id.is_empty() {
            tracing::debug!(
                "{} stored placements have no directory entry",
                by_id.len()
            );
        }
        self.bump();
        self.reconcile_placements()
    }

    /// Overwrite placement state of known employees with stored records.
    pub fn reload_placements(&mut self, placements: Vec<PlacementState>) {
        for placement in placements {
            if let Some(employee) = self
                .employees
                .iter_mut()
                .find(|e| e.id == placement.employee_id)
            {
                employee.rows = placement.rows;
                employee.deals = placement.deal_ids;
                employee.version = placement.version;
                employee.normalize_rows();
            }
        }
        self.bump();
    }

    /// The CRM is authoritative for phase: a row whose owned deal sits in a
    /// different phase is moved to that phase.
    pub fn reconcile_placements(&mut self) -> Vec<PlacementState> {
        let mut changed = Vec::new();
        for employee in &mut self.employees {
            let mut touched = false;
            for deal_id in employee.deals.clone() {
                let Some(phase) = self
                    .deals
                    .get(&deal_id)
                    .and_then(|d| d.phase_id.as_deref())
                    .and_then(|id| self.rules.phases.phase_for(id))
                else {
                    continue;
                };
                let Some(group) = self.groups.iter().find(|g| g.contains(&deal_id)) else {
                    continue;
                };
                let Some(current) = employee.placement_in(&group.key).cloned() else {
                    continue;
                };
                if current.phase() != Some(phase) {
                    tracing::debug!(
                        "Employee {} row {} follows deal {} to {}",
                        employee.id,
                        current,
                        deal_id,
                        phase
                    );
                    employee.replace_placement(&current, RowKey::placement(group.key.clone(), phase));
                    touched = true;
                }
            }
            if touched {
                changed.push(employee.placement_state());
            }
        }
        if !changed.is_empty() {
            self.bump();
        }
        changed
    }

    /// Feed one drag event. Accepted drops are applied to the in-memory
    /// employee immediately; the returned [`PendingSync`] carries what the
    /// CRM and store writes need.
    pub fn handle_drag(&mut self, client_id: &str, event: DragEvent) -> DragResult {
        let employees = &self.employees;
        let outcome = self
            .tracker
            .handle(client_id, event, |id| employees.iter().find(|e| e.id == id));

        let Some(transition) = outcome.transition().cloned() else {
            return DragResult {
                outcome,
                pending: None,
                revision: self.revision,
            };
        };

        let group_key = transition.to.group().or(transition.from.group()).cloned();
        let group = group_key.as_ref().and_then(|k| self.group(k)).cloned();
        let leaving_ids = transition
            .from
            .group()
            .and_then(|k| self.group(k))
            .map(|g| g.member_ids.clone())
            .unwrap_or_default();
        let member_deals: HashMap<String, Deal> = group
            .iter()
            .flat_map(|g| g.member_ids.iter())
            .filter_map(|id| self.deals.get(id).map(|d| (id.clone(), d.clone())))
            .collect();

        let Some(employee) = self
            .employees
            .iter_mut()
            .find(|e| e.id == transition.employee_id)
        else {
            return DragResult {
                outcome,
                pending: None,
                revision: self.revision,
            };
        };
        apply_transition(employee, &transition, &leaving_ids);
        let employee = employee.clone();
        self.bump();

        tracing::info!(
            "Employee {} {:?} {} -> {}",
            transition.employee_id,
            transition.kind,
            transition.from,
            transition.to
        );

        DragResult {
            outcome,
            pending: Some(PendingSync {
                transition,
                employee,
                group,
                deals: member_deals,
            }),
            revision: self.revision,
        }
    }

    /// Record the store's view after a successful sync.
    pub fn apply_synced(&mut self, report: &SyncReport) {
        if let Some(employee) = self
            .employees
            .iter_mut()
            .find(|e| e.id == report.placement.employee_id)
        {
            employee.version = report.placement.version;
            for id in &report.placement.deal_ids {
                employee.add_deal(id);
            }
        }
        if let Some(updated) = &report.group {
            match self.groups.iter_mut().find(|g| g.key == updated.key) {
                Some(group) => *group = updated.clone(),
                None => self.groups.push(updated.clone()),
            }
        }
        self.bump();
    }
}

// ==================== Coordinator ====================

enum Command {
    Snapshot(oneshot::Sender<BoardSnapshot>),
    LoadDeals {
        deals: Vec<Deal>,
        groups: Vec<DealGroup>,
        ungroupable: Vec<UngroupableDeal>,
        reply: oneshot::Sender<Vec<PlacementState>>,
    },
    LoadEmployees {
        entries: Vec<DirectoryEntry>,
        placements: Vec<PlacementState>,
        reply: oneshot::Sender<Vec<PlacementState>>,
    },
    ReloadPlacements {
        placements: Vec<PlacementState>,
        reply: oneshot::Sender<()>,
    },
    Drag {
        client_id: String,
        event: DragEvent,
        reply: oneshot::Sender<DragResult>,
    },
    ApplySynced {
        report: SyncReport,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front for the board task.
#[derive(Clone)]
pub struct BoardHandle {
    tx: mpsc::Sender<Command>,
}

impl BoardHandle {
    /// Move `board` into its own task and return a handle to it.
    pub fn spawn(mut board: Board) -> Self {
        let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                board.dispatch(command);
            }
            tracing::debug!("Board coordinator stopped");
        });
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SyncError::CoordinatorClosed)?;
        rx.await.map_err(|_| SyncError::CoordinatorClosed)
    }

    pub async fn snapshot(&self) -> Result<BoardSnapshot, SyncError> {
        self.request(Command::Snapshot).await
    }

    pub async fn load_deals(
        &self,
        deals: Vec<Deal>,
        groups: Vec<DealGroup>,
        ungroupable: Vec<UngroupableDeal>,
    ) -> Result<Vec<PlacementState>, SyncError> {
        self.request(|reply| Command::LoadDeals {
            deals,
            groups,
            ungroupable,
            reply,
        })
        .await
    }

    pub async fn load_employees(
        &self,
        entries: Vec<DirectoryEntry>,
        placements: Vec<PlacementState>,
    ) -> Result<Vec<PlacementState>, SyncError> {
        self.request(|reply| Command::LoadEmployees {
            entries,
            placements,
            reply,
        })
        .await
    }

    pub async fn reload_placements(&self, placements: Vec<PlacementState>) -> Result<(), SyncError> {
        self.request(|reply| Command::ReloadPlacements { placements, reply })
            .await
    }

    pub async fn drag(&self, client_id: &str, event: DragEvent) -> Result<DragResult, SyncError> {
        let client_id = client_id.to_string();
        self.request(|reply| Command::Drag {
            client_id,
            event,
            reply,
        })
        .await
    }

    pub async fn apply_synced(&self, report: SyncReport) -> Result<(), SyncError> {
        self.request(|reply| Command::ApplySynced { report, reply })
            .await
    }
}

impl Board {
    fn dispatch(&mut self, command: Command) {
        // A dropped receiver means the caller gave up; nothing to do.
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::LoadDeals {
                deals,
                groups,
                ungroupable,
                reply,
            } => {
                let _ = reply.send(self.load_deals(deals, groups, ungroupable));
            }
            Command::LoadEmployees {
                entries,
                placements,
                reply,
            } => {
                let _ = reply.send(self.load_employees(entries, placements));
            }
            Command::ReloadPlacements { placements, reply } => {
                self.reload_placements(placements);
                let _ = reply.send(());
            }
            Command::Drag {
                client_id,
                event,
                reply,
            } => {
                let _ = reply.send(self.handle_drag(&client_id, event));
            }
            Command::ApplySynced { report, reply } => {
                self.apply_synced(&report);
                let _ = reply.send(());
            }
        }
    }
}
