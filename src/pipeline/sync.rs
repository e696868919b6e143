//! Mirror accepted board moves into the CRM and the document store.
//!
//! Planning is pure: [`plan_sync`] looks at the transition, the employee
//! and the opportunity's member deals and decides which single CRM write is
//! needed. [`execute_plan`] performs it and then persists the placement
//! with a versioned write.

use std::collections::HashMap;

use crate::crm::{CrmApi, DealUpdate};
use crate::db::Database;
use crate::error::{DatabaseError, SyncError};
use crate::pipeline::deal::{CustomFieldValue, Deal, NewDeal};
use crate::pipeline::employee::{Employee, PlacementState};
use crate::pipeline::grouping::DealGroup;
use crate::pipeline::phase::PhaseMap;
use crate::pipeline::reconciler::{Transition, TransitionKind};

/// CRM field rules needed to plan a write.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext<'a> {
    pub phases: &'a PhaseMap,
    pub assignee_field_id: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncPlan {
    /// Placement changed but the CRM already reflects it. `deal_id` is the
    /// employee's deal in the opportunity, recorded so later refetches can
    /// follow its phase.
    Nothing { deal_id: Option<String> },
    /// Placement dropped back on the pool; store only.
    ForgetPlacement,
    /// No deal of this employee in the opportunity yet. The template is
    /// re-read from the CRM before it is cloned.
    CreateDeal {
        template_id: String,
        phase_id: String,
        field_id: String,
        email: String,
        name: String,
    },
    MoveDeal { deal_id: String, phase_id: String },
    /// Deal is at the right phase but carries someone else's address.
    UpdateAssignee {
        deal_id: String,
        field_id: String,
        email: String,
    },
}

impl SyncPlan {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Nothing { .. } => "nothing",
            Self::ForgetPlacement => "forget_placement",
            Self::CreateDeal { .. } => "create_deal",
            Self::MoveDeal { .. } => "move_deal",
            Self::UpdateAssignee { .. } => "update_assignee",
        }
    }
}

/// The employee's deal inside `group`: one recorded against the employee,
/// or failing that one whose assignee field carries their address.
fn owned_deal<'a>(
    employee: &Employee,
    group: &DealGroup,
    deals: &'a HashMap<String, Deal>,
    assignee_field_id: &str,
) -> Option<&'a Deal> {
    employee
        .deal_in(&group.member_ids)
        .and_then(|id| deals.get(id))
        .or_else(|| {
            group
                .member_ids
                .iter()
                .filter_map(|id| deals.get(id))
                .find(|d| d.is_assigned_to(assignee_field_id, &employee.email))
        })
}

/// Decide the CRM write for `transition`.
///
/// `group` is the opportunity the employee lands in (or leaves, for a
/// removal) and `deals` the current CRM listing by id.
pub fn plan_sync(
    transition: &Transition,
    employee: &Employee,
    group: Option<&DealGroup>,
    deals: &HashMap<String, Deal>,
    ctx: SyncContext<'_>,
) -> Result<SyncPlan, SyncError> {
    if transition.kind == TransitionKind::Remove {
        return Ok(SyncPlan::ForgetPlacement);
    }

    let (Some(group_key), Some(phase)) = (transition.to.group(), transition.new_phase()) else {
        return Ok(SyncPlan::Nothing { deal_id: None });
    };
    let group = group.ok_or_else(|| SyncError::MissingGroup(group_key.to_string()))?;
    let phase_id = ctx
        .phases
        .crm_id(phase)
        .ok_or_else(|| SyncError::UnmappedPhase(phase.to_string()))?;

    if let Some(deal) = owned_deal(employee, group, deals, ctx.assignee_field_id) {
        if deal.phase_id.as_deref() != Some(phase_id) {
            return Ok(SyncPlan::MoveDeal {
                deal_id: deal.id.clone(),
                phase_id: phase_id.to_string(),
            });
        }
        if !deal.is_assigned_to(ctx.assignee_field_id, &employee.email) {
            return Ok(SyncPlan::UpdateAssignee {
                deal_id: deal.id.clone(),
                field_id: ctx.assignee_field_id.to_string(),
                email: employee.email.clone(),
            });
        }
        return Ok(SyncPlan::Nothing {
            deal_id: Some(deal.id.clone()),
        });
    }

    let template = group
        .member_ids
        .iter()
        .find_map(|id| deals.get(id))
        .ok_or_else(|| SyncError::MissingGroup(group_key.to_string()))?;
    Ok(SyncPlan::CreateDeal {
        template_id: template.id.clone(),
        phase_id: phase_id.to_string(),
        field_id: ctx.assignee_field_id.to_string(),
        email: employee.email.clone(),
        name: employee.name.clone(),
    })
}

/// What the store holds after a successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub placement: PlacementState,
    /// Group with the freshly created deal appended.
    pub group: Option<DealGroup>,
    pub created_deal_id: Option<String>,
}

fn stale(employee_id: &str) -> impl FnOnce(DatabaseError) -> SyncError + '_ {
    move |e| match e {
        DatabaseError::VersionConflict { .. } => SyncError::StaleVersion(employee_id.to_string()),
        other => SyncError::Database(other),
    }
}

/// Run `plan` against the CRM, then persist the employee's placement.
///
/// `employee` is the in-memory state after the transition, carrying the
/// store version it was loaded with. A mismatch is detected before any CRM
/// write so a stale board never touches the CRM.
pub async fn execute_plan(
    crm: &dyn CrmApi,
    store: &dyn Database,
    plan: &SyncPlan,
    employee: &Employee,
    group: Option<&DealGroup>,
) -> Result<SyncReport, SyncError> {
    let stored_version = store
        .get_placement(&employee.id)
        .await?
        .map(|p| p.version)
        .unwrap_or(0);
    if stored_version != employee.version {
        tracing::info!(
            "Placement of {} moved from version {} to {}, dropping write",
            employee.id,
            employee.version,
            stored_version
        );
        return Err(SyncError::StaleVersion(employee.id.clone()));
    }

    let mut placement = employee.placement_state();
    let mut created_deal_id = None;
    let mut updated_group = None;

    match plan {
        SyncPlan::Nothing { deal_id } => {
            if let Some(deal_id) = deal_id {
                record_deal(&mut placement, deal_id);
            }
        }
        SyncPlan::ForgetPlacement => {}
        SyncPlan::MoveDeal { deal_id, phase_id } => {
            crm.deals_move(deal_id, phase_id).await?;
            record_deal(&mut placement, deal_id);
        }
        SyncPlan::UpdateAssignee {
            deal_id,
            field_id,
            email,
        } => {
            crm.deals_update(&DealUpdate {
                id: deal_id.clone(),
                custom_fields: vec![CustomFieldValue {
                    id: field_id.clone(),
                    value: serde_json::Value::String(email.clone()),
                }],
            })
            .await?;
            record_deal(&mut placement, deal_id);
        }
        SyncPlan::CreateDeal {
            template_id,
            phase_id,
            field_id,
            email,
            name,
        } => {
            let template = crm.deals_info(template_id).await?;
            let deal = NewDeal::cloned_from(&template, phase_id, field_id, email, name);
            let new_id = crm.deals_create(&deal).await?;
            tracing::info!(
                "Created deal {} for {} from template {}",
                new_id,
                employee.id,
                template_id
            );
            record_deal(&mut placement, &new_id);
            if let Some(group) = group {
                updated_group = Some(append_member(store, group, &new_id).await?);
            }
            created_deal_id = Some(new_id);
        }
    }

    let placement = store
        .save_placement(&placement)
        .await
        .map_err(stale(&employee.id))?;
    tracing::debug!(
        "Synced {} for {} at version {}",
        plan.label(),
        employee.id,
        placement.version
    );

    Ok(SyncReport {
        placement,
        group: updated_group,
        created_deal_id,
    })
}

fn record_deal(placement: &mut PlacementState, deal_id: &str) {
    if !placement.deal_ids.iter().any(|d| d == deal_id) {
        placement.deal_ids.push(deal_id.to_string());
    }
}

/// Membership only grows, so losing the version race (or finding the group
/// gone) falls back to a union upsert.
async fn append_member(
    store: &dyn Database,
    group: &DealGroup,
    deal_id: &str,
) -> Result<DealGroup, SyncError> {
    if group.version > 0 {
        match store
            .append_group_member(&group.key, deal_id, group.version)
            .await
        {
            Ok(stored) => return Ok(stored),
            Err(DatabaseError::VersionConflict { found, .. }) => {
                tracing::debug!(
                    "Group {} is at version {}, merging new member instead",
                    group.key,
                    found
                );
            }
            Err(DatabaseError::NotFound { .. }) => {
                tracing::debug!("Group {} not stored yet, creating it", group.key);
            }
            Err(e) => return Err(e.into()),
        }
    }
    let mut with_member = group.clone();
    with_member.member_ids.push(deal_id.to_string());
    Ok(store.upsert_deal_group(&with_member).await?)
}
