//! Entry points used by the gateway: refresh from the upstream systems and
//! run drag events through reconcile, sync and refetch.

use std::sync::Arc;

use serde::Serialize;

use crate::crm::CrmApi;
use crate::db::Database;
use crate::directory::DirectoryApi;
use crate::error::{DatabaseError, SyncError};
use crate::pipeline::board::{BoardHandle, BoardRules, BoardSnapshot};
use crate::pipeline::employee::PlacementState;
use crate::pipeline::grouping::{group_deals, merge_with_stored};
use crate::pipeline::reconciler::{DragEvent, DragOutcome, Notification, Transition};
use crate::pipeline::sync::{SyncContext, execute_plan, plan_sync};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DragStatus {
    Pending,
    Cancelled,
    Unchanged,
    Applied,
    Redirected,
    Rejected,
}

impl From<&DragOutcome> for DragStatus {
    fn from(outcome: &DragOutcome) -> Self {
        match outcome {
            DragOutcome::Pending => Self::Pending,
            DragOutcome::Cancelled => Self::Cancelled,
            DragOutcome::Unchanged => Self::Unchanged,
            DragOutcome::Applied(_) => Self::Applied,
            DragOutcome::Redirected { .. } => Self::Redirected,
            DragOutcome::Rejected { .. } => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DragReport {
    pub status: DragStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
    /// Which CRM write was performed, if the drop was synced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_deal_id: Option<String>,
    pub revision: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub revision: u64,
    pub deals: usize,
    pub groups: usize,
    pub ungroupable: usize,
    pub employees: usize,
    /// Placements re-derived from CRM phases and persisted.
    pub rederived: usize,
}

pub struct BoardService {
    board: BoardHandle,
    crm: Arc<dyn CrmApi>,
    directory: Arc<dyn DirectoryApi>,
    store: Arc<dyn Database>,
    rules: BoardRules,
}

impl BoardService {
    pub fn new(
        board: BoardHandle,
        crm: Arc<dyn CrmApi>,
        directory: Arc<dyn DirectoryApi>,
        store: Arc<dyn Database>,
        rules: BoardRules,
    ) -> Self {
        Self {
            board,
            crm,
            directory,
            store,
            rules,
        }
    }

    pub fn board(&self) -> &BoardHandle {
        &self.board
    }

    pub async fn snapshot(&self) -> Result<BoardSnapshot, SyncError> {
        self.board.snapshot().await
    }

    /// Refetch all deals, regroup them and cache new memberships.
    pub async fn refresh_deals(&self) -> Result<RefreshSummary, SyncError> {
        let deals = self.crm.deals_list().await?;
        let outcome = group_deals(&deals, &self.rules.grouping_field_id);
        let stored = self.store.list_deal_groups().await?;
        let mut merged = merge_with_stored(outcome.groups, &stored);

        for pending in &merged.pending_upserts {
            let saved = self.store.upsert_deal_group(pending).await?;
            if let Some(group) = merged.groups.iter_mut().find(|g| g.key == saved.key) {
                *group = saved;
            }
        }

        let summary = RefreshSummary {
            deals: deals.len(),
            groups: merged.groups.len(),
            ungroupable: outcome.ungroupable.len(),
            ..RefreshSummary::default()
        };
        tracing::info!(
            "Loaded {} deals into {} opportunities ({} ungroupable, {} groups cached)",
            summary.deals,
            summary.groups,
            summary.ungroupable,
            merged.pending_upserts.len()
        );

        let changed = self
            .board
            .load_deals(deals, merged.groups, outcome.ungroupable)
            .await?;
        let rederived = self.persist_rederived(changed).await?;
        let revision = self.board.snapshot().await?.revision;
        Ok(RefreshSummary {
            rederived,
            revision,
            ..summary
        })
    }

    /// Refetch the consultant list with avatars and merge stored placements.
    pub async fn refresh_employees(&self) -> Result<RefreshSummary, SyncError> {
        let mut entries = self.directory.list_employees().await?;
        match self.directory.fetch_photos(&entries).await {
            Ok(mut photos) => {
                for entry in &mut entries {
                    entry.photo = photos.remove(&entry.id);
                }
            }
            Err(e) => tracing::warn!("Avatar fetch failed, continuing without photos: {}", e),
        }
        let placements = self.store.list_placements().await?;
        let employees = entries.len();
        let changed = self.board.load_employees(entries, placements).await?;
        let rederived = self.persist_rederived(changed).await?;
        let revision = self.board.snapshot().await?.revision;
        tracing::info!("Loaded {} employees", employees);
        Ok(RefreshSummary {
            employees,
            rederived,
            revision,
            ..RefreshSummary::default()
        })
    }

    /// Reload every stored placement into the board.
    pub async fn reload_placements(&self) -> Result<(), SyncError> {
        let placements = self.store.list_placements().await?;
        self.board.reload_placements(placements).await
    }

    /// Save rows the board re-derived from CRM phases. A version conflict
    /// means someone else already wrote; the stored record wins.
    async fn persist_rederived(&self, changed: Vec<PlacementState>) -> Result<usize, SyncError> {
        let mut saved = Vec::with_capacity(changed.len());
        for placement in changed {
            match self.store.save_placement(&placement).await {
                Ok(state) => saved.push(state),
                Err(DatabaseError::VersionConflict { id, found, .. }) => {
                    tracing::debug!("Skipping re-derived placement of {} (store at {})", id, found);
                    if let Some(current) = self.store.get_placement(&id).await? {
                        saved.push(current);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        let count = saved.len();
        if count > 0 {
            self.board.reload_placements(saved).await?;
        }
        Ok(count)
    }

    /// Feed one drag event. A legal drop is applied on the board at once and
    /// then written through to the CRM and the store; on success the deal
    /// list is refetched.
    ///
    /// Failed writes are not rolled back on the board. A stale version
    /// reloads placements from the store before the error is returned.
    pub async fn drag(&self, client_id: &str, event: DragEvent) -> Result<DragReport, SyncError> {
        let result = self.board.drag(client_id, event).await?;
        let mut report = DragReport {
            status: DragStatus::from(&result.outcome),
            notification: result.outcome.notification(),
            transition: result.outcome.transition().cloned(),
            plan: None,
            created_deal_id: None,
            revision: result.revision,
        };

        let Some(pending) = result.pending else {
            return Ok(report);
        };

        let ctx = SyncContext {
            phases: &self.rules.phases,
            assignee_field_id: &self.rules.assignee_field_id,
        };
        let synced = async {
            let plan = plan_sync(
                &pending.transition,
                &pending.employee,
                pending.group.as_ref(),
                &pending.deals,
                ctx,
            )?;
            let sync_report = execute_plan(
                self.crm.as_ref(),
                self.store.as_ref(),
                &plan,
                &pending.employee,
                pending.group.as_ref(),
            )
            .await?;
            Ok::<_, SyncError>((plan, sync_report))
        }
        .await;

        let (plan, sync_report) = match synced {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!("Sync for {} failed: {}", pending.employee.id, e);
                if matches!(e, SyncError::StaleVersion(_))
                    && let Err(reload) = self.reload_placements().await
                {
                    tracing::error!("Reloading placements failed: {}", reload);
                }
                return Err(e);
            }
        };

        report.plan = Some(plan.label());
        report.created_deal_id = sync_report.created_deal_id.clone();
        self.board.apply_synced(sync_report).await?;

        match self.refresh_deals().await {
            Ok(summary) => report.revision = summary.revision,
            Err(e) => tracing::warn!("Refetch after sync failed, board may lag the CRM: {}", e),
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use crate::directory::DirectoryApi;
    use crate::error::DirectoryError;
    use crate::pipeline::employee::DirectoryEntry;

    #[derive(Default)]
    pub struct FakeDirectory {
        pub entries: Vec<DirectoryEntry>,
        pub photos: HashMap<String, String>,
    }

    #[async_trait]
    impl DirectoryApi for FakeDirectory {
        async fn list_employees(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
            Ok(self.entries.clone())
        }

        async fn fetch_photos(
            &self,
            _employees: &[DirectoryEntry],
        ) -> Result<HashMap<String, String>, DirectoryError> {
            Ok(self.photos.clone())
        }
    }
}
