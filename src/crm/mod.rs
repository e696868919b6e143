//! CRM access.
//!
//! The board only needs five deal operations. They sit behind [`CrmApi`] so
//! the sync logic can run against the Teamleader client in production and an
//! in-memory fake in tests.

pub mod teamleader;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CrmError;
use crate::pipeline::deal::{CustomFieldValue, Deal, NewDeal};

pub use teamleader::TeamleaderClient;

/// Partial update; only custom fields are ever written by the board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealUpdate {
    pub id: String,
    pub custom_fields: Vec<CustomFieldValue>,
}

#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn deals_list(&self) -> Result<Vec<Deal>, CrmError>;
    async fn deals_info(&self, id: &str) -> Result<Deal, CrmError>;
    async fn deals_update(&self, update: &DealUpdate) -> Result<(), CrmError>;
    /// Returns the id of the created deal.
    async fn deals_create(&self, deal: &NewDeal) -> Result<String, CrmError>;
    async fn deals_move(&self, id: &str, phase_id: &str) -> Result<(), CrmError>;
}
