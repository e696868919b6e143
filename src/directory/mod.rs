//! Consultant directory (SharePoint list behind Microsoft Graph).

pub mod graph;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::DirectoryError;
use crate::pipeline::employee::DirectoryEntry;

pub use graph::GraphClient;

#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// Active consultants from the directory list.
    async fn list_employees(&self) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    /// Avatar data URIs keyed by employee id. Missing photos are simply absent.
    async fn fetch_photos(
        &self,
        employees: &[DirectoryEntry],
    ) -> Result<HashMap<String, String>, DirectoryError>;
}
