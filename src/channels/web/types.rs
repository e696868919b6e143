//! Request and response DTOs for the board API.

use serde::{Deserialize, Serialize};

use crate::pipeline::reconciler::{DragEvent, Notification};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub channel: &'static str,
    pub uptime_secs: u64,
    pub crm_connected: bool,
}

/// One pointer event from a board client. `client_id` separates concurrent
/// drags from different browser tabs.
#[derive(Debug, Deserialize)]
pub struct DragRequest {
    pub client_id: String,
    pub event: DragEvent,
}

/// Body returned when a legal drop could not be written through.
#[derive(Debug, Serialize)]
pub struct DragFailure {
    pub status: &'static str,
    pub notification: Notification,
}

#[derive(Debug, Serialize)]
pub struct BugReportResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}
