//! On-disk settings.
//!
//! Everything here is optional; unset values fall back to the defaults
//! below and every key can be overridden from the environment when the
//! settings are resolved into [`crate::config::Config`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub teamleader: TeamleaderSettings,
    pub graph: GraphSettings,
    pub store: StoreSettings,
    pub mail: MailSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: String,
    /// Bug reports accepted per window.
    pub bug_report_limit: u64,
    pub bug_report_window_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            bug_report_limit: 5,
            bug_report_window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamleaderSettings {
    pub api_url: String,
    pub auth_url: String,
    pub client_id: Option<String>,
    pub redirect_uri: String,
    pub grouping_field_id: Option<String>,
    pub assignee_field_id: Option<String>,
    pub page_size: u32,
    /// CRM phase id per board phase, keyed by `opportunities`, `proposed`,
    /// `interview`, `retained` and `non_retained`.
    pub phases: BTreeMap<String, String>,
}

impl Default for TeamleaderSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.focus.teamleader.eu".to_string(),
            auth_url: "https://focus.teamleader.eu".to_string(),
            client_id: None,
            redirect_uri: "http://127.0.0.1:3000/auth/teamleader/callback".to_string(),
            grouping_field_id: None,
            assignee_field_id: None,
            page_size: 100,
            phases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub api_url: String,
    pub site_id: Option<String>,
    pub list_id: Option<String>,
    pub status_filter: Option<String>,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            api_url: "https://graph.microsoft.com/v1.0".to_string(),
            site_id: None,
            list_id: None,
            status_filter: Some("Active".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: String,
    pub libsql_path: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            libsql_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub smtp_host: Option<String>,
    pub smtp_user: Option<String>,
    pub from: String,
    pub bug_report_to: Option<String>,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_user: None,
            from: "pipeboard@localhost".to_string(),
            bug_report_to: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        Self::from_toml(&raw).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }
}
