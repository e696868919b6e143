use secrecy::SecretString;

use crate::config::helpers::{
    optional_env, optional_secret_env, parse_optional_env, parse_string_env, parse_u64_env,
    required,
};
use crate::error::ConfigError;
use crate::pipeline::phase::{Phase, PhaseMap};
use crate::settings::Settings;

/// Teamleader API access and the field layout of the deals board.
#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub api_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    /// Custom field whose value separates otherwise identical deals.
    pub grouping_field_id: String,
    /// Custom field holding the consultant's email address.
    pub assignee_field_id: String,
    pub phases: PhaseMap,
    pub page_size: u32,
}

/// SharePoint consultant list behind Microsoft Graph.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub api_url: String,
    pub site_id: String,
    pub list_id: String,
    pub access_token: SecretString,
    pub status_filter: Option<String>,
}

impl CrmConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let tl = &settings.teamleader;

        let mut entries = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            let key = format!("TEAMLEADER_PHASE_{}", phase.env_suffix());
            let from_settings = tl.phases.get(&phase.env_suffix().to_ascii_lowercase()).cloned();
            let id = required(
                &key,
                parse_optional_env(&key, from_settings)?,
                "CRM deal-phase id for this board column",
            )?;
            entries.push((phase, id));
        }

        let page_size = parse_u64_env("TEAMLEADER_PAGE_SIZE", u64::from(tl.page_size))?;
        let page_size = u32::try_from(page_size)
            .ok()
            .filter(|size| (1..=100).contains(size))
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "TEAMLEADER_PAGE_SIZE".to_string(),
                message: "must be between 1 and 100".to_string(),
            })?;

        Ok(Self {
            api_url: parse_string_env("TEAMLEADER_API_URL", tl.api_url.clone())?,
            auth_url: parse_string_env("TEAMLEADER_AUTH_URL", tl.auth_url.clone())?,
            client_id: required(
                "TEAMLEADER_CLIENT_ID",
                parse_optional_env("TEAMLEADER_CLIENT_ID", tl.client_id.clone())?,
                "OAuth client id of the Teamleader integration",
            )?,
            client_secret: SecretString::from(required(
                "TEAMLEADER_CLIENT_SECRET",
                optional_env("TEAMLEADER_CLIENT_SECRET")?,
                "OAuth client secret, environment only",
            )?),
            redirect_uri: parse_string_env("TEAMLEADER_REDIRECT_URI", tl.redirect_uri.clone())?,
            grouping_field_id: required(
                "TEAMLEADER_GROUPING_FIELD_ID",
                parse_optional_env("TEAMLEADER_GROUPING_FIELD_ID", tl.grouping_field_id.clone())?,
                "custom field id used to group deals",
            )?,
            assignee_field_id: required(
                "TEAMLEADER_ASSIGNEE_FIELD_ID",
                parse_optional_env("TEAMLEADER_ASSIGNEE_FIELD_ID", tl.assignee_field_id.clone())?,
                "custom field id holding the consultant email",
            )?,
            phases: PhaseMap::new(entries),
            page_size,
        })
    }
}

impl DirectoryConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let graph = &settings.graph;
        Ok(Self {
            api_url: parse_string_env("GRAPH_API_URL", graph.api_url.clone())?,
            site_id: required(
                "GRAPH_SITE_ID",
                parse_optional_env("GRAPH_SITE_ID", graph.site_id.clone())?,
                "SharePoint site holding the consultant list",
            )?,
            list_id: required(
                "GRAPH_LIST_ID",
                parse_optional_env("GRAPH_LIST_ID", graph.list_id.clone())?,
                "SharePoint list of consultants",
            )?,
            access_token: optional_secret_env("GRAPH_ACCESS_TOKEN")?.ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "GRAPH_ACCESS_TOKEN".to_string(),
                    hint: "Graph bearer token, environment only".to_string(),
                }
            })?,
            status_filter: parse_optional_env("GRAPH_STATUS_FILTER", graph.status_filter.clone())?,
        })
    }
}
