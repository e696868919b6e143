//! Runtime configuration.
//!
//! [`Settings`] come from an optional TOML file; each section is resolved
//! here with environment overrides (a `.env` file is loaded in `main`).
//! Secrets are only ever read from the environment.

pub(crate) mod helpers;
mod upstream;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::config::helpers::{
    optional_secret_env, parse_optional_env, parse_string_env, parse_u64_env,
};
use crate::error::ConfigError;
use crate::settings::Settings;

pub use upstream::{CrmConfig, DirectoryConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub crm: CrmConfig,
    pub directory: DirectoryConfig,
    pub store: StoreConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Bearer token for the API. Generated at startup when unset.
    pub auth_token: Option<SecretString>,
    pub bug_report_limit: u64,
    pub bug_report_window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    LibSql,
    Memory,
}

impl StoreBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "libsql" | "sqlite" => Ok(Self::LibSql),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "STORE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub libsql_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub smtp_host: Option<String>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<SecretString>,
    pub from: String,
    pub bug_report_to: Option<String>,
}

/// `~/.pipeboard/board.db`, or a relative path when there is no home dir.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pipeboard")
        .join("board.db")
}

fn validate_url(key: &str, raw: String) -> Result<String, ConfigError> {
    let parsed = url::Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("invalid URL '{raw}': {e}"),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(raw.trim_end_matches('/').to_string())
}

impl GatewayConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let raw = parse_string_env("GATEWAY_BIND", settings.gateway.bind.clone())?;
        let bind = raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: "GATEWAY_BIND".to_string(),
            message: format!("'{raw}' is not a socket address: {e}"),
        })?;
        Ok(Self {
            bind,
            auth_token: optional_secret_env("GATEWAY_AUTH_TOKEN")?,
            bug_report_limit: parse_u64_env(
                "BUG_REPORT_LIMIT",
                settings.gateway.bug_report_limit,
            )?,
            bug_report_window_secs: parse_u64_env(
                "BUG_REPORT_WINDOW_SECS",
                settings.gateway.bug_report_window_secs,
            )?,
        })
    }
}

impl StoreConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend =
            StoreBackend::from_str(&parse_string_env("STORE_BACKEND", settings.store.backend.clone())?)?;
        Ok(Self {
            backend,
            libsql_path: parse_optional_env("STORE_LIBSQL_PATH", settings.store.libsql_path.clone())?
                .map(PathBuf::from),
        })
    }
}

impl MailConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let mail = &settings.mail;
        Ok(Self {
            smtp_host: parse_optional_env("SMTP_HOST", mail.smtp_host.clone())?,
            smtp_user: parse_optional_env("SMTP_USER", mail.smtp_user.clone())?,
            smtp_password: optional_secret_env("SMTP_PASSWORD")?,
            from: parse_string_env("SMTP_FROM", mail.from.clone())?,
            bug_report_to: parse_optional_env("BUG_REPORT_TO", mail.bug_report_to.clone())?,
        })
    }
}

impl Config {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let mut crm = CrmConfig::resolve(settings)?;
        crm.api_url = validate_url("TEAMLEADER_API_URL", crm.api_url)?;
        crm.auth_url = validate_url("TEAMLEADER_AUTH_URL", crm.auth_url)?;
        crm.redirect_uri = validate_url("TEAMLEADER_REDIRECT_URI", crm.redirect_uri)?;
        let mut directory = DirectoryConfig::resolve(settings)?;
        directory.api_url = validate_url("GRAPH_API_URL", directory.api_url)?;

        Ok(Self {
            gateway: GatewayConfig::resolve(settings)?,
            crm,
            directory,
            store: StoreConfig::resolve(settings)?,
            mail: MailConfig::resolve(settings)?,
        })
    }

    /// Load the settings file (if any) and resolve it against the environment.
    pub fn load(settings_path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match settings_path {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        Self::resolve(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_for_local_sections() {
        let settings = Settings::default();
        let gateway = GatewayConfig::resolve(&settings).expect("gateway");
        assert_eq!(gateway.bind.port(), 3000);
        assert_eq!(gateway.bug_report_limit, 5);
        assert_eq!(gateway.bug_report_window_secs, 600);

        let store = StoreConfig::resolve(&settings).expect("store");
        assert_eq!(store.backend, StoreBackend::LibSql);

        let mail = MailConfig::resolve(&settings).expect("mail");
        assert_eq!(mail.from, "pipeboard@localhost");
    }

    #[test]
    fn crm_section_reports_the_first_missing_key() {
        let err = CrmConfig::resolve(&Settings::default()).expect_err("missing phases");
        let ConfigError::MissingRequired { key, .. } = err else {
            panic!("expected MissingRequired");
        };
        assert_eq!(key, "TEAMLEADER_PHASE_OPPORTUNITIES");
    }

    #[test]
    fn unknown_store_backend_is_rejected() {
        let mut settings = Settings::default();
        settings.store.backend = "mongo".to_string();
        let err = StoreConfig::resolve(&settings).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "STORE_BACKEND"));
    }

    #[test]
    fn urls_must_be_http() {
        assert_eq!(
            validate_url("K", "https://api.example.test/".to_string()).expect("valid"),
            "https://api.example.test"
        );
        assert!(validate_url("K", "ftp://example.test".to_string()).is_err());
        assert!(validate_url("K", "not a url".to_string()).is_err());
    }

    #[test]
    fn default_libsql_path_lives_under_dot_dir() {
        let path = default_libsql_path();
        assert!(path.ends_with(".pipeboard/board.db"));
    }
}
