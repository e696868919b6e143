//! Environment lookups shared by the config sections.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read `key` from the environment. Unset and blank values are `None`.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}

/// Environment value, falling back to the settings value when unset.
pub(crate) fn parse_optional_env(
    key: &str,
    default: Option<String>,
) -> Result<Option<String>, ConfigError> {
    Ok(optional_env(key)?.or(default.filter(|v| !v.trim().is_empty())))
}

pub(crate) fn parse_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an unsigned integer: {e}"),
        }),
        None => Ok(default),
    }
}

pub(crate) fn optional_secret_env(key: &str) -> Result<Option<SecretString>, ConfigError> {
    Ok(optional_env(key)?.map(SecretString::from))
}

/// Unwrap a value that has no sensible default.
pub(crate) fn required(key: &str, value: Option<String>, hint: &str) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}
