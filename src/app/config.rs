//! Environment-sourced configuration plus the hub's
//! construction settings.

use std::env;
use std::str::FromStr;

/// `EXH_LOG_LEVEL` values recognized by the crate's tracing bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Reads `EXH_LOG_LEVEL`, defaulting to `info` on absence or an
    /// unrecognized value.
    pub fn from_env() -> Self {
        env::var("EXH_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

/// `true` if `EH_LOG_HTTP_ERROR_BODY=1`: disables the 2048-byte error-body
/// truncation.
pub fn http_error_body_untruncated() -> bool {
    env::var("EH_LOG_HTTP_ERROR_BODY").as_deref() == Ok("1")
}

/// API key/secret pair used for WS auth and REST signing.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Reads `BITMEX_API_KEY`/`BITMEX_API_SECRET`. Returns `None` if either
    /// is unset — a hub may still be constructed without credentials, but
    /// authenticated operations will fail locally.
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("BITMEX_API_KEY").ok()?;
        let api_secret = env::var("BITMEX_API_SECRET").ok()?;
        Some(Self { api_key, api_secret })
    }
}

/// Hub construction settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub is_test: bool,
    pub credentials: Option<Credentials>,
    pub symbol_mapping_enabled: bool,
    pub auth_expires_skew_sec: i64,
}

const DEFAULT_AUTH_EXPIRES_SKEW_SEC: i64 = 60;

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            is_test: true,
            credentials: None,
            symbol_mapping_enabled: true,
            auth_expires_skew_sec: DEFAULT_AUTH_EXPIRES_SKEW_SEC,
        }
    }
}

impl HubSettings {
    /// Builds settings from the recognized environment variables, falling
    /// back to the documented defaults.
    pub fn from_env() -> Self {
        let auth_expires_skew_sec = env::var("BITMEX_AUTH_EXPIRES_SKEW_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_AUTH_EXPIRES_SKEW_SEC);

        Self {
            is_test: true,
            credentials: Credentials::from_env(),
            symbol_mapping_enabled: true,
            auth_expires_skew_sec,
        }
    }

    pub fn env(&self) -> &'static str {
        if self.is_test {
            "testnet"
        } else {
            "mainnet"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(LogLevel::Info.as_filter_str(), "info");
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
    }

    #[test]
    fn hub_settings_default_skew_matches_spec() {
        let settings = HubSettings {
            credentials: None,
            ..HubSettings::default()
        };
        assert_eq!(settings.auth_expires_skew_sec, 60);
        assert_eq!(settings.env(), "testnet");
    }
}
