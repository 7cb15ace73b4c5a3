//! Application configuration
//!
//! Settings are read from `configs/config.{toml,yaml,json}` and can be
//! overridden from the environment (`GOMOBILE_SIPSERVER__PORT=5070`). The
//! key layout mirrors the deployment config files:
//!
//! ```toml
//! [sipserver]
//! port = 5060
//! [sipserver.acl]
//! ip = ["10.0.0.7", "10.0.0.8"]
//! [webserver]
//! port = 8080
//! [logging]
//! directory = "logs"
//! retain_days = 7
//! [data.policy]
//! policy_dir = "data/policy"
//! [data.fnm]
//! fnm_dir = "data/fnm"
//! api = "http://fnm.internal/export"
//! [flags]
//! debug = false
//! ```

use serde::Deserialize;

use crate::error::{GoMobileError, GoMobileResult};

/// Top-level application settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub sipserver: SipServerSettings,
    pub webserver: WebServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    pub data: DataSettings,
    #[serde(default)]
    pub flags: FlagSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SipServerSettings {
    /// UDP bind port for the SIP listener
    pub port: u16,
    #[serde(default)]
    pub acl: AclSettings,
}

/// Source-IP allow-list. Peers whose host is not listed verbatim are
/// answered with 603 Decline before any handler runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AclSettings {
    #[serde(default)]
    pub ip: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebServerSettings {
    /// HTTP simulation endpoint port
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_directory")]
    pub directory: String,
    #[serde(default = "default_retain_days")]
    pub retain_days: i64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            directory: default_log_directory(),
            retain_days: default_retain_days(),
        }
    }
}

fn default_log_directory() -> String {
    "logs".to_string()
}

fn default_retain_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSettings {
    pub policy: PolicyDataSettings,
    pub fnm: FnmDataSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDataSettings {
    /// Directory holding the rule CSV files; the lexically latest wins
    pub policy_dir: String,
}

/// FNM ingestion format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FnmFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FnmDataSettings {
    /// Directory holding FNM snapshot files; the lexically latest wins
    pub fnm_dir: String,
    /// HTTP endpoint used when no local snapshot loads
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub format: FnmFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagSettings {
    /// Elevates log verbosity to DEBUG
    #[serde(default)]
    pub debug: bool,
}

impl Settings {
    /// Load settings from `<config_dir>/config.*` plus environment overrides.
    ///
    /// A missing or unreadable config file is fatal at startup.
    pub fn load(config_dir: &str) -> GoMobileResult<Settings> {
        let path = format!("{}/config", config_dir);
        let raw = config::Config::builder()
            .add_source(config::File::with_name(&path))
            .add_source(
                config::Environment::with_prefix("GOMOBILE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GoMobileError::config_error(&path, e.to_string()))?;

        let settings: Settings = raw
            .try_deserialize()
            .map_err(|e| GoMobileError::config_error(&path, e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> GoMobileResult<()> {
        if self.sipserver.port == 0 {
            return Err(GoMobileError::config_error("sipserver.port", "must be non-zero"));
        }
        if self.data.policy.policy_dir.is_empty() {
            return Err(GoMobileError::config_error("data.policy.policy_dir", "must be set"));
        }
        if self.data.fnm.fnm_dir.is_empty() {
            return Err(GoMobileError::config_error("data.fnm.fnm_dir", "must be set"));
        }
        Ok(())
    }
}
