use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub issuer: Option<String>,
    pub logging_level: Option<String>,
    pub kek_env_var: Option<String>,
    pub self_registration_enabled: Option<bool>,
    pub session: Option<SessionConfig>,
    pub otp: Option<OtpFileConfig>,
    pub sweeper: Option<SweeperConfig>,
}

/// Session/refresh-token lifetimes, per cohort. Per-client overrides
/// (`refresh_token_lifetime_seconds`) live on the `Client` row, not here.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub user_session_ttl_secs: Option<u64>,
    pub admin_session_ttl_secs: Option<u64>,
    pub refresh_token_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct OtpFileConfig {
    pub digits: Option<usize>,
    pub step_secs: Option<u64>,
    pub failure_lockout_threshold: Option<u32>,
    pub lockout_base_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
