mod file_config;

pub use file_config::{FileConfig, OtpFileConfig, SessionConfig, SweeperConfig};

use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub issuer: Option<String>,
    pub logging_level: RequestsLoggingLevel,
    pub kek_env_var: Option<String>,
    pub self_registration_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub issuer: String,
    pub logging_level: RequestsLoggingLevel,
    pub kek_env_var: Option<String>,
    pub self_registration_enabled: bool,

    pub session: SessionSettings,
    pub otp: OtpSettings,
    pub sweeper: SweeperSettings,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_session_ttl_secs: u64,
    pub admin_session_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            user_session_ttl_secs: 3600,
            admin_session_ttl_secs: 15 * 60,
            refresh_token_ttl_secs: 30 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtpSettings {
    pub digits: usize,
    pub step_secs: u64,
    pub failure_lockout_threshold: u32,
    pub lockout_base_secs: u64,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            digits: 6,
            step_secs: 30,
            failure_lockout_threshold: 10,
            lockout_base_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    pub interval_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);

        let issuer = file
            .issuer
            .or_else(|| cli.issuer.clone())
            .ok_or_else(|| anyhow::anyhow!("issuer must be specified via --issuer or in config file"))?;

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let kek_env_var = file.kek_env_var.or_else(|| cli.kek_env_var.clone());

        let self_registration_enabled = file
            .self_registration_enabled
            .unwrap_or(cli.self_registration_enabled);

        let session_file = file.session.unwrap_or_default();
        let session_defaults = SessionSettings::default();
        let session = SessionSettings {
            user_session_ttl_secs: session_file
                .user_session_ttl_secs
                .unwrap_or(session_defaults.user_session_ttl_secs),
            admin_session_ttl_secs: session_file
                .admin_session_ttl_secs
                .unwrap_or(session_defaults.admin_session_ttl_secs),
            refresh_token_ttl_secs: session_file
                .refresh_token_ttl_secs
                .unwrap_or(session_defaults.refresh_token_ttl_secs),
        };

        let otp_file = file.otp.unwrap_or_default();
        let otp_defaults = OtpSettings::default();
        let otp = OtpSettings {
            digits: otp_file.digits.unwrap_or(otp_defaults.digits),
            step_secs: otp_file.step_secs.unwrap_or(otp_defaults.step_secs),
            failure_lockout_threshold: otp_file
                .failure_lockout_threshold
                .unwrap_or(otp_defaults.failure_lockout_threshold),
            lockout_base_secs: otp_file
                .lockout_base_secs
                .unwrap_or(otp_defaults.lockout_base_secs),
        };

        let sweeper_file = file.sweeper.unwrap_or_default();
        let sweeper = SweeperSettings {
            interval_secs: sweeper_file
                .interval_secs
                .unwrap_or(SweeperSettings::default().interval_secs),
        };

        Ok(Self {
            db_dir,
            port,
            issuer,
            logging_level,
            kek_env_var,
            self_registration_enabled,
            session,
            otp,
            sweeper,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir.join("darkauth.db")
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_parse_logging_level() {
        assert!(matches!(
            parse_logging_level("none"),
            Some(RequestsLoggingLevel::None)
        ));
        assert!(matches!(
            parse_logging_level("path"),
            Some(RequestsLoggingLevel::Path)
        ));
        assert!(parse_logging_level("invalid").is_none());
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            port: 3001,
            issuer: Some("https://auth.example.com".to_string()),
            logging_level: RequestsLoggingLevel::Headers,
            kek_env_var: Some("DARKAUTH_KEK".to_string()),
            self_registration_enabled: true,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 3001);
        assert_eq!(config.issuer, "https://auth.example.com");
        assert_eq!(config.logging_level, RequestsLoggingLevel::Headers);
        assert!(config.self_registration_enabled);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            port: 3001,
            issuer: Some("https://cli.example.com".to_string()),
            logging_level: RequestsLoggingLevel::Path,
            ..Default::default()
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            port: Some(4000),
            logging_level: Some("body".to_string()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 4000);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Body);
        assert_eq!(config.issuer, "https://cli.example.com");
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig {
            issuer: Some("https://auth.example.com".to_string()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_missing_issuer_error() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("issuer must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            issuer: Some("https://auth.example.com".to_string()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_db_path_helper() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            issuer: Some("https://auth.example.com".to_string()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.db_path(), temp_dir.path().join("darkauth.db"));
    }
}
