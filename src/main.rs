use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use darkauth::config::{self, AppConfig, CliConfig};
use darkauth::jwks;
use darkauth::oidc;
use darkauth::opaque_engine::OpaqueEngine;
use darkauth::server::{self, AppState, RequestsLoggingLevel};
use darkauth::store::{FullStore, JwksAlg, JwksRepo, SqliteStore, SweepRepo};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let resolved = path_buf.canonicalize().or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Ok(path_buf.clone())
        } else {
            Err(format!("Error resolving path '{}': {}", s, e))
        }
    })?;
    if resolved.is_absolute() {
        return Ok(resolved);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(resolved))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing the darkauth.db SQLite file.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The OIDC issuer URL published in the discovery document and embedded
    /// in every minted token.
    #[clap(long)]
    pub issuer: Option<String>,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Name of the environment variable holding the base64url-encoded
    /// 32-byte key-encryption key. Defaults to DARKAUTH_KEK.
    #[clap(long)]
    pub kek_env_var: Option<String>,

    /// Allow unauthenticated visitors to self-register a user account.
    #[clap(long)]
    pub self_registration_enabled: bool,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            issuer: args.issuer.clone(),
            logging_level: args.logging_level.clone(),
            kek_env_var: args.kek_env_var.clone(),
            self_registration_enabled: args.self_registration_enabled,
        }
    }
}

const DEFAULT_KEK_ENV_VAR: &str = "DARKAUTH_KEK";

/// Well-known fallback used only when the KEK env var is entirely unset.
/// Anyone can derive this key from the source, so wrapping with it carries
/// no real confidentiality — it exists only so a local dev instance boots
/// without configuring a secret, per `[AMBIENT]` Configuration in
/// SPEC_FULL.md.
const DEV_FALLBACK_KEK: [u8; 32] = [0u8; 32];

/// Resolves the key-encryption key from the environment variable named by
/// `kek_env_var` (or `DARKAUTH_KEK` if unset). The KEK wraps the JWKS
/// private keys and OTP secrets at rest (`[AMBIENT] §4.8`, `§4.6`). The
/// variable is optional: if it is not set at all, a well-known development
/// key is used instead and loudly logged, rather than refusing to start. If
/// it is set but not valid base64url/32 bytes, that is a real
/// misconfiguration and still fails startup.
fn resolve_kek(kek_env_var: Option<&str>) -> Result<[u8; 32]> {
    let var_name = kek_env_var.unwrap_or(DEFAULT_KEK_ENV_VAR);
    match std::env::var(var_name) {
        Ok(encoded) => {
            let bytes = darkauth::crypto::b64url_decode(&encoded)
                .with_context(|| format!("{} is not valid base64url", var_name))?;
            let kek: [u8; 32] = bytes
                .try_into()
                .map_err(|v: Vec<u8>| anyhow::anyhow!("{} must decode to 32 bytes, got {}", var_name, v.len()))?;
            Ok(kek)
        }
        Err(std::env::VarError::NotPresent) => {
            warn!(
                "{} is not set; falling back to a well-known development key-encryption key. \
                 JWKS private keys and OTP secrets will have no real confidentiality at rest. \
                 Set {} before running against real users.",
                var_name, var_name
            );
            Ok(DEV_FALLBACK_KEK)
        }
        Err(e) => Err(anyhow::anyhow!("failed to read {}: {}", var_name, e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    let cli_config: CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!("  issuer: {}", app_config.issuer);
    info!("  self_registration_enabled: {}", app_config.self_registration_enabled);

    let kek = resolve_kek(app_config.kek_env_var.as_deref())?;

    let store: Arc<dyn FullStore> = Arc::new(SqliteStore::new(app_config.db_path())?);

    let opaque_engine = Arc::new(OpaqueEngine::load_or_init(store.as_ref(), &kek)?);

    if store.get_active_key(JwksAlg::RS256)?.is_none() {
        info!("no active RS256 signing key found, minting one");
        jwks::rotate_signing_key(store.as_ref(), &kek, JwksAlg::RS256)?;
    }

    let discovery_document = Arc::new(oidc::discovery_document(&app_config.issuer));

    let state = AppState {
        store: store.clone(),
        config: app_config.clone(),
        kek,
        opaque_engine,
        discovery_document,
        start_time: std::time::Instant::now(),
    };

    let sweep_store = store.clone();
    let sweep_interval = app_config.sweeper.interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(sweep_interval));
        loop {
            ticker.tick().await;
            match sweep_store.sweep_expired() {
                Ok(count) if count > 0 => info!("swept {} expired row(s)", count),
                Ok(_) => {}
                Err(e) => error!("expiry sweep failed: {:?}", e),
            }
        }
    });

    info!("Ready to serve at port {}!", app_config.port);

    tokio::select! {
        result = server::run_server(state, app_config.port) => {
            info!("HTTP server stopped: {:?}", result);
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok(())
        }
    }
}
