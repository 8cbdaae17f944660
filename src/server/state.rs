//! Shared application state, following the teacher's `ServerState`: a plain
//! `Clone` struct of `Arc`-wrapped handles passed to every handler via
//! `State<AppState>`, rather than `FromRef`-per-field indirection — DarkAuth
//! has far fewer subsystems than the teacher's catalog server, so one struct
//! read directly is simpler than threading `FromRef` impls through it.

use crate::config::AppConfig;
use crate::opaque_engine::OpaqueEngine;
use crate::store::FullStore;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FullStore>,
    pub config: AppConfig,
    pub kek: [u8; 32],
    pub opaque_engine: Arc<OpaqueEngine>,
    /// Built once at startup from `config.issuer` (`[AMBIENT] §4.8`).
    pub discovery_document: Arc<serde_json::Value>,
    pub start_time: Instant,
}
