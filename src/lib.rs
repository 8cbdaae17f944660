//! DarkAuth core library
//!
//! Exposes the authentication and key-delivery pipeline: OPAQUE registration
//! and login, the client-anchored key schedule's server-side half, OIDC
//! authorization with zero-knowledge DRK delivery, session/refresh-token
//! management, and TOTP second-factor gating.

pub mod config;
pub mod crypto;
pub mod error;
pub mod jwks;
pub mod keywrap;
pub mod oidc;
pub mod opaque_engine;
pub mod otp;
pub mod server;
pub mod sqlite_persistence;
pub mod store;
pub mod zk;

pub use error::{DarkAuthError, ErrorCode};
pub use server::{run_server, RequestsLoggingLevel};
pub use store::{FullStore, SqliteStore};
