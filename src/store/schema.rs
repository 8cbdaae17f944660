//! SQLite schema for the DarkAuth database, following the teacher's
//! `Table`/`Column`/`VersionedSchema` description style so migrations are
//! declarative and `PRAGMA user_version`-tracked.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const USERS_TABLE_V1: Table = Table {
    name: "users",
    columns: &[
        sqlite_column!("sub", &SqlType::Text, is_primary_key = true),
        sqlite_column!("email", &SqlType::Text, is_unique = true),
        sqlite_column!("name", &SqlType::Text),
        sqlite_column!(
            "password_reset_required",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const OPAQUE_RECORDS_TABLE_V1: Table = Table {
    name: "opaque_records",
    columns: &[
        sqlite_column!("subject_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("envelope", &SqlType::Blob, non_null = true),
        sqlite_column!("server_public_key", &SqlType::Blob, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const WRAPPED_ROOT_KEYS_TABLE_V1: Table = Table {
    name: "wrapped_root_keys",
    columns: &[
        sqlite_column!("user_sub", &SqlType::Text, is_primary_key = true),
        sqlite_column!("wrapped_drk", &SqlType::Blob, non_null = true),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const USER_ENCRYPTION_KEYS_TABLE_V1: Table = Table {
    name: "user_encryption_keys",
    columns: &[
        sqlite_column!("user_sub", &SqlType::Text, is_primary_key = true),
        sqlite_column!("enc_public_jwk", &SqlType::Text),
        sqlite_column!("enc_private_jwk_wrapped", &SqlType::Blob),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const ADMIN_USERS_TABLE_V1: Table = Table {
    name: "admin_users",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("email", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("name", &SqlType::Text),
        sqlite_column!("role", &SqlType::Text, non_null = true),
        sqlite_column!(
            "password_reset_required",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const ADMIN_OPAQUE_RECORDS_TABLE_V1: Table = Table {
    name: "admin_opaque_records",
    columns: &[
        sqlite_column!("subject_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("envelope", &SqlType::Blob, non_null = true),
        sqlite_column!("server_public_key", &SqlType::Blob, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const CLIENTS_TABLE_V1: Table = Table {
    name: "clients",
    columns: &[
        sqlite_column!("client_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("client_type", &SqlType::Text, non_null = true),
        sqlite_column!("token_endpoint_auth_method", &SqlType::Text, non_null = true),
        sqlite_column!("client_secret_encrypted", &SqlType::Blob),
        sqlite_column!(
            "require_pkce",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("zk_delivery", &SqlType::Text, non_null = true, default_value = Some("'none'")),
        sqlite_column!(
            "zk_required",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("allowed_jwe_algs", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
        sqlite_column!("allowed_jwe_encs", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
        sqlite_column!("redirect_uris", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
        sqlite_column!("allowed_zk_origins", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
        sqlite_column!("allowed_grant_types", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
        sqlite_column!("id_token_lifetime_secs", &SqlType::Integer, non_null = true, default_value = Some("300")),
        sqlite_column!("access_token_lifetime_secs", &SqlType::Integer, non_null = true, default_value = Some("600")),
        sqlite_column!("refresh_token_lifetime_secs", &SqlType::Integer),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const PENDING_AUTH_TABLE_V1: Table = Table {
    name: "pending_auth",
    columns: &[
        sqlite_column!("request_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("client_id", &SqlType::Text, non_null = true),
        sqlite_column!("redirect_uri", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text),
        sqlite_column!("nonce", &SqlType::Text),
        sqlite_column!("code_challenge", &SqlType::Text, non_null = true),
        sqlite_column!("code_challenge_method", &SqlType::Text, non_null = true),
        sqlite_column!("zk_pub", &SqlType::Text),
        sqlite_column!("zk_pub_kid", &SqlType::Text),
        sqlite_column!("origin", &SqlType::Text),
        sqlite_column!("expires_at", &SqlType::Text, non_null = true),
        sqlite_column!("user_sub", &SqlType::Text),
    ],
    indices: &[("idx_pending_auth_expires", "expires_at")],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const AUTH_CODES_TABLE_V1: Table = Table {
    name: "auth_codes",
    columns: &[
        sqlite_column!("code", &SqlType::Text, is_primary_key = true),
        sqlite_column!("client_id", &SqlType::Text, non_null = true),
        sqlite_column!("user_sub", &SqlType::Text, non_null = true),
        sqlite_column!("redirect_uri", &SqlType::Text, non_null = true),
        sqlite_column!("nonce", &SqlType::Text),
        sqlite_column!("code_challenge", &SqlType::Text),
        sqlite_column!("code_challenge_method", &SqlType::Text),
        sqlite_column!("expires_at", &SqlType::Text, non_null = true),
        sqlite_column!(
            "consumed",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "has_zk",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("zk_pub_kid", &SqlType::Text),
        sqlite_column!("drk_hash", &SqlType::Text),
        sqlite_column!("amr", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
    ],
    indices: &[("idx_auth_codes_expires", "expires_at")],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const OPAQUE_LOGIN_SESSIONS_TABLE_V1: Table = Table {
    name: "opaque_login_sessions",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("cohort", &SqlType::Text, non_null = true),
        sqlite_column!("server_state", &SqlType::Blob, non_null = true),
        sqlite_column!("identity_s", &SqlType::Blob, non_null = true),
        sqlite_column!("identity_u", &SqlType::Blob, non_null = true),
        sqlite_column!("expires_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_opaque_login_sessions_expires", "expires_at")],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const SESSIONS_TABLE_V1: Table = Table {
    name: "sessions",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("cohort", &SqlType::Text, non_null = true),
        sqlite_column!("subject_id", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at", &SqlType::Text, non_null = true),
        sqlite_column!("data", &SqlType::Text, non_null = true, default_value = Some("'{}'")),
        sqlite_column!("refresh_token_hash", &SqlType::Text),
        sqlite_column!("refresh_token_expires_at", &SqlType::Text),
        sqlite_column!("refresh_token_consumed_at", &SqlType::Text),
    ],
    indices: &[
        ("idx_sessions_expires", "expires_at"),
        ("idx_sessions_refresh_hash", "refresh_token_hash"),
    ],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const JWKS_TABLE_V1: Table = Table {
    name: "jwks",
    columns: &[
        sqlite_column!("kid", &SqlType::Text, is_primary_key = true),
        sqlite_column!("alg", &SqlType::Text, non_null = true),
        sqlite_column!("public_jwk", &SqlType::Text, non_null = true),
        sqlite_column!("private_jwk_encrypted", &SqlType::Blob, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("rotated_at", &SqlType::Text),
    ],
    indices: &[("idx_jwks_alg_rotated", "alg, rotated_at")],
    unique_constraints: &[],
    // At most one active (non-rotated) key per alg, enforced at the schema
    // level since `rotate_in`'s transaction alone can't stop a second
    // connection from racing it.
    partial_unique_indices: &[("idx_jwks_active_alg", &["alg"], "rotated_at IS NULL")],
};

const OTP_CONFIGS_TABLE_V1: Table = Table {
    name: "otp_configs",
    columns: &[
        sqlite_column!("cohort", &SqlType::Text, is_primary_key = true),
        sqlite_column!("subject_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("secret_encrypted", &SqlType::Blob, non_null = true),
        sqlite_column!(
            "verified",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_used_step", &SqlType::Integer),
        sqlite_column!(
            "failure_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("locked_until", &SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const OTP_BACKUP_CODES_TABLE_V1: Table = Table {
    name: "otp_backup_codes",
    columns: &[
        sqlite_column!("cohort", &SqlType::Text, is_primary_key = true),
        sqlite_column!("subject_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("code_hash", &SqlType::Text, is_primary_key = true),
        sqlite_column!("used_at", &SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const USER_PASSWORD_HISTORY_TABLE_V1: Table = Table {
    name: "user_password_history",
    columns: &[
        sqlite_column!("user_sub", &SqlType::Text, is_primary_key = true),
        sqlite_column!("export_key_hash", &SqlType::Text, is_primary_key = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const OPAQUE_SERVER_STATE_TABLE_V1: Table = Table {
    name: "opaque_server_state",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("oprf_seed_encrypted", &SqlType::Blob, non_null = true),
        sqlite_column!("ake_keypair_encrypted", &SqlType::Blob, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

const ADMIN_AUDIT_LOG_TABLE_V1: Table = Table {
    name: "admin_audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("actor_admin_id", &SqlType::Text, non_null = true),
        sqlite_column!("action", &SqlType::Text, non_null = true),
        sqlite_column!("target", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_admin_audit_log_created", "created_at DESC")],
    unique_constraints: &[],
    partial_unique_indices: &[],
};

pub const DARKAUTH_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        USERS_TABLE_V1,
        OPAQUE_RECORDS_TABLE_V1,
        WRAPPED_ROOT_KEYS_TABLE_V1,
        USER_ENCRYPTION_KEYS_TABLE_V1,
        ADMIN_USERS_TABLE_V1,
        ADMIN_OPAQUE_RECORDS_TABLE_V1,
        CLIENTS_TABLE_V1,
        PENDING_AUTH_TABLE_V1,
        AUTH_CODES_TABLE_V1,
        OPAQUE_LOGIN_SESSIONS_TABLE_V1,
        SESSIONS_TABLE_V1,
        JWKS_TABLE_V1,
        OTP_CONFIGS_TABLE_V1,
        OTP_BACKUP_CODES_TABLE_V1,
        USER_PASSWORD_HISTORY_TABLE_V1,
        OPAQUE_SERVER_STATE_TABLE_V1,
        ADMIN_AUDIT_LOG_TABLE_V1,
    ],
    migration: None,
}];
