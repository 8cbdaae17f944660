use super::models::*;
use super::schema::DARKAUTH_VERSIONED_SCHEMAS;
use super::{
    AdminRepo, AuthCodeRepo, ClientRepo, JwksRepo, OpaqueLoginSessionRepo, OpaqueRecordRepo,
    OpaqueStateRepo, OtpRepo, PasswordHistoryRepo, PendingAuthRepo, SessionRepo, SweepRepo,
    UserEncryptionKeysRepo, UserRepo, WrappedRootKeyRepo,
};
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// SQLite-backed implementation of every repository trait. Follows the
/// teacher's `SqliteServerStore::new()` open/migrate/validate idiom.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("failed to open darkauth database")?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        if is_new_db {
            info!("creating new darkauth database at {:?}", path);
            DARKAUTH_VERSIONED_SCHEMAS.last().unwrap().create(&conn)?;
            conn.execute(
                &format!(
                    "PRAGMA user_version = {}",
                    BASE_DB_VERSION + DARKAUTH_VERSIONED_SCHEMAS.last().unwrap().version
                ),
                [],
            )?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;
            if db_version < 1 {
                anyhow::bail!("darkauth database version {} is invalid (expected >= 1)", db_version);
            }

            let current_schema_version = DARKAUTH_VERSIONED_SCHEMAS.last().unwrap().version as i64;
            let version_index = DARKAUTH_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("unknown darkauth database version {}", db_version))?;
            DARKAUTH_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!("darkauth database schema validation failed for version {}", db_version)
                })?;

            if db_version < current_schema_version {
                info!("migrating darkauth database from version {} to {}", db_version, current_schema_version);
                Self::migrate_if_needed(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in DARKAUTH_VERSIONED_SCHEMAS.iter().skip(from_version) {
            if schema.version > from_version {
                info!("running darkauth migration from version {} to {}", latest_from, schema.version);
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx)
                        .with_context(|| format!("failed to run migration to version {}", schema.version))?;
                }
                latest_from = schema.version;
            }
        }
        tx.execute(&format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from), [])?;
        tx.commit()?;
        Ok(())
    }

    fn fmt(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339()
    }

    fn parse(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn parse_opt(s: Option<String>) -> Option<DateTime<Utc>> {
        s.map(|s| Self::parse(&s))
    }

    fn json_list(s: &str) -> Vec<String> {
        serde_json::from_str(s).unwrap_or_default()
    }

    fn json_list_str(v: &[String]) -> String {
        serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
    }
}

impl UserRepo for SqliteStore {
    fn create_user(&self, sub: &str, email: Option<&str>, name: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (sub, email, name, password_reset_required, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
            params![sub, email, name, Self::fmt(&Utc::now())],
        )?;
        Ok(())
    }

    fn get_user_by_sub(&self, sub: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sub, email, name, password_reset_required, created_at FROM users WHERE sub = ?1",
            params![sub],
            |row| {
                let created_at: String = row.get(4)?;
                Ok(User {
                    sub: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    password_reset_required: row.get::<_, i64>(3)? != 0,
                    created_at: Self::parse(&created_at),
                })
            },
        )
        .optional()
        .context("get_user_by_sub")
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sub, email, name, password_reset_required, created_at FROM users WHERE email = ?1",
            params![email],
            |row| {
                let created_at: String = row.get(4)?;
                Ok(User {
                    sub: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    password_reset_required: row.get::<_, i64>(3)? != 0,
                    created_at: Self::parse(&created_at),
                })
            },
        )
        .optional()
        .context("get_user_by_email")
    }

    fn set_password_reset_required(&self, sub: &str, required: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET password_reset_required = ?1 WHERE sub = ?2",
            params![required as i64, sub],
        )?;
        Ok(())
    }

    fn search_users(&self, query: Option<&str>) -> Result<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let row_to_user = |row: &rusqlite::Row| {
            let created_at: String = row.get(4)?;
            Ok(User {
                sub: row.get(0)?,
                email: row.get(1)?,
                name: row.get(2)?,
                password_reset_required: row.get::<_, i64>(3)? != 0,
                created_at: Self::parse(&created_at),
            })
        };
        let users = match query {
            Some(q) => {
                let pattern = format!("%{q}%");
                let mut stmt = conn.prepare(
                    "SELECT sub, email, name, password_reset_required, created_at FROM users
                     WHERE email LIKE ?1 OR name LIKE ?1 ORDER BY email",
                )?;
                stmt.query_map(params![pattern], row_to_user)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT sub, email, name, password_reset_required, created_at FROM users ORDER BY email",
                )?;
                stmt.query_map([], row_to_user)?.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(users)
    }
}

impl OpaqueRecordRepo for SqliteStore {
    fn get_opaque_record(&self, subject_id: &str) -> Result<Option<OpaqueRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT subject_id, envelope, server_public_key FROM opaque_records WHERE subject_id = ?1",
            params![subject_id],
            |row| {
                Ok(OpaqueRecord {
                    subject_id: row.get(0)?,
                    envelope: row.get(1)?,
                    server_public_key: row.get(2)?,
                })
            },
        )
        .optional()
        .context("get_opaque_record")
    }

    fn put_opaque_record(&self, record: &OpaqueRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO opaque_records (subject_id, envelope, server_public_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id) DO UPDATE SET envelope = excluded.envelope, server_public_key = excluded.server_public_key",
            params![record.subject_id, record.envelope, record.server_public_key],
        )?;
        Ok(())
    }
}

impl WrappedRootKeyRepo for SqliteStore {
    fn get_wrapped_drk(&self, user_sub: &str) -> Result<Option<WrappedRootKey>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_sub, wrapped_drk, updated_at FROM wrapped_root_keys WHERE user_sub = ?1",
            params![user_sub],
            |row| {
                let updated_at: String = row.get(2)?;
                Ok(WrappedRootKey {
                    user_sub: row.get(0)?,
                    wrapped_drk: row.get(1)?,
                    updated_at: Self::parse(&updated_at),
                })
            },
        )
        .optional()
        .context("get_wrapped_drk")
    }

    fn put_wrapped_drk(&self, user_sub: &str, wrapped_drk: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO wrapped_root_keys (user_sub, wrapped_drk, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_sub) DO UPDATE SET wrapped_drk = excluded.wrapped_drk, updated_at = excluded.updated_at",
            params![user_sub, wrapped_drk, Self::fmt(&Utc::now())],
        )?;
        Ok(())
    }
}

impl UserEncryptionKeysRepo for SqliteStore {
    fn get_user_encryption_keys(&self, user_sub: &str) -> Result<UserEncryptionKeys> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT enc_public_jwk, enc_private_jwk_wrapped FROM user_encryption_keys WHERE user_sub = ?1",
            params![user_sub],
            |row| {
                Ok(UserEncryptionKeys {
                    enc_public_jwk: row.get(0)?,
                    enc_private_jwk_wrapped: row.get(1)?,
                })
            },
        )
        .optional()
        .context("get_user_encryption_keys")
        .map(|o| o.unwrap_or_default())
    }

    fn put_enc_public_jwk(&self, user_sub: &str, jwk: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_encryption_keys (user_sub, enc_public_jwk) VALUES (?1, ?2)
             ON CONFLICT(user_sub) DO UPDATE SET enc_public_jwk = excluded.enc_public_jwk",
            params![user_sub, jwk],
        )?;
        Ok(())
    }
}

impl PasswordHistoryRepo for SqliteStore {
    fn export_key_hash_seen(&self, user_sub: &str, export_key_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_password_history WHERE user_sub = ?1 AND export_key_hash = ?2",
            params![user_sub, export_key_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn record_export_key_hash(&self, user_sub: &str, export_key_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO user_password_history (user_sub, export_key_hash, created_at) VALUES (?1, ?2, ?3)",
            params![user_sub, export_key_hash, Self::fmt(&Utc::now())],
        )?;
        Ok(())
    }
}

impl AdminRepo for SqliteStore {
    fn create_admin(&self, id: &str, email: &str, name: Option<&str>, role: AdminRole) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO admin_users (id, email, name, role, password_reset_required) VALUES (?1, ?2, ?3, ?4, 1)",
            params![id, email, name, role.as_str()],
        )?;
        Ok(())
    }

    fn list_admins(&self) -> Result<Vec<AdminUser>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, email, name, role, password_reset_required FROM admin_users ORDER BY email",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let role_str: String = row.get(3)?;
                Ok(AdminUser {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    role: AdminRole::from_str(&role_str).unwrap_or(AdminRole::Read),
                    password_reset_required: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn set_admin_password_reset_required(&self, id: &str, required: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE admin_users SET password_reset_required = ?1 WHERE id = ?2",
            params![required as i64, id],
        )?;
        Ok(())
    }

    fn get_admin_by_email(&self, email: &str) -> Result<Option<AdminUser>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, name, role, password_reset_required FROM admin_users WHERE email = ?1",
            params![email],
            |row| {
                let role_str: String = row.get(3)?;
                Ok(AdminUser {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    role: AdminRole::from_str(&role_str).unwrap_or(AdminRole::Read),
                    password_reset_required: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .context("get_admin_by_email")
    }

    fn get_admin_by_id(&self, id: &str) -> Result<Option<AdminUser>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, name, role, password_reset_required FROM admin_users WHERE id = ?1",
            params![id],
            |row| {
                let role_str: String = row.get(3)?;
                Ok(AdminUser {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    role: AdminRole::from_str(&role_str).unwrap_or(AdminRole::Read),
                    password_reset_required: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .context("get_admin_by_id")
    }

    fn get_admin_opaque_record(&self, subject_id: &str) -> Result<Option<OpaqueRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT subject_id, envelope, server_public_key FROM admin_opaque_records WHERE subject_id = ?1",
            params![subject_id],
            |row| {
                Ok(OpaqueRecord {
                    subject_id: row.get(0)?,
                    envelope: row.get(1)?,
                    server_public_key: row.get(2)?,
                })
            },
        )
        .optional()
        .context("get_admin_opaque_record")
    }

    fn put_admin_opaque_record(&self, record: &OpaqueRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO admin_opaque_records (subject_id, envelope, server_public_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id) DO UPDATE SET envelope = excluded.envelope, server_public_key = excluded.server_public_key",
            params![record.subject_id, record.envelope, record.server_public_key],
        )?;
        Ok(())
    }

    fn log_admin_action(&self, actor_admin_id: &str, action: &str, target: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO admin_audit_log (actor_admin_id, action, target, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![actor_admin_id, action, target, Self::fmt(&Utc::now())],
        )?;
        Ok(())
    }
}

impl ClientRepo for SqliteStore {
    fn get_client(&self, client_id: &str) -> Result<Option<Client>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT client_id, client_type, token_endpoint_auth_method, client_secret_encrypted,
                    require_pkce, zk_delivery, zk_required, allowed_jwe_algs, allowed_jwe_encs,
                    redirect_uris, allowed_zk_origins, allowed_grant_types,
                    id_token_lifetime_secs, access_token_lifetime_secs, refresh_token_lifetime_secs
             FROM clients WHERE client_id = ?1",
            params![client_id],
            |row| Self::row_to_client(row),
        )
        .optional()
        .context("get_client")
    }

    fn put_client(&self, client: &Client) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO clients (client_id, client_type, token_endpoint_auth_method, client_secret_encrypted,
                require_pkce, zk_delivery, zk_required, allowed_jwe_algs, allowed_jwe_encs,
                redirect_uris, allowed_zk_origins, allowed_grant_types,
                id_token_lifetime_secs, access_token_lifetime_secs, refresh_token_lifetime_secs)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
             ON CONFLICT(client_id) DO UPDATE SET
                client_type = excluded.client_type,
                token_endpoint_auth_method = excluded.token_endpoint_auth_method,
                client_secret_encrypted = excluded.client_secret_encrypted,
                require_pkce = excluded.require_pkce,
                zk_delivery = excluded.zk_delivery,
                zk_required = excluded.zk_required,
                allowed_jwe_algs = excluded.allowed_jwe_algs,
                allowed_jwe_encs = excluded.allowed_jwe_encs,
                redirect_uris = excluded.redirect_uris,
                allowed_zk_origins = excluded.allowed_zk_origins,
                allowed_grant_types = excluded.allowed_grant_types,
                id_token_lifetime_secs = excluded.id_token_lifetime_secs,
                access_token_lifetime_secs = excluded.access_token_lifetime_secs,
                refresh_token_lifetime_secs = excluded.refresh_token_lifetime_secs",
            params![
                client.client_id,
                client_type_str(client.client_type),
                auth_method_str(client.token_endpoint_auth_method),
                client.client_secret_encrypted,
                client.require_pkce as i64,
                zk_delivery_str(client.zk_delivery),
                client.zk_required as i64,
                Self::json_list_str(&client.allowed_jwe_algs),
                Self::json_list_str(&client.allowed_jwe_encs),
                Self::json_list_str(&client.redirect_uris),
                Self::json_list_str(&client.allowed_zk_origins),
                Self::json_list_str(&client.allowed_grant_types.iter().map(|g| grant_type_str(*g).to_string()).collect::<Vec<_>>()),
                client.id_token_lifetime_secs as i64,
                client.access_token_lifetime_secs as i64,
                client.refresh_token_lifetime_secs.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }
}

fn client_type_str(t: ClientType) -> &'static str {
    match t {
        ClientType::Public => "public",
        ClientType::Confidential => "confidential",
    }
}

fn auth_method_str(m: TokenEndpointAuthMethod) -> &'static str {
    match m {
        TokenEndpointAuthMethod::None => "none",
        TokenEndpointAuthMethod::ClientSecretBasic => "client_secret_basic",
    }
}

fn zk_delivery_str(z: ZkDelivery) -> &'static str {
    match z {
        ZkDelivery::None => "none",
        ZkDelivery::FragmentJwe => "fragment_jwe",
    }
}

fn grant_type_str(g: GrantType) -> &'static str {
    match g {
        GrantType::AuthorizationCode => "authorization_code",
        GrantType::RefreshToken => "refresh_token",
        GrantType::ClientCredentials => "client_credentials",
    }
}

fn grant_type_from_str(s: &str) -> Option<GrantType> {
    match s {
        "authorization_code" => Some(GrantType::AuthorizationCode),
        "refresh_token" => Some(GrantType::RefreshToken),
        "client_credentials" => Some(GrantType::ClientCredentials),
        _ => None,
    }
}

impl SqliteStore {
    fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<Client> {
        let client_type_str: String = row.get(1)?;
        let auth_method_str: String = row.get(2)?;
        let zk_delivery_str: String = row.get(5)?;
        let allowed_jwe_algs: String = row.get(7)?;
        let allowed_jwe_encs: String = row.get(8)?;
        let redirect_uris: String = row.get(9)?;
        let allowed_zk_origins: String = row.get(10)?;
        let allowed_grant_types: String = row.get(11)?;
        let refresh_token_lifetime_secs: Option<i64> = row.get(14)?;

        Ok(Client {
            client_id: row.get(0)?,
            client_type: match client_type_str.as_str() {
                "confidential" => ClientType::Confidential,
                _ => ClientType::Public,
            },
            token_endpoint_auth_method: match auth_method_str.as_str() {
                "client_secret_basic" => TokenEndpointAuthMethod::ClientSecretBasic,
                _ => TokenEndpointAuthMethod::None,
            },
            client_secret_encrypted: row.get(3)?,
            require_pkce: row.get::<_, i64>(4)? != 0,
            zk_delivery: match zk_delivery_str.as_str() {
                "fragment_jwe" => ZkDelivery::FragmentJwe,
                _ => ZkDelivery::None,
            },
            zk_required: row.get::<_, i64>(6)? != 0,
            allowed_jwe_algs: Self::json_list(&allowed_jwe_algs),
            allowed_jwe_encs: Self::json_list(&allowed_jwe_encs),
            redirect_uris: Self::json_list(&redirect_uris),
            allowed_zk_origins: Self::json_list(&allowed_zk_origins),
            allowed_grant_types: Self::json_list(&allowed_grant_types)
                .into_iter()
                .filter_map(|s| grant_type_from_str(&s))
                .collect(),
            id_token_lifetime_secs: row.get::<_, i64>(12)? as u64,
            access_token_lifetime_secs: row.get::<_, i64>(13)? as u64,
            refresh_token_lifetime_secs: refresh_token_lifetime_secs.map(|v| v as u64),
        })
    }
}

impl PendingAuthRepo for SqliteStore {
    fn create_pending_auth(&self, pending: &PendingAuth) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pending_auth (request_id, client_id, redirect_uri, state, nonce,
                code_challenge, code_challenge_method, zk_pub, zk_pub_kid, origin, expires_at, user_sub)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                pending.request_id,
                pending.client_id,
                pending.redirect_uri,
                pending.state,
                pending.nonce,
                pending.code_challenge,
                pending.code_challenge_method,
                pending.zk_pub,
                pending.zk_pub_kid,
                pending.origin,
                Self::fmt(&pending.expires_at),
                pending.user_sub,
            ],
        )?;
        Ok(())
    }

    fn get_pending_auth(&self, request_id: &str) -> Result<Option<PendingAuth>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT request_id, client_id, redirect_uri, state, nonce, code_challenge,
                    code_challenge_method, zk_pub, zk_pub_kid, origin, expires_at, user_sub
             FROM pending_auth WHERE request_id = ?1",
            params![request_id],
            |row| {
                let expires_at: String = row.get(10)?;
                Ok(PendingAuth {
                    request_id: row.get(0)?,
                    client_id: row.get(1)?,
                    redirect_uri: row.get(2)?,
                    state: row.get(3)?,
                    nonce: row.get(4)?,
                    code_challenge: row.get(5)?,
                    code_challenge_method: row.get(6)?,
                    zk_pub: row.get(7)?,
                    zk_pub_kid: row.get(8)?,
                    origin: row.get(9)?,
                    expires_at: Self::parse(&expires_at),
                    user_sub: row.get(11)?,
                })
            },
        )
        .optional()
        .context("get_pending_auth")
    }

    fn bind_pending_auth_user(&self, request_id: &str, user_sub: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pending_auth SET user_sub = ?1 WHERE request_id = ?2",
            params![user_sub, request_id],
        )?;
        Ok(())
    }

    fn delete_pending_auth(&self, request_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM pending_auth WHERE request_id = ?1", params![request_id])?;
        Ok(())
    }
}

impl AuthCodeRepo for SqliteStore {
    fn create_auth_code(&self, code: &AuthCode) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auth_codes (code, client_id, user_sub, redirect_uri, nonce, code_challenge,
                code_challenge_method, expires_at, consumed, has_zk, zk_pub_kid, drk_hash, amr)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,0,?9,?10,?11,?12)",
            params![
                code.code,
                code.client_id,
                code.user_sub,
                code.redirect_uri,
                code.nonce,
                code.code_challenge,
                code.code_challenge_method,
                Self::fmt(&code.expires_at),
                code.has_zk as i64,
                code.zk_pub_kid,
                code.drk_hash,
                Self::json_list_str(&code.amr),
            ],
        )?;
        Ok(())
    }

    fn get_auth_code(&self, code: &str) -> Result<Option<AuthCode>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT code, client_id, user_sub, redirect_uri, nonce, code_challenge,
                    code_challenge_method, expires_at, consumed, has_zk, zk_pub_kid, drk_hash, amr
             FROM auth_codes WHERE code = ?1",
            params![code],
            |row| {
                let expires_at: String = row.get(7)?;
                let amr: String = row.get(12)?;
                Ok(AuthCode {
                    code: row.get(0)?,
                    client_id: row.get(1)?,
                    user_sub: row.get(2)?,
                    redirect_uri: row.get(3)?,
                    nonce: row.get(4)?,
                    code_challenge: row.get(5)?,
                    code_challenge_method: row.get(6)?,
                    expires_at: Self::parse(&expires_at),
                    consumed: row.get::<_, i64>(8)? != 0,
                    has_zk: row.get::<_, i64>(9)? != 0,
                    zk_pub_kid: row.get(10)?,
                    drk_hash: row.get(11)?,
                    amr: Self::json_list(&amr),
                })
            },
        )
        .optional()
        .context("get_auth_code")
    }

    fn consume_auth_code(&self, code: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE auth_codes SET consumed = 1 WHERE code = ?1 AND consumed = 0",
            params![code],
        )?;
        Ok(rows == 1)
    }
}

impl OpaqueLoginSessionRepo for SqliteStore {
    fn create_opaque_login_session(&self, session: &OpaqueLoginSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO opaque_login_sessions (id, cohort, server_state, identity_s, identity_u, expires_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                session.id,
                session.cohort.as_str(),
                session.server_state,
                session.identity_s,
                session.identity_u,
                Self::fmt(&session.expires_at),
            ],
        )?;
        Ok(())
    }

    fn get_opaque_login_session(&self, id: &str) -> Result<Option<OpaqueLoginSession>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, cohort, server_state, identity_s, identity_u, expires_at
             FROM opaque_login_sessions WHERE id = ?1",
            params![id],
            |row| {
                let cohort_str: String = row.get(1)?;
                let expires_at: String = row.get(5)?;
                Ok(OpaqueLoginSession {
                    id: row.get(0)?,
                    cohort: Cohort::from_str(&cohort_str).unwrap_or(Cohort::User),
                    server_state: row.get(2)?,
                    identity_s: row.get(3)?,
                    identity_u: row.get(4)?,
                    expires_at: Self::parse(&expires_at),
                })
            },
        )
        .optional()
        .context("get_opaque_login_session")
    }

    fn delete_opaque_login_session(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM opaque_login_sessions WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl SessionRepo for SqliteStore {
    fn create_session(
        &self,
        cohort: Cohort,
        subject_id: &str,
        data: serde_json::Value,
        session_ttl_secs: u64,
        refresh_token_hash: Option<&str>,
        refresh_ttl_secs: Option<u64>,
    ) -> Result<Session> {
        let conn = self.conn.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(session_ttl_secs as i64);
        let refresh_expires_at = refresh_ttl_secs.map(|secs| now + chrono::Duration::seconds(secs as i64));

        conn.execute(
            "INSERT INTO sessions (id, cohort, subject_id, created_at, expires_at, data,
                refresh_token_hash, refresh_token_expires_at, refresh_token_consumed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,NULL)",
            params![
                id,
                cohort.as_str(),
                subject_id,
                Self::fmt(&now),
                Self::fmt(&expires_at),
                data.to_string(),
                refresh_token_hash,
                refresh_expires_at.map(|d| Self::fmt(&d)),
            ],
        )?;

        Ok(Session {
            id,
            cohort,
            subject_id: subject_id.to_string(),
            created_at: now,
            expires_at,
            data,
            refresh_token_hash: refresh_token_hash.map(|s| s.to_string()),
            refresh_token_expires_at: refresh_expires_at,
            refresh_token_consumed_at: None,
        })
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, cohort, subject_id, created_at, expires_at, data,
                    refresh_token_hash, refresh_token_expires_at, refresh_token_consumed_at
             FROM sessions WHERE id = ?1",
            params![id],
            |row| Self::row_to_session(row),
        )
        .optional()
        .context("get_session")
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn patch_session_data(&self, id: &str, data: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET data = ?1 WHERE id = ?2",
            params![data.to_string(), id],
        )?;
        Ok(())
    }

    fn get_session_by_refresh_hash(&self, refresh_token_hash: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, cohort, subject_id, created_at, expires_at, data,
                    refresh_token_hash, refresh_token_expires_at, refresh_token_consumed_at
             FROM sessions WHERE refresh_token_hash = ?1",
            params![refresh_token_hash],
            |row| Self::row_to_session(row),
        )
        .optional()
        .context("get_session_by_refresh_hash")
    }

    fn consume_refresh_token(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Self::fmt(&Utc::now());
        let rows = conn.execute(
            "UPDATE sessions SET refresh_token_consumed_at = ?1
             WHERE id = ?2 AND refresh_token_consumed_at IS NULL
               AND refresh_token_hash IS NOT NULL
               AND refresh_token_expires_at > ?1",
            params![now, session_id],
        )?;
        Ok(rows == 1)
    }
}

impl SqliteStore {
    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let cohort_str: String = row.get(1)?;
        let created_at: String = row.get(3)?;
        let expires_at: String = row.get(4)?;
        let data_str: String = row.get(5)?;
        let refresh_expires_at: Option<String> = row.get(7)?;
        let refresh_consumed_at: Option<String> = row.get(8)?;

        Ok(Session {
            id: row.get(0)?,
            cohort: Cohort::from_str(&cohort_str).unwrap_or(Cohort::User),
            subject_id: row.get(2)?,
            created_at: Self::parse(&created_at),
            expires_at: Self::parse(&expires_at),
            data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
            refresh_token_hash: row.get(6)?,
            refresh_token_expires_at: Self::parse_opt(refresh_expires_at),
            refresh_token_consumed_at: Self::parse_opt(refresh_consumed_at),
        })
    }
}

impl JwksRepo for SqliteStore {
    fn put_jwks_entry(&self, entry: &JwksEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jwks (kid, alg, public_jwk, private_jwk_encrypted, created_at, rotated_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                entry.kid,
                entry.alg.as_str(),
                entry.public_jwk,
                entry.private_jwk_encrypted,
                Self::fmt(&entry.created_at),
                entry.rotated_at.map(|d| Self::fmt(&d)),
            ],
        )?;
        Ok(())
    }

    fn get_active_key(&self, alg: JwksAlg) -> Result<Option<JwksEntry>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT kid, alg, public_jwk, private_jwk_encrypted, created_at, rotated_at
             FROM jwks WHERE alg = ?1 AND rotated_at IS NULL ORDER BY created_at DESC LIMIT 1",
            params![alg.as_str()],
            |row| Self::row_to_jwks(row),
        )
        .optional()
        .context("get_active_key")
    }

    fn get_all_verification_keys(&self, alg: JwksAlg) -> Result<Vec<JwksEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT kid, alg, public_jwk, private_jwk_encrypted, created_at, rotated_at
             FROM jwks WHERE alg = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![alg.as_str()], |row| Self::row_to_jwks(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_all_public_keys(&self) -> Result<Vec<JwksEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT kid, alg, public_jwk, private_jwk_encrypted, created_at, rotated_at
             FROM jwks ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Self::row_to_jwks(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn rotate_in(&self, entry: &JwksEntry) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE jwks SET rotated_at = ?1 WHERE alg = ?2 AND rotated_at IS NULL",
            params![Self::fmt(&Utc::now()), entry.alg.as_str()],
        )?;
        tx.execute(
            "INSERT INTO jwks (kid, alg, public_jwk, private_jwk_encrypted, created_at, rotated_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                entry.kid,
                entry.alg.as_str(),
                entry.public_jwk,
                entry.private_jwk_encrypted,
                Self::fmt(&entry.created_at),
                entry.rotated_at.map(|d| Self::fmt(&d)),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl SqliteStore {
    fn row_to_jwks(row: &rusqlite::Row) -> rusqlite::Result<JwksEntry> {
        let alg_str: String = row.get(1)?;
        let created_at: String = row.get(4)?;
        let rotated_at: Option<String> = row.get(5)?;
        Ok(JwksEntry {
            kid: row.get(0)?,
            alg: if alg_str == "EdDSA" { JwksAlg::EdDSA } else { JwksAlg::RS256 },
            public_jwk: row.get(2)?,
            private_jwk_encrypted: row.get(3)?,
            created_at: Self::parse(&created_at),
            rotated_at: Self::parse_opt(rotated_at),
        })
    }
}

impl OtpRepo for SqliteStore {
    fn get_otp_config(&self, cohort: Cohort, subject_id: &str) -> Result<Option<OtpConfig>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT cohort, subject_id, secret_encrypted, verified, last_used_step,
                    failure_count, locked_until
             FROM otp_configs WHERE cohort = ?1 AND subject_id = ?2",
            params![cohort.as_str(), subject_id],
            |row| Self::row_to_otp(row),
        )
        .optional()
        .context("get_otp_config")
    }

    fn put_otp_config(&self, config: &OtpConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO otp_configs (cohort, subject_id, secret_encrypted, verified, last_used_step,
                failure_count, locked_until)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(cohort, subject_id) DO UPDATE SET
                secret_encrypted = excluded.secret_encrypted,
                verified = excluded.verified,
                last_used_step = excluded.last_used_step,
                failure_count = excluded.failure_count,
                locked_until = excluded.locked_until",
            params![
                config.cohort.as_str(),
                config.subject_id,
                config.secret_encrypted,
                config.verified as i64,
                config.last_used_step,
                config.failure_count as i64,
                config.locked_until.map(|d| Self::fmt(&d)),
            ],
        )?;
        Ok(())
    }

    fn delete_otp_config(&self, cohort: Cohort, subject_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM otp_configs WHERE cohort = ?1 AND subject_id = ?2",
            params![cohort.as_str(), subject_id],
        )?;
        conn.execute(
            "DELETE FROM otp_backup_codes WHERE cohort = ?1 AND subject_id = ?2",
            params![cohort.as_str(), subject_id],
        )?;
        Ok(())
    }

    fn record_otp_success(&self, cohort: Cohort, subject_id: &str, step: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE otp_configs SET last_used_step = ?1, failure_count = 0, locked_until = NULL, verified = 1
             WHERE cohort = ?2 AND subject_id = ?3",
            params![step, cohort.as_str(), subject_id],
        )?;
        Ok(())
    }

    fn record_otp_failure(
        &self,
        cohort: Cohort,
        subject_id: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE otp_configs SET failure_count = failure_count + 1, locked_until = ?1
             WHERE cohort = ?2 AND subject_id = ?3",
            params![locked_until.map(|d| Self::fmt(&d)), cohort.as_str(), subject_id],
        )?;
        Ok(())
    }

    fn put_backup_codes(&self, cohort: Cohort, subject_id: &str, code_hashes: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM otp_backup_codes WHERE cohort = ?1 AND subject_id = ?2",
            params![cohort.as_str(), subject_id],
        )?;
        for hash in code_hashes {
            tx.execute(
                "INSERT INTO otp_backup_codes (cohort, subject_id, code_hash, used_at) VALUES (?1,?2,?3,NULL)",
                params![cohort.as_str(), subject_id, hash],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn consume_backup_code(&self, cohort: Cohort, subject_id: &str, code_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE otp_backup_codes SET used_at = ?1
             WHERE cohort = ?2 AND subject_id = ?3 AND code_hash = ?4 AND used_at IS NULL",
            params![Self::fmt(&Utc::now()), cohort.as_str(), subject_id, code_hash],
        )?;
        Ok(rows == 1)
    }
}

impl SqliteStore {
    fn row_to_otp(row: &rusqlite::Row) -> rusqlite::Result<OtpConfig> {
        let cohort_str: String = row.get(0)?;
        let locked_until: Option<String> = row.get(6)?;
        Ok(OtpConfig {
            cohort: Cohort::from_str(&cohort_str).unwrap_or(Cohort::User),
            subject_id: row.get(1)?,
            secret_encrypted: row.get(2)?,
            verified: row.get::<_, i64>(3)? != 0,
            last_used_step: row.get(4)?,
            failure_count: row.get::<_, i64>(5)? as u32,
            locked_until: Self::parse_opt(locked_until),
        })
    }
}

impl OpaqueStateRepo for SqliteStore {
    fn get_opaque_server_state(&self) -> Result<Option<OpaqueServerState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT oprf_seed_encrypted, ake_keypair_encrypted FROM opaque_server_state WHERE id = 1",
            [],
            |row| {
                Ok(OpaqueServerState {
                    oprf_seed_encrypted: row.get(0)?,
                    ake_keypair_encrypted: row.get(1)?,
                })
            },
        )
        .optional()
        .context("get_opaque_server_state")
    }

    fn put_opaque_server_state(&self, state: &OpaqueServerState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO opaque_server_state (id, oprf_seed_encrypted, ake_keypair_encrypted) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET oprf_seed_encrypted = excluded.oprf_seed_encrypted,
                ake_keypair_encrypted = excluded.ake_keypair_encrypted",
            params![state.oprf_seed_encrypted, state.ake_keypair_encrypted],
        )?;
        Ok(())
    }
}

impl SweepRepo for SqliteStore {
    fn sweep_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Self::fmt(&Utc::now());
        let mut total = 0usize;
        total += conn.execute("DELETE FROM pending_auth WHERE expires_at < ?1", params![now])?;
        total += conn.execute("DELETE FROM auth_codes WHERE expires_at < ?1", params![now])?;
        total += conn.execute("DELETE FROM opaque_login_sessions WHERE expires_at < ?1", params![now])?;
        total += conn.execute("DELETE FROM sessions WHERE expires_at < ?1", params![now])?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SqliteStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("darkauth.sqlite3");
        let store = SqliteStore::new(&path).unwrap();
        std::mem::forget(dir);
        store
    }

    #[test]
    fn user_roundtrip() {
        let store = temp_store();
        store.create_user("sub-1", Some("a@example.com"), Some("Ada")).unwrap();
        let user = store.get_user_by_sub("sub-1").unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        assert!(!user.password_reset_required);
    }

    #[test]
    fn auth_code_single_use() {
        let store = temp_store();
        store.create_user("sub-2", None, None).unwrap();
        let code = AuthCode {
            code: "code-123".into(),
            client_id: "client-1".into(),
            user_sub: "sub-2".into(),
            redirect_uri: "https://app.example.com/cb".into(),
            nonce: None,
            code_challenge: Some("abc".into()),
            code_challenge_method: Some("S256".into()),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            consumed: false,
            has_zk: false,
            zk_pub_kid: None,
            drk_hash: None,
            amr: vec!["pwd".into()],
        };
        store.create_auth_code(&code).unwrap();
        assert!(store.consume_auth_code("code-123").unwrap());
        assert!(!store.consume_auth_code("code-123").unwrap());
    }

    #[test]
    fn refresh_token_single_use() {
        let store = temp_store();
        store.create_user("sub-3", None, None).unwrap();
        let session = store
            .create_session(Cohort::User, "sub-3", serde_json::json!({}), 900, Some("hash-1"), Some(3600))
            .unwrap();
        assert!(store.consume_refresh_token(&session.id).unwrap());
        assert!(!store.consume_refresh_token(&session.id).unwrap());
    }

    #[test]
    fn sweep_removes_expired_pending_auth() {
        let store = temp_store();
        let pending = PendingAuth {
            request_id: "req-1".into(),
            client_id: "client-1".into(),
            redirect_uri: "https://app.example.com/cb".into(),
            state: None,
            nonce: None,
            code_challenge: "abc".into(),
            code_challenge_method: "S256".into(),
            zk_pub: None,
            zk_pub_kid: None,
            origin: None,
            expires_at: Utc::now() - chrono::Duration::seconds(5),
            user_sub: None,
        };
        store.create_pending_auth(&pending).unwrap();
        let removed = store.sweep_expired().unwrap();
        assert!(removed >= 1);
        assert!(store.get_pending_auth("req-1").unwrap().is_none());
    }
}
