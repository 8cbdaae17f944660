//! Repository traits, one per concern, combined into a blanket `FullStore`
//! trait — the same shape as the teacher's `UserStore`/`FullUserStore` split
//! in `user/user_store.rs`.

mod models;
mod schema;
mod sqlite;

pub use models::*;
pub use schema::DARKAUTH_VERSIONED_SCHEMAS;
pub use sqlite::SqliteStore;

use anyhow::Result;

pub trait UserRepo: Send + Sync {
    fn create_user(&self, sub: &str, email: Option<&str>, name: Option<&str>) -> Result<()>;
    fn get_user_by_sub(&self, sub: &str) -> Result<Option<User>>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn set_password_reset_required(&self, sub: &str, required: bool) -> Result<()>;
    /// Directory search for `/api/users`: substring match on email/name, or
    /// every user when `query` is `None`.
    fn search_users(&self, query: Option<&str>) -> Result<Vec<User>>;
}

pub trait OpaqueRecordRepo: Send + Sync {
    fn get_opaque_record(&self, subject_id: &str) -> Result<Option<OpaqueRecord>>;
    fn put_opaque_record(&self, record: &OpaqueRecord) -> Result<()>;
}

pub trait WrappedRootKeyRepo: Send + Sync {
    fn get_wrapped_drk(&self, user_sub: &str) -> Result<Option<WrappedRootKey>>;
    fn put_wrapped_drk(&self, user_sub: &str, wrapped_drk: &[u8]) -> Result<()>;
}

pub trait UserEncryptionKeysRepo: Send + Sync {
    fn get_user_encryption_keys(&self, user_sub: &str) -> Result<UserEncryptionKeys>;
    fn put_enc_public_jwk(&self, user_sub: &str, jwk: &str) -> Result<()>;
}

pub trait PasswordHistoryRepo: Send + Sync {
    fn export_key_hash_seen(&self, user_sub: &str, export_key_hash: &str) -> Result<bool>;
    fn record_export_key_hash(&self, user_sub: &str, export_key_hash: &str) -> Result<()>;
}

pub trait AdminRepo: Send + Sync {
    fn create_admin(&self, id: &str, email: &str, name: Option<&str>, role: AdminRole) -> Result<()>;
    fn get_admin_by_email(&self, email: &str) -> Result<Option<AdminUser>>;
    fn get_admin_by_id(&self, id: &str) -> Result<Option<AdminUser>>;
    fn list_admins(&self) -> Result<Vec<AdminUser>>;
    fn set_admin_password_reset_required(&self, id: &str, required: bool) -> Result<()>;
    fn get_admin_opaque_record(&self, subject_id: &str) -> Result<Option<OpaqueRecord>>;
    fn put_admin_opaque_record(&self, record: &OpaqueRecord) -> Result<()>;
    fn log_admin_action(&self, actor_admin_id: &str, action: &str, target: Option<&str>) -> Result<()>;
}

pub trait ClientRepo: Send + Sync {
    fn get_client(&self, client_id: &str) -> Result<Option<Client>>;
    fn put_client(&self, client: &Client) -> Result<()>;
}

pub trait PendingAuthRepo: Send + Sync {
    fn create_pending_auth(&self, pending: &PendingAuth) -> Result<()>;
    fn get_pending_auth(&self, request_id: &str) -> Result<Option<PendingAuth>>;
    fn bind_pending_auth_user(&self, request_id: &str, user_sub: &str) -> Result<()>;
    fn delete_pending_auth(&self, request_id: &str) -> Result<()>;
}

pub trait AuthCodeRepo: Send + Sync {
    fn create_auth_code(&self, code: &AuthCode) -> Result<()>;
    fn get_auth_code(&self, code: &str) -> Result<Option<AuthCode>>;
    /// Atomically marks the code consumed. Returns `true` iff this call won
    /// the race (`UPDATE ... WHERE consumed = 0` affected exactly one row).
    fn consume_auth_code(&self, code: &str) -> Result<bool>;
}

pub trait OpaqueLoginSessionRepo: Send + Sync {
    fn create_opaque_login_session(&self, session: &OpaqueLoginSession) -> Result<()>;
    fn get_opaque_login_session(&self, id: &str) -> Result<Option<OpaqueLoginSession>>;
    fn delete_opaque_login_session(&self, id: &str) -> Result<()>;
}

pub trait SessionRepo: Send + Sync {
    fn create_session(
        &self,
        cohort: Cohort,
        subject_id: &str,
        data: serde_json::Value,
        session_ttl_secs: u64,
        refresh_token_hash: Option<&str>,
        refresh_ttl_secs: Option<u64>,
    ) -> Result<Session>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn delete_session(&self, id: &str) -> Result<()>;
    fn patch_session_data(&self, id: &str, data: serde_json::Value) -> Result<()>;
    fn get_session_by_refresh_hash(&self, refresh_token_hash: &str) -> Result<Option<Session>>;
    /// Atomic compare-and-set: consumes the refresh token iff it is unconsumed
    /// and unexpired. Returns `true` iff this call won the race.
    fn consume_refresh_token(&self, session_id: &str) -> Result<bool>;
}

pub trait JwksRepo: Send + Sync {
    fn put_jwks_entry(&self, entry: &JwksEntry) -> Result<()>;
    fn get_active_key(&self, alg: JwksAlg) -> Result<Option<JwksEntry>>;
    fn get_all_verification_keys(&self, alg: JwksAlg) -> Result<Vec<JwksEntry>>;
    fn list_all_public_keys(&self) -> Result<Vec<JwksEntry>>;
    /// Rotates out whatever key is currently active for `entry.alg` (if any)
    /// and inserts `entry` as the new active key in a single transaction, so
    /// two concurrent rotations for the same alg can't both observe "no
    /// active key" and both insert one. The `idx_jwks_active_alg` partial
    /// unique index is the last line of defense if they still race.
    fn rotate_in(&self, entry: &JwksEntry) -> Result<()>;
}

pub trait OtpRepo: Send + Sync {
    fn get_otp_config(&self, cohort: Cohort, subject_id: &str) -> Result<Option<OtpConfig>>;
    fn put_otp_config(&self, config: &OtpConfig) -> Result<()>;
    fn delete_otp_config(&self, cohort: Cohort, subject_id: &str) -> Result<()>;
    fn record_otp_success(&self, cohort: Cohort, subject_id: &str, step: i64) -> Result<()>;
    fn record_otp_failure(&self, cohort: Cohort, subject_id: &str, locked_until: Option<chrono::DateTime<chrono::Utc>>) -> Result<()>;
    fn put_backup_codes(&self, cohort: Cohort, subject_id: &str, code_hashes: &[String]) -> Result<()>;
    fn consume_backup_code(&self, cohort: Cohort, subject_id: &str, code_hash: &str) -> Result<bool>;
}

pub trait OpaqueStateRepo: Send + Sync {
    fn get_opaque_server_state(&self) -> Result<Option<OpaqueServerState>>;
    fn put_opaque_server_state(&self, state: &OpaqueServerState) -> Result<()>;
}

pub trait SweepRepo: Send + Sync {
    /// Deletes expired `pending_auth`, `auth_code`, and `opaque_login_session`
    /// rows. Returns the number of rows removed. Correctness never depends on
    /// this being called; it is storage hygiene only (spec.md §5).
    fn sweep_expired(&self) -> Result<usize>;
}

pub trait Store:
    UserRepo
    + OpaqueRecordRepo
    + WrappedRootKeyRepo
    + UserEncryptionKeysRepo
    + PasswordHistoryRepo
    + AdminRepo
    + ClientRepo
    + PendingAuthRepo
    + AuthCodeRepo
    + OpaqueLoginSessionRepo
    + SessionRepo
    + JwksRepo
    + OtpRepo
    + OpaqueStateRepo
    + SweepRepo
{
}

impl<T> Store for T where
    T: UserRepo
        + OpaqueRecordRepo
        + WrappedRootKeyRepo
        + UserEncryptionKeysRepo
        + PasswordHistoryRepo
        + AdminRepo
        + ClientRepo
        + PendingAuthRepo
        + AuthCodeRepo
        + OpaqueLoginSessionRepo
        + SessionRepo
        + JwksRepo
        + OtpRepo
        + OpaqueStateRepo
        + SweepRepo
{
}

/// Kept as an alias for the combined trait so call sites reading
/// `Arc<dyn FullStore>` mirror the teacher's `FullUserStore` naming.
pub trait FullStore: Store {}
impl<T: Store> FullStore for T {}
