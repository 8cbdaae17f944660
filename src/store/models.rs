use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub password_reset_required: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OpaqueRecord {
    pub subject_id: String,
    pub envelope: Vec<u8>,
    pub server_public_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct WrappedRootKey {
    pub user_sub: String,
    pub wrapped_drk: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UserEncryptionKeys {
    pub enc_public_jwk: Option<String>,
    pub enc_private_jwk_wrapped: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminRole {
    Read,
    Write,
}

impl AdminRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminRole::Read => "read",
            AdminRole::Write => "write",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(AdminRole::Read),
            "write" => Some(AdminRole::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: AdminRole,
    pub password_reset_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Public,
    Confidential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    None,
    ClientSecretBasic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZkDelivery {
    None,
    FragmentJwe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: String,
    pub client_type: ClientType,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    /// Encrypted at rest; only present for confidential clients.
    pub client_secret_encrypted: Option<Vec<u8>>,
    pub require_pkce: bool,
    pub zk_delivery: ZkDelivery,
    pub zk_required: bool,
    pub allowed_jwe_algs: Vec<String>,
    pub allowed_jwe_encs: Vec<String>,
    pub redirect_uris: Vec<String>,
    pub allowed_zk_origins: Vec<String>,
    pub allowed_grant_types: Vec<GrantType>,
    pub id_token_lifetime_secs: u64,
    pub access_token_lifetime_secs: u64,
    pub refresh_token_lifetime_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub request_id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub zk_pub: Option<String>,
    pub zk_pub_kid: Option<String>,
    pub origin: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user_sub: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthCode {
    pub code: String,
    pub client_id: String,
    pub user_sub: String,
    pub redirect_uri: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub has_zk: bool,
    pub zk_pub_kid: Option<String>,
    pub drk_hash: Option<String>,
    pub amr: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OpaqueLoginSession {
    pub id: String,
    pub cohort: Cohort,
    pub server_state: Vec<u8>,
    pub identity_s: Vec<u8>,
    pub identity_u: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Cohort {
    User,
    Admin,
}

impl Cohort {
    pub fn as_str(self) -> &'static str {
        match self {
            Cohort::User => "user",
            Cohort::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Cohort::User),
            "admin" => Some(Cohort::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub cohort: Cohort,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub data: Value,
    pub refresh_token_hash: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_consumed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn otp_required(&self) -> bool {
        self.data
            .get("otp_required")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn otp_verified(&self) -> bool {
        self.data
            .get("otp_verified")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JwksAlg {
    RS256,
    EdDSA,
}

impl JwksAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            JwksAlg::RS256 => "RS256",
            JwksAlg::EdDSA => "EdDSA",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwksEntry {
    pub kid: String,
    pub alg: JwksAlg,
    pub public_jwk: String,
    pub private_jwk_encrypted: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub cohort: Cohort,
    pub subject_id: String,
    pub secret_encrypted: Vec<u8>,
    pub verified: bool,
    pub last_used_step: Option<i64>,
    pub failure_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OtpBackupCode {
    pub cohort: Cohort,
    pub subject_id: String,
    pub code_hash: String,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UserPasswordHistoryEntry {
    pub user_sub: String,
    pub export_key_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OpaqueServerState {
    pub oprf_seed_encrypted: Vec<u8>,
    pub ake_keypair_encrypted: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AdminAuditLogEntry {
    pub id: i64,
    pub actor_admin_id: String,
    pub action: String,
    pub target: Option<String>,
    pub created_at: DateTime<Utc>,
}
