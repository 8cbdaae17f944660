//! End-to-end coverage driven straight through `make_app`'s `Router` via
//! `tower::ServiceExt::oneshot`, the same no-TCP harness shape the teacher's
//! own `server/server.rs` test module uses for its `MockServerStore` cases.
//! OPAQUE is driven client-side with `opaque_ke`'s public API, mirroring
//! `opaque_engine.rs`'s own `#[cfg(test)]` roundtrip.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use darkauth::config::{AppConfig, OtpSettings, SessionSettings, SweeperSettings};
use darkauth::crypto::{b64url_decode, b64url_encode, random_bytes, sha256};
use darkauth::jwks;
use darkauth::opaque_engine::OpaqueEngine;
use darkauth::server::{make_app, AppState, RequestsLoggingLevel};
use darkauth::store::{
    Client, ClientType, Cohort, FullStore, GrantType, JwksAlg, OtpConfig, SqliteStore,
    TokenEndpointAuthMethod, ZkDelivery,
};
use opaque_ke::{
    ClientLogin, ClientLoginFinishParameters, ClientRegistration, ClientRegistrationFinishParameters,
    CredentialResponse, RegistrationResponse,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

type Cs = darkauth::opaque_engine::DarkAuthCipherSuite;

fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn FullStore> = Arc::new(SqliteStore::new(dir.path().join("darkauth.db")).unwrap());
    let kek = [7u8; 32];
    let opaque_engine = Arc::new(OpaqueEngine::load_or_init(store.as_ref(), &kek).unwrap());
    jwks::rotate_signing_key(store.as_ref(), &kek, JwksAlg::RS256).unwrap();

    let config = AppConfig {
        db_dir: dir.path().to_path_buf(),
        port: 0,
        issuer: "https://darkauth.test".to_string(),
        logging_level: RequestsLoggingLevel::default(),
        kek_env_var: None,
        self_registration_enabled: true,
        session: SessionSettings::default(),
        otp: OtpSettings::default(),
        sweeper: SweeperSettings::default(),
    };
    let discovery_document = Arc::new(darkauth::oidc::discovery_document(&config.issuer));

    let state = AppState {
        store,
        config,
        kek,
        opaque_engine,
        discovery_document,
        start_time: std::time::Instant::now(),
    };
    (state, dir)
}

fn test_client(client_id: &str, redirect_uri: &str) -> Client {
    Client {
        client_id: client_id.to_string(),
        client_type: ClientType::Public,
        token_endpoint_auth_method: TokenEndpointAuthMethod::None,
        client_secret_encrypted: None,
        require_pkce: true,
        zk_delivery: ZkDelivery::None,
        zk_required: false,
        allowed_jwe_algs: vec![],
        allowed_jwe_encs: vec![],
        redirect_uris: vec![redirect_uri.to_string()],
        allowed_zk_origins: vec![],
        allowed_grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
        id_token_lifetime_secs: 300,
        access_token_lifetime_secs: 300,
        refresh_token_lifetime_secs: Some(3600),
    }
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, reqwest_free::Headers, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = reqwest_free::Headers::from(&response);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, headers, body)
}

/// Tiny stand-in for a header-grabbing response wrapper; named oddly on
/// purpose to make clear no HTTP client crate is involved, only `axum`'s own
/// `http` types already in the dependency graph.
mod reqwest_free {
    use axum::http::HeaderMap;

    pub struct Headers(HeaderMap);

    impl Headers {
        pub fn from(response: &axum::response::Response) -> Self {
            Headers(response.headers().clone())
        }

        pub fn set_cookies(&self) -> Vec<String> {
            self.0
                .get_all(axum::http::header::SET_COOKIE)
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect()
        }
    }
}

fn cookie_value(set_cookies: &[String], name: &str) -> Option<String> {
    set_cookies.iter().find_map(|raw| {
        let first = raw.split(';').next()?;
        let (k, v) = first.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// `oneshot()` skips the TCP accept loop, so nothing populates
/// `ConnectInfo<SocketAddr>` the way `into_make_service_with_connect_info`
/// does in `run_server`; the IP-keyed rate limiters need it present to
/// extract a key at all, so every request carries a fixed loopback stand-in.
fn test_peer_addr() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999)))
}

fn json_request(method: &str, uri: &str, cookie_header: Option<&str>, csrf: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
    if let Some(c) = cookie_header {
        builder = builder.header("cookie", c);
    }
    if let Some(t) = csrf {
        builder = builder.header("x-csrf-token", t);
    }
    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    request.extensions_mut().insert(test_peer_addr());
    request
}

fn get_request(uri: &str, cookie_header: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(c) = cookie_header {
        builder = builder.header("cookie", c);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    request.extensions_mut().insert(test_peer_addr());
    request
}

/// Registers `email`/`password` and returns the freshly minted `sub`.
async fn register_user(app: &Router, email: &str, password: &[u8]) -> String {
    let mut rng = rand::rngs::OsRng;
    let reg_start = ClientRegistration::<Cs>::start(&mut rng, password).unwrap();
    let (status, _, body) = call(
        app,
        json_request(
            "POST",
            "/opaque/register/start",
            None,
            None,
            json!({ "email": email, "registration_request": b64url_encode(&reg_start.message.serialize()) }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let server_response = RegistrationResponse::<Cs>::deserialize(
        &b64url_decode(body["registration_response"].as_str().unwrap()).unwrap(),
    )
    .unwrap();
    let reg_finish = reg_start
        .state
        .finish(&mut rng, password, server_response, ClientRegistrationFinishParameters::default())
        .unwrap();

    let wrapped_drk = random_bytes(darkauth::crypto::WRAPPED_DRK_LEN);
    let (status, _, body) = call(
        app,
        json_request(
            "POST",
            "/opaque/register/finish",
            None,
            None,
            json!({
                "email": email,
                "registration_upload": b64url_encode(&reg_finish.message.serialize()),
                "wrapped_drk": b64url_encode(&wrapped_drk),
                "name": "Test User",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register_finish failed: {body}");
    body["sub"].as_str().unwrap().to_string()
}

/// Logs in and returns `(session_cookie_header, csrf_token, otp_required)`.
async fn login_user(app: &Router, email: &str, password: &[u8]) -> (String, String, bool) {
    let mut rng = rand::rngs::OsRng;
    let login_start = ClientLogin::<Cs>::start(&mut rng, password).unwrap();
    let (status, _, body) = call(
        app,
        json_request(
            "POST",
            "/opaque/login/start",
            None,
            None,
            json!({ "email": email, "credential_request": b64url_encode(&login_start.message.serialize()) }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login_start failed: {body}");
    let login_session_id = body["login_session_id"].as_str().unwrap().to_string();
    let server_response = CredentialResponse::<Cs>::deserialize(
        &b64url_decode(body["credential_response"].as_str().unwrap()).unwrap(),
    )
    .unwrap();
    let login_finish = login_start.state.finish(password, server_response, ClientLoginFinishParameters::default()).unwrap();

    let (status, headers, body) = call(
        app,
        json_request(
            "POST",
            "/opaque/login/finish",
            None,
            None,
            json!({
                "login_session_id": login_session_id,
                "credential_finalization": b64url_encode(&login_finish.message.serialize()),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login_finish failed: {body}");
    let set_cookies = headers.set_cookies();
    let session = cookie_value(&set_cookies, "__Host-DarkAuth").unwrap();
    let csrf = cookie_value(&set_cookies, "__Host-DarkAuth-CSRF").unwrap();
    let cookie_header = format!("__Host-DarkAuth={session}; __Host-DarkAuth-CSRF={csrf}");
    (cookie_header, csrf, body["otp_required"].as_bool().unwrap())
}

#[tokio::test]
async fn register_login_and_wrapped_drk_roundtrip() {
    let (state, _dir) = test_state();
    let app = make_app(state).await.unwrap();
    let password = random_bytes(32);

    register_user(&app, "alice@example.com", &password).await;
    let (cookie_header, _csrf, otp_required) = login_user(&app, "alice@example.com", &password).await;
    assert!(!otp_required);

    let (status, _, body) = call(&app, get_request("/crypto/wrapped-drk", Some(&cookie_header))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["wrapped_drk"].as_str().is_some());
}

#[tokio::test]
async fn authorization_code_grant_and_refresh_rotation() {
    let (state, _dir) = test_state();
    let store = state.store.clone();
    let issuer = state.config.issuer.clone();
    store.put_client(&test_client("spa", "https://app.example.com/callback")).unwrap();

    let app = make_app(state).await.unwrap();
    let password = random_bytes(32);
    register_user(&app, "bob@example.com", &password).await;
    let (cookie_header, csrf, otp_required) = login_user(&app, "bob@example.com", &password).await;
    assert!(!otp_required);

    let code_verifier = "a-pretty-long-pkce-verifier-string-1234567890";
    let code_challenge = b64url_encode(&sha256(code_verifier.as_bytes()));
    let authorize_uri = format!(
        "/authorize?client_id=spa&redirect_uri=https%3A%2F%2Fapp.example.com%2Fcallback&response_type=code&code_challenge={code_challenge}&code_challenge_method=S256"
    );
    let (status, _, body) = call(&app, get_request(&authorize_uri, None)).await;
    assert_eq!(status, StatusCode::OK, "authorize failed: {body}");
    let request_id = body["request_id"].as_str().unwrap().to_string();

    let (status, _, body) = call(
        &app,
        json_request(
            "POST",
            "/finalize",
            Some(&cookie_header),
            Some(&csrf),
            json!({ "request_id": request_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "finalize failed: {body}");
    let code = body["code"].as_str().unwrap().to_string();

    let (status, _, body) = call(
        &app,
        json_request(
            "POST",
            "/token",
            None,
            None,
            json!({
                "grant_type": "authorization_code",
                "client_id": "spa",
                "code": code,
                "redirect_uri": "https://app.example.com/callback",
                "code_verifier": code_verifier,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "token exchange failed: {body}");
    let id_token = body["id_token"].as_str().unwrap();
    let payload_b64 = id_token.split('.').nth(1).unwrap();
    use base64::Engine;
    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64).unwrap();
    let payload: Value = serde_json::from_slice(&payload_bytes).unwrap();
    assert_eq!(payload["iss"].as_str().unwrap(), issuer);

    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();

    let (status, _, body) = call(
        &app,
        json_request("POST", "/token", None, None, json!({ "grant_type": "refresh_token", "refresh_token": refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "refresh failed: {body}");
    assert!(body["access_token"].as_str().is_some());

    // Single-use rotation (spec P-property): reusing the same refresh token
    // a second time must be refused, not silently succeed again.
    let (status, _, body) = call(
        &app,
        json_request("POST", "/token", None, None, json!({ "grant_type": "refresh_token", "refresh_token": refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "reused refresh token should be rejected: {body}");
}

#[tokio::test]
async fn finalize_rejects_when_otp_required_but_not_verified() {
    let (state, _dir) = test_state();
    let store = state.store.clone();
    store.put_client(&test_client("spa", "https://app.example.com/callback")).unwrap();

    let app = make_app(state).await.unwrap();
    let password = random_bytes(32);
    let sub = register_user(&app, "carol@example.com", &password).await;

    store
        .put_otp_config(&OtpConfig {
            cohort: Cohort::User,
            subject_id: sub,
            secret_encrypted: random_bytes(32),
            verified: true,
            last_used_step: None,
            failure_count: 0,
            locked_until: None,
        })
        .unwrap();

    let (cookie_header, csrf, otp_required) = login_user(&app, "carol@example.com", &password).await;
    assert!(otp_required);

    let code_verifier = "another-pretty-long-pkce-verifier-0987654321";
    let code_challenge = b64url_encode(&sha256(code_verifier.as_bytes()));
    let authorize_uri = format!(
        "/authorize?client_id=spa&redirect_uri=https%3A%2F%2Fapp.example.com%2Fcallback&response_type=code&code_challenge={code_challenge}&code_challenge_method=S256"
    );
    let (status, _, body) = call(&app, get_request(&authorize_uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    let request_id = body["request_id"].as_str().unwrap().to_string();

    let (status, _, body) = call(
        &app,
        json_request("POST", "/finalize", Some(&cookie_header), Some(&csrf), json!({ "request_id": request_id })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "finalize should be blocked pending OTP: {body}");
}

#[tokio::test]
async fn finalize_without_csrf_header_is_rejected() {
    let (state, _dir) = test_state();
    let app = make_app(state).await.unwrap();
    let password = random_bytes(32);
    register_user(&app, "dave@example.com", &password).await;
    let (cookie_header, _csrf, _otp_required) = login_user(&app, "dave@example.com", &password).await;

    let (status, _, _) = call(
        &app,
        json_request("POST", "/finalize", Some(&cookie_header), None, json!({ "request_id": "does-not-matter" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
