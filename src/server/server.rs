//! HTTP route table (spec §6). Routes are grouped by rate-limit bucket the
//! way the teacher groups them in `server.rs` — a small `Router` per bucket,
//! `GovernorLayer::new(...)` applied to that group, then merged into one
//! top-level `Router` — rather than one flat list of `.route()` calls with
//! per-route middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tracing::info;

use super::http_layers::{
    cache_request_body, extract_subject_for_rate_limit, log_requests, EmailKeyExtractor,
    IpKeyExtractor, SubjectOrIpKeyExtractor, GLOBAL_PER_MINUTE, LOGIN_PER_MINUTE, OTP_PER_MINUTE,
    TOKEN_PER_MINUTE,
};
use super::state::AppState;
use super::handlers;

/// OPAQUE register/login/password-change: keyed by the request body's
/// `email` field so a brute-force run against one account doesn't also
/// starve every other IP behind the same NAT (spec §4.7).
fn opaque_routes(state: AppState) -> Router {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (LOGIN_PER_MINUTE / 60) as u64))
            .burst_size(LOGIN_PER_MINUTE)
            .key_extractor(EmailKeyExtractor)
            .finish()
            .unwrap(),
    );

    Router::new()
        .route("/opaque/register/start", post(handlers::register_start))
        .route("/opaque/register/finish", post(handlers::register_finish))
        .route("/opaque/login/start", post(handlers::login_start))
        .route("/opaque/login/finish", post(handlers::login_finish))
        .layer(GovernorLayer::new(config))
        .with_state(state)
}

fn admin_opaque_routes(state: AppState) -> Router {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (LOGIN_PER_MINUTE / 60) as u64))
            .burst_size(LOGIN_PER_MINUTE)
            .key_extractor(EmailKeyExtractor)
            .finish()
            .unwrap(),
    );

    Router::new()
        .route("/admin/opaque/register/start", post(handlers::admin_register_start))
        .route("/admin/opaque/register/finish", post(handlers::admin_register_finish))
        .route("/admin/opaque/login/start", post(handlers::admin_login_start))
        .route("/admin/opaque/login/finish", post(handlers::admin_login_finish))
        .layer(GovernorLayer::new(config))
        .with_state(state)
}

/// Password-change is already behind an authenticated session; key by
/// subject rather than IP.
fn password_routes(state: AppState) -> Router {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (LOGIN_PER_MINUTE / 60) as u64))
            .burst_size(LOGIN_PER_MINUTE)
            .key_extractor(SubjectOrIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    Router::new()
        .route("/password/change/start", post(handlers::password_change_start))
        .route("/password/change/finish", post(handlers::password_change_finish))
        .layer(GovernorLayer::new(config))
        .with_state(state)
}

/// `/authorize`, `/finalize`, `/token`, `/userinfo`: the OIDC core.
fn oidc_routes(state: AppState) -> Router {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (TOKEN_PER_MINUTE / 60) as u64))
            .burst_size(TOKEN_PER_MINUTE)
            .key_extractor(SubjectOrIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    Router::new()
        .route("/authorize", get(handlers::authorize))
        .route("/finalize", post(handlers::finalize))
        .route("/token", post(handlers::token))
        .route("/userinfo", get(handlers::userinfo))
        .layer(GovernorLayer::new(config))
        .with_state(state)
}

/// Discovery and key material are static reads with no brute-force surface;
/// still behind the global bucket applied over the whole app below.
fn discovery_routes(state: AppState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(handlers::discovery))
        .route("/jwks", get(handlers::jwks_document))
        .with_state(state)
}

fn otp_routes(state: AppState) -> Router {
    let user_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (OTP_PER_MINUTE / 60) as u64))
            .burst_size(OTP_PER_MINUTE)
            .key_extractor(SubjectOrIpKeyExtractor)
            .finish()
            .unwrap(),
    );
    let admin_config = user_config.clone();

    let user_routes = Router::new()
        .route("/otp/setup/init", post(handlers::otp_setup_init))
        .route("/otp/setup/verify", post(handlers::otp_setup_verify))
        .route("/otp/verify", post(handlers::otp_verify))
        .route("/otp/disable", post(handlers::otp_disable))
        .route("/otp/backup/regenerate", post(handlers::otp_backup_regenerate))
        .layer(GovernorLayer::new(user_config))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/admin/otp/setup/init", post(handlers::admin_otp_setup_init))
        .route("/admin/otp/verify", post(handlers::admin_otp_verify))
        .route("/admin/otp/disable", post(handlers::admin_otp_disable))
        .route("/admin/otp/backup/regenerate", post(handlers::admin_otp_backup_regenerate))
        .layer(GovernorLayer::new(admin_config))
        .with_state(state);

    user_routes.merge(admin_routes)
}

fn crypto_routes(state: AppState) -> Router {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (GLOBAL_PER_MINUTE / 60) as u64))
            .burst_size(GLOBAL_PER_MINUTE)
            .key_extractor(SubjectOrIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    Router::new()
        .route(
            "/crypto/wrapped-drk",
            put(handlers::put_wrapped_drk).get(handlers::get_wrapped_drk),
        )
        .route("/crypto/enc-public-jwk", put(handlers::put_enc_public_jwk))
        .layer(GovernorLayer::new(config))
        .with_state(state)
}

/// `/api/users` directory search and `/admin/users`, `/admin/logout` CRUD.
fn directory_and_admin_routes(state: AppState) -> Router {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (GLOBAL_PER_MINUTE / 60) as u64))
            .burst_size(GLOBAL_PER_MINUTE)
            .key_extractor(SubjectOrIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    Router::new()
        .route("/api/users", get(handlers::search_users))
        .route("/admin/users", post(handlers::create_admin).get(handlers::list_admins))
        .route("/admin/logout", post(handlers::admin_logout))
        .layer(GovernorLayer::new(config))
        .with_state(state)
}

pub async fn make_app(state: AppState) -> anyhow::Result<Router> {
    let mut app: Router = Router::new()
        .merge(discovery_routes(state.clone()))
        .merge(oidc_routes(state.clone()))
        .merge(opaque_routes(state.clone()))
        .merge(admin_opaque_routes(state.clone()))
        .merge(password_routes(state.clone()))
        .merge(otp_routes(state.clone()))
        .merge(crypto_routes(state.clone()))
        .merge(directory_and_admin_routes(state.clone()));

    // Global bucket protects against overall abuse across every route above.
    let global_rate_limit = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (GLOBAL_PER_MINUTE / 60) as u64))
            .burst_size(GLOBAL_PER_MINUTE)
            .key_extractor(IpKeyExtractor)
            .finish()
            .unwrap(),
    );
    app = app.layer(GovernorLayer::new(global_rate_limit));

    // Subject extraction must run before the rate limiters above so their
    // `SubjectOrIpKeyExtractor`/`EmailKeyExtractor` can see it; middleware
    // layers apply bottom-up, so this is added after in source order.
    app = app.layer(middleware::from_fn_with_state(state.clone(), extract_subject_for_rate_limit));
    app = app.layer(middleware::from_fn(cache_request_body));
    app = app.layer(middleware::from_fn_with_state(state, log_requests));

    Ok(app)
}

pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = make_app(state).await?;

    info!("Starting HTTP server on port {}", port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, stopping server");
}
