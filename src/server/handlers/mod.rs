//! HTTP handlers, one module per route group (spec §6). Route wiring lives
//! in `server::server`; these stay framework-thin, delegating domain logic
//! to `opaque_engine`, `oidc`, `otp`, `jwks`, and the store traits.

mod admin;
mod crypto_routes;
mod oidc_routes;
mod opaque;
mod otp_routes;
mod password;
mod users;

pub use admin::{admin_logout, create_admin, list_admins};
pub use crypto_routes::{get_wrapped_drk, put_enc_public_jwk, put_wrapped_drk};
pub use oidc_routes::{authorize, discovery, finalize, jwks_document, token, userinfo};
pub use opaque::{
    admin_login_finish, admin_login_start, admin_register_finish, admin_register_start,
    login_finish, login_start, register_finish, register_start,
};
pub use otp_routes::{
    admin_otp_backup_regenerate, admin_otp_disable, admin_otp_setup_init, admin_otp_verify,
    otp_backup_regenerate, otp_disable, otp_setup_init, otp_setup_verify, otp_verify,
};
pub use password::{password_change_finish, password_change_start};
pub use users::search_users;
