mod handlers;
mod http_layers;
mod server;
mod session;
mod state;

pub use http_layers::*;
pub use server::{make_app, run_server};
pub use session::{
    clear_session_cookies, session_cookies, verify_csrf, AdminSession, OptionalSubject,
    UserSession, ADMIN_CSRF_COOKIE, ADMIN_SESSION_COOKIE, CSRF_HEADER, USER_CSRF_COOKIE,
    USER_SESSION_COOKIE,
};
pub use state::AppState;
