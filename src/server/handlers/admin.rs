//! Administrative CRUD (`[SUPPLEMENT]`, Open Question decided in
//! `DESIGN.md`): directory admins provision new admin rows here; the named
//! admin then sets their own OPAQUE credential via `/admin/opaque/register/*`
//! while `password_reset_required` is still set.

use crate::error::{DarkAuthError, Result};
use crate::server::session::{clear_session_cookies, verify_csrf, AdminSession};
use crate::server::AppState;
use crate::store::{AdminRole, Cohort};
use axum::extract::State;
use axum::http::request::Parts;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateAdminRequest {
    pub email: String,
    pub name: Option<String>,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct AdminSummary {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub password_reset_required: bool,
}

pub async fn create_admin(
    State(state): State<AppState>,
    session: AdminSession,
    parts: Parts,
    jar: CookieJar,
    Json(req): Json<CreateAdminRequest>,
) -> Result<Json<AdminSummary>> {
    verify_csrf(&parts, &jar, Cohort::Admin)?;

    let caller = state
        .store
        .get_admin_by_id(&session.0.subject_id)
        .map_err(DarkAuthError::from)?
        .ok_or_else(|| DarkAuthError::Forbidden("admin record not found".into()))?;
    if caller.role != AdminRole::Write {
        return Err(DarkAuthError::Forbidden("write role required".into()));
    }

    let role = AdminRole::from_str(&req.role)
        .ok_or_else(|| DarkAuthError::Validation("role must be \"read\" or \"write\"".into()))?;
    if state
        .store
        .get_admin_by_email(&req.email)
        .map_err(DarkAuthError::from)?
        .is_some()
    {
        return Err(DarkAuthError::Conflict("admin already registered".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    state
        .store
        .create_admin(&id, &req.email, req.name.as_deref(), role)
        .map_err(DarkAuthError::from)?;
    state
        .store
        .log_admin_action(&session.0.subject_id, "create_admin", Some(&id))
        .map_err(DarkAuthError::from)?;

    Ok(Json(AdminSummary {
        id,
        email: req.email,
        name: req.name,
        role: role.as_str().to_string(),
        password_reset_required: true,
    }))
}

pub async fn list_admins(State(state): State<AppState>, _session: AdminSession) -> Result<Json<Vec<AdminSummary>>> {
    let admins = state
        .store
        .list_admins()
        .map_err(DarkAuthError::from)?
        .into_iter()
        .map(|a| AdminSummary {
            id: a.id,
            email: a.email,
            name: a.name,
            role: a.role.as_str().to_string(),
            password_reset_required: a.password_reset_required,
        })
        .collect();
    Ok(Json(admins))
}

pub async fn admin_logout(
    State(state): State<AppState>,
    session: AdminSession,
    parts: Parts,
    jar: CookieJar,
) -> Result<(CookieJar, Json<serde_json::Value>)> {
    verify_csrf(&parts, &jar, Cohort::Admin)?;
    state.store.delete_session(&session.0.id).map_err(DarkAuthError::from)?;
    let jar = clear_session_cookies(Cohort::Admin).into_iter().fold(jar, |jar, cookie| jar.add(cookie));
    Ok((jar, Json(serde_json::json!({ "ok": true }))))
}
