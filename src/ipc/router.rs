use super::handlers;
use super::types::{AppState, Request};
use crate::auth::Role;
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    state.current_session = None;
    match resolve_access(state, &req) {
        Ok(session) => state.current_session = session,
        Err(resp) => return resp,
    }

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::users::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::courses::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::lessons::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::skills::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::evaluations::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backup::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

fn is_open_method(method: &str) -> bool {
    matches!(
        method,
        "health" | "workspace.select" | "auth.login" | "auth.requestPasswordReset" | "auth.resetPassword"
    )
}

fn requires_admin(method: &str) -> bool {
    method.starts_with("users.") || method.starts_with("backup.")
}

fn resolve_access(
    state: &AppState,
    req: &Request,
) -> Result<Option<crate::auth::Session>, serde_json::Value> {
    if is_open_method(&req.method) {
        return Ok(None);
    }
    // Bootstrap: the very first account is created without a session and
    // the handler forces it to be an admin.
    if req.method == "users.create" {
        if state.db.is_none() {
            return Err(err(&req.id, "no_workspace", "select a workspace first", None));
        }
        if users_table_empty(state) {
            return Ok(None);
        }
    }

    let Some(token) = req.params.get("sessionToken").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "unauthorized", "missing sessionToken", None));
    };
    let Some(session) = state.sessions.get(token) else {
        return Err(err(&req.id, "unauthorized", "invalid or expired session", None));
    };
    if requires_admin(&req.method) && session.role != Role::Admin {
        return Err(err(&req.id, "forbidden", "admin role required", None));
    }
    Ok(Some(session.clone()))
}

fn users_table_empty(state: &AppState) -> bool {
    let Some(conn) = state.db.as_ref() else {
        return false;
    };
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get::<_, i64>(0))
        .map(|n| n == 0)
        .unwrap_or(false)
}
