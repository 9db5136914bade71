use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_ref, get_required_str, get_required_text, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, Utc};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const RESET_TOKEN_TTL_HOURS: i64 = 24;
const MIN_PASSWORD_LEN: usize = 8;

struct UserRow {
    id: String,
    email: String,
    full_name: String,
    role: String,
    salt: String,
    hash: String,
    active: bool,
}

fn find_user_by_email(
    conn: &rusqlite::Connection,
    email: &str,
) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, email, full_name, role, password_salt, password_hash, active
         FROM users WHERE email = ?",
        [email],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                email: r.get(1)?,
                full_name: r.get(2)?,
                role: r.get(3)?,
                salt: r.get(4)?,
                hash: r.get(5)?,
                active: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let email = match get_required_text(&req.params, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e.response(&req.id),
    };
    let password = match get_required_str(&req.params, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user = match find_user_by_email(conn, &email) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    // One answer for unknown email, wrong password, and disabled account.
    let denied = || err(&req.id, "unauthorized", "invalid credentials", None);
    let Some(user) = user else {
        tracing::warn!(email = %email, "login rejected: unknown email");
        return denied();
    };
    if !user.active || !auth::verify_password(&user.salt, &password, &user.hash) {
        tracing::warn!(email = %email, "login rejected");
        return denied();
    }
    let Some(role) = auth::Role::parse(&user.role) else {
        return err(&req.id, "db_query_failed", "user has unknown role", None);
    };

    let token = state.sessions.issue(&user.id, &user.email, role);
    ok(
        &req.id,
        json!({
            "sessionToken": token,
            "user": {
                "id": user.id,
                "email": user.email,
                "fullName": user.full_name,
                "role": user.role,
            }
        }),
    )
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(token) = req.params.get("sessionToken").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing sessionToken", None);
    };
    let token = token.to_string();
    state.sessions.revoke(&token);
    state.current_session = None;
    ok(&req.id, json!({ "loggedOut": true }))
}

fn handle_me(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.current_session.as_ref() else {
        return err(&req.id, "unauthorized", "no active session", None);
    };
    ok(
        &req.id,
        json!({
            "userId": session.user_id,
            "email": session.email,
            "role": session.role.as_str(),
        }),
    )
}

fn handle_request_password_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let email = match get_required_text(&req.params, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e.response(&req.id),
    };

    let user = match find_user_by_email(conn, &email) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    // Unknown emails still answer ok; the daemon has no mailer, the caller
    // delivers the token when one is present.
    let Some(user) = user else {
        return ok(&req.id, json!({ "requested": true }));
    };
    if !user.active {
        return ok(&req.id, json!({ "requested": true }));
    }

    let token = Uuid::new_v4().to_string();
    let expires_at = (Utc::now() + Duration::hours(RESET_TOKEN_TTL_HOURS)).to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO password_resets(token, user_id, expires_at, used) VALUES(?, ?, ?, 0)",
        (&token, &user.id, &expires_at),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "requested": true, "token": token, "expiresAt": expires_at }),
    )
}

fn handle_reset_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let token = match get_required_text(&req.params, "token") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let new_password = match get_required_str(&req.params, "newPassword") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if new_password.len() < MIN_PASSWORD_LEN {
        return err(
            &req.id,
            "bad_params",
            format!("newPassword must be at least {} characters", MIN_PASSWORD_LEN),
            None,
        );
    }

    let row: Option<(String, String, i64)> = match conn
        .query_row(
            "SELECT user_id, expires_at, used FROM password_resets WHERE token = ?",
            [&token],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((user_id, expires_at, used)) = row else {
        return err(&req.id, "not_found", "unknown reset token", None);
    };
    if used != 0 {
        return err(&req.id, "conflict", "reset token already used", None);
    }
    let expired = chrono::DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t < Utc::now())
        .unwrap_or(true);
    if expired {
        return err(&req.id, "conflict", "reset token expired", None);
    }

    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &new_password);
    if let Err(e) = conn.execute(
        "UPDATE users SET password_salt = ?, password_hash = ? WHERE id = ?",
        (&salt, &hash, &user_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = conn.execute(
        "UPDATE password_resets SET used = 1 WHERE token = ?",
        [&token],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // A password change ends every existing session for the account.
    state.sessions.revoke_user(&user_id);
    tracing::info!(user = %user_id, "password reset completed");
    ok(&req.id, json!({ "reset": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.me" => Some(handle_me(state, req)),
        "auth.requestPasswordReset" => Some(handle_request_password_reset(state, req)),
        "auth.resetPassword" => Some(handle_reset_password(state, req)),
        _ => None,
    }
}
