use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_ref, get_opt_bool, get_opt_text, get_required_str, get_required_text, now_rfc3339,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let bootstrap = state.current_session.is_none();
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let full_name = match get_required_text(&req.params, "fullName") {
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
    if password.len() < MIN_PASSWORD_LEN {
        return err(
            &req.id,
            "bad_params",
            format!("password must be at least {} characters", MIN_PASSWORD_LEN),
            None,
        );
    }

    // The first account in a workspace is always the admin that will
    // create everyone else.
    let role = if bootstrap {
        auth::Role::Admin
    } else {
        let raw = get_opt_text(&req.params, "role").unwrap_or_else(|| "instructor".to_string());
        match auth::Role::parse(&raw) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be admin or instructor",
                    None,
                )
            }
        }
    };

    match row_exists(conn, "SELECT 1 FROM users WHERE email = ?", &email) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "a user with this email already exists",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return e.response(&req.id),
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, &password);
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, email, full_name, role, password_salt, password_hash, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (&user_id, &email, &full_name, role.as_str(), &salt, &hash, now_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    tracing::info!(user = %user_id, role = role.as_str(), bootstrap, "user created");
    ok(
        &req.id,
        json!({ "userId": user_id, "email": email, "role": role.as_str() }),
    )
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.email, u.full_name, u.role, u.active, u.created_at,
           (SELECT COUNT(*) FROM course_instructors ci WHERE ci.user_id = u.id) AS course_count
         FROM users u
         ORDER BY u.full_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "email": row.get::<_, String>(1)?,
                "fullName": row.get::<_, String>(2)?,
                "role": row.get::<_, String>(3)?,
                "active": row.get::<_, i64>(4)? != 0,
                "createdAt": row.get::<_, String>(5)?,
                "courseCount": row.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn other_active_admins(conn: &Connection, user_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin' AND active = 1 AND id != ?",
        [user_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = match get_required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let result = (|| -> Result<(bool, bool), HandlerErr> {
        let conn = db_ref(state)?;
        let current_role: Option<String> = {
            use rusqlite::OptionalExtension;
            conn.query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?
        };
        let Some(current_role) = current_role else {
            return Err(HandlerErr::not_found("user not found"));
        };

        let new_role = match get_opt_text(&req.params, "role") {
            Some(raw) => match auth::Role::parse(&raw) {
                Some(r) => Some(r),
                None => return Err(HandlerErr::bad_params("role must be admin or instructor")),
            },
            None => None,
        };
        let new_active = get_opt_bool(&req.params, "active")?;
        let new_full_name = get_opt_text(&req.params, "fullName");
        let new_password = req
            .params
            .get("password")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        // Never let the workspace end up without a usable admin.
        let losing_admin = current_role == "admin"
            && (matches!(new_role, Some(auth::Role::Instructor)) || new_active == Some(false));
        if losing_admin && other_active_admins(conn, &user_id)? == 0 {
            return Err(HandlerErr::conflict("cannot remove the last active admin"));
        }

        if let Some(name) = &new_full_name {
            conn.execute("UPDATE users SET full_name = ? WHERE id = ?", (name, &user_id))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if let Some(role) = new_role {
            conn.execute(
                "UPDATE users SET role = ? WHERE id = ?",
                (role.as_str(), &user_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if let Some(active) = new_active {
            conn.execute(
                "UPDATE users SET active = ? WHERE id = ?",
                (if active { 1 } else { 0 }, &user_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        let password_changed = if let Some(password) = new_password {
            if password.len() < MIN_PASSWORD_LEN {
                return Err(HandlerErr::bad_params(format!(
                    "password must be at least {} characters",
                    MIN_PASSWORD_LEN
                )));
            }
            let salt = auth::new_salt();
            let hash = auth::hash_password(&salt, &password);
            conn.execute(
                "UPDATE users SET password_salt = ?, password_hash = ? WHERE id = ?",
                (&salt, &hash, &user_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            true
        } else {
            false
        };

        let deactivated = new_active == Some(false);
        Ok((password_changed, deactivated))
    })();

    match result {
        Ok((password_changed, deactivated)) => {
            if password_changed || deactivated {
                state.sessions.revoke_user(&user_id);
            }
            ok(&req.id, json!({ "userId": user_id, "updated": true }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = match get_required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let result = (|| -> Result<(), HandlerErr> {
        let conn = db_ref(state)?;
        if !row_exists(conn, "SELECT 1 FROM users WHERE id = ?", &user_id)? {
            return Err(HandlerErr::not_found("user not found"));
        }
        // History stays attributable: accounts with recorded work are
        // deactivated, never deleted.
        if row_exists(
            conn,
            "SELECT 1 FROM attendance WHERE recorded_by = ? LIMIT 1",
            &user_id,
        )? {
            return Err(HandlerErr::conflict(
                "user has recorded attendance; deactivate instead",
            ));
        }
        if row_exists(
            conn,
            "SELECT 1 FROM evaluations WHERE evaluator_id = ? LIMIT 1",
            &user_id,
        )? {
            return Err(HandlerErr::conflict(
                "user has recorded evaluations; deactivate instead",
            ));
        }
        let current_role: String = conn
            .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| {
                r.get(0)
            })
            .map_err(HandlerErr::db_query)?;
        if current_role == "admin" && other_active_admins(conn, &user_id)? == 0 {
            return Err(HandlerErr::conflict("cannot delete the last active admin"));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for (sql, table) in [
            ("DELETE FROM password_resets WHERE user_id = ?", "password_resets"),
            ("DELETE FROM course_instructors WHERE user_id = ?", "course_instructors"),
            ("DELETE FROM users WHERE id = ?", "users"),
        ] {
            if let Err(e) = tx.execute(sql, [&user_id]) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": table })));
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            state.sessions.revoke_user(&user_id);
            ok(&req.id, json!({ "deleted": true }))
        }
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
