use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_ref, get_opt_bool, get_opt_f64, get_opt_text, get_required_str, get_required_text,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn validate_points(max_points: f64, pass_points: f64) -> Result<(), HandlerErr> {
    if max_points <= 0.0 {
        return Err(HandlerErr::bad_params("maxPoints must be positive"));
    }
    if pass_points < 0.0 || pass_points > max_points {
        return Err(HandlerErr::bad_params(
            "passPoints must be in 0..=maxPoints",
        ));
    }
    Ok(())
}

fn handle_skills_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let mut stmt = conn
            .prepare(
                "SELECT sk.id, sk.code, sk.name, sk.category, sk.critical, sk.max_points, sk.pass_points,
                   (SELECT COUNT(*) FROM evaluation_items ei WHERE ei.skill_id = sk.id) AS item_count
                 FROM skills sk
                 ORDER BY sk.code",
            )
            .map_err(HandlerErr::db_query)?;
        let skills = stmt
            .query_map([], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "code": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "category": r.get::<_, Option<String>>(3)?,
                    "critical": r.get::<_, i64>(4)? != 0,
                    "maxPoints": r.get::<_, f64>(5)?,
                    "passPoints": r.get::<_, f64>(6)?,
                    "itemCount": r.get::<_, i64>(7)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "skills": skills }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_skills_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let code = get_required_text(&req.params, "code")?.to_ascii_uppercase();
        let name = get_required_text(&req.params, "name")?;
        let category = get_opt_text(&req.params, "category");
        let critical = get_opt_bool(&req.params, "critical")?.unwrap_or(false);
        let max_points = get_opt_f64(&req.params, "maxPoints")?.unwrap_or(5.0);
        let pass_points = get_opt_f64(&req.params, "passPoints")?.unwrap_or(3.0);
        validate_points(max_points, pass_points)?;

        if row_exists(conn, "SELECT 1 FROM skills WHERE code = ?", &code)? {
            return Err(HandlerErr::conflict("a skill with this code already exists"));
        }

        let skill_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO skills(id, code, name, category, critical, max_points, pass_points)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &skill_id,
                &code,
                &name,
                &category,
                if critical { 1 } else { 0 },
                max_points,
                pass_points,
            ],
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "skills" }))
        })?;
        Ok(json!({ "skillId": skill_id, "code": code }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_skills_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let skill_id = get_required_str(&req.params, "skillId")?;
        let current: Option<(f64, f64)> = {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT max_points, pass_points FROM skills WHERE id = ?",
                [&skill_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(HandlerErr::db_query)?
        };
        let Some((cur_max, cur_pass)) = current else {
            return Err(HandlerErr::not_found("skill not found"));
        };

        let max_points = get_opt_f64(&req.params, "maxPoints")?.unwrap_or(cur_max);
        let pass_points = get_opt_f64(&req.params, "passPoints")?.unwrap_or(cur_pass);
        validate_points(max_points, pass_points)?;
        conn.execute(
            "UPDATE skills SET max_points = ?, pass_points = ? WHERE id = ?",
            (max_points, pass_points, &skill_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

        if let Some(name) = get_opt_text(&req.params, "name") {
            conn.execute("UPDATE skills SET name = ? WHERE id = ?", (&name, &skill_id))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if req.params.get("category").is_some() {
            let category = get_opt_text(&req.params, "category");
            conn.execute(
                "UPDATE skills SET category = ? WHERE id = ?",
                (&category, &skill_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        if let Some(critical) = get_opt_bool(&req.params, "critical")? {
            conn.execute(
                "UPDATE skills SET critical = ? WHERE id = ?",
                (if critical { 1 } else { 0 }, &skill_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }

        Ok(json!({ "skillId": skill_id, "updated": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_skills_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let skill_id = get_required_str(&req.params, "skillId")?;
        if !row_exists(conn, "SELECT 1 FROM skills WHERE id = ?", &skill_id)? {
            return Err(HandlerErr::not_found("skill not found"));
        }
        if row_exists(
            conn,
            "SELECT 1 FROM evaluation_items WHERE skill_id = ? LIMIT 1",
            &skill_id,
        )? {
            return Err(HandlerErr::conflict(
                "evaluations reference this skill; it cannot be deleted",
            ));
        }
        conn.execute("DELETE FROM skills WHERE id = ?", [&skill_id])
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
        Ok(json!({ "deleted": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "skills.list" => Some(handle_skills_list(state, req)),
        "skills.create" => Some(handle_skills_create(state, req)),
        "skills.update" => Some(handle_skills_update(state, req)),
        "skills.delete" => Some(handle_skills_delete(state, req)),
        _ => None,
    }
}
