use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_ref, get_opt_date, get_opt_i64, get_opt_text, get_required_str, get_required_text,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde_json::json;
use uuid::Uuid;

const KINDS: [&str; 3] = ["classroom", "pool", "open_water"];

fn validate_kind(raw: &str) -> Result<String, HandlerErr> {
    if KINDS.contains(&raw) {
        Ok(raw.to_string())
    } else {
        Err(HandlerErr::bad_params(
            "kind must be one of: classroom, pool, open_water",
        ))
    }
}

fn handle_lessons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        let mut stmt = conn
            .prepare(
                "SELECT l.id, l.idx, l.date, l.title, l.kind, l.duration_min, l.location, l.note,
                   (SELECT COUNT(*) FROM attendance a WHERE a.lesson_id = l.id) AS attendance_count
                 FROM lessons l
                 WHERE l.course_id = ?
                 ORDER BY l.idx",
            )
            .map_err(HandlerErr::db_query)?;
        let lessons = stmt
            .query_map([&course_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "idx": r.get::<_, i64>(1)?,
                    "date": r.get::<_, Option<String>>(2)?,
                    "title": r.get::<_, String>(3)?,
                    "kind": r.get::<_, String>(4)?,
                    "durationMin": r.get::<_, Option<i64>>(5)?,
                    "location": r.get::<_, Option<String>>(6)?,
                    "note": r.get::<_, Option<String>>(7)?,
                    "attendanceCount": r.get::<_, i64>(8)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "lessons": lessons }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_lessons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        let title = get_required_text(&req.params, "title")?;
        let kind = validate_kind(&get_required_text(&req.params, "kind")?)?;
        let date = get_opt_date(&req.params, "date")?;
        let duration_min = get_opt_i64(&req.params, "durationMin")?;
        if let Some(d) = duration_min {
            if d < 1 {
                return Err(HandlerErr::bad_params("durationMin must be positive"));
            }
        }
        let location = get_opt_text(&req.params, "location");
        let note = get_opt_text(&req.params, "note");

        let next_idx: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(idx), 0) + 1 FROM lessons WHERE course_id = ?",
                [&course_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query)?;

        let lesson_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO lessons(id, course_id, idx, date, title, kind, duration_min, location, note)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &lesson_id,
                &course_id,
                next_idx,
                &date,
                &title,
                &kind,
                duration_min,
                &location,
                &note,
            ],
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "lessons" }))
        })?;

        Ok(json!({ "lessonId": lesson_id, "idx": next_idx }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_lessons_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        if !row_exists(conn, "SELECT 1 FROM lessons WHERE id = ?", &lesson_id)? {
            return Err(HandlerErr::not_found("lesson not found"));
        }

        // Validate every field before touching the row; one UPDATE or none.
        let mut fields: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(title) = get_opt_text(&req.params, "title") {
            fields.push("title = ?".to_string());
            values.push(SqlValue::Text(title));
        }
        if let Some(raw) = get_opt_text(&req.params, "kind") {
            let kind = validate_kind(&raw)?;
            fields.push("kind = ?".to_string());
            values.push(SqlValue::Text(kind));
        }
        if req.params.get("date").is_some() {
            fields.push("date = ?".to_string());
            values.push(match get_opt_date(&req.params, "date")? {
                Some(d) => SqlValue::Text(d),
                None => SqlValue::Null,
            });
        }
        if req.params.get("durationMin").is_some() {
            let duration_min = get_opt_i64(&req.params, "durationMin")?;
            if let Some(d) = duration_min {
                if d < 1 {
                    return Err(HandlerErr::bad_params("durationMin must be positive"));
                }
            }
            fields.push("duration_min = ?".to_string());
            values.push(match duration_min {
                Some(d) => SqlValue::Integer(d),
                None => SqlValue::Null,
            });
        }
        for (param, column) in [("location", "location"), ("note", "note")] {
            if req.params.get(param).is_some() {
                fields.push(format!("{} = ?", column));
                values.push(match get_opt_text(&req.params, param) {
                    Some(s) => SqlValue::Text(s),
                    None => SqlValue::Null,
                });
            }
        }

        if !fields.is_empty() {
            values.push(SqlValue::Text(lesson_id.clone()));
            let sql = format!("UPDATE lessons SET {} WHERE id = ?", fields.join(", "));
            conn.execute(&sql, params_from_iter(values))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }

        Ok(json!({ "lessonId": lesson_id, "updated": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_lessons_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let ids: Vec<String> = match req.params.get("orderedIds").and_then(|v| v.as_array()) {
            Some(arr) => arr
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| HandlerErr::bad_params("orderedIds must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => return Err(HandlerErr::bad_params("missing orderedIds")),
        };
        let lesson_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM lessons WHERE course_id = ?",
                [&course_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query)?;
        if lesson_count as usize != ids.len() {
            return Err(HandlerErr::bad_params(
                "orderedIds must list every lesson of the course exactly once",
            ));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        // Two passes keep UNIQUE(course_id, idx) satisfied mid-update.
        for (i, id) in ids.iter().enumerate() {
            let changed = tx
                .execute(
                    "UPDATE lessons SET idx = ? WHERE id = ? AND course_id = ?",
                    (-(i as i64) - 1, id, &course_id),
                )
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            if changed == 0 {
                let _ = tx.rollback();
                return Err(
                    HandlerErr::not_found("lesson not found in course")
                        .with_details(json!({ "lessonId": id })),
                );
            }
        }
        tx.execute(
            "UPDATE lessons SET idx = -idx WHERE course_id = ?",
            [&course_id],
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        Ok(json!({ "reordered": ids.len() }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_lessons_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        if !row_exists(conn, "SELECT 1 FROM lessons WHERE id = ?", &lesson_id)? {
            return Err(HandlerErr::not_found("lesson not found"));
        }
        if row_exists(
            conn,
            "SELECT 1 FROM evaluations WHERE lesson_id = ? LIMIT 1",
            &lesson_id,
        )? {
            return Err(HandlerErr::conflict(
                "evaluations reference this lesson; delete them first",
            ));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for (sql, table) in [
            ("DELETE FROM attendance WHERE lesson_id = ?", "attendance"),
            ("DELETE FROM lessons WHERE id = ?", "lessons"),
        ] {
            if let Err(e) = tx.execute(sql, [&lesson_id]) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": table })));
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        Ok(json!({ "deleted": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lessons.list" => Some(handle_lessons_list(state, req)),
        "lessons.create" => Some(handle_lessons_create(state, req)),
        "lessons.update" => Some(handle_lessons_update(state, req)),
        "lessons.reorder" => Some(handle_lessons_reorder(state, req)),
        "lessons.delete" => Some(handle_lessons_delete(state, req)),
        _ => None,
    }
}
