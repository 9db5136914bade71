use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_ref, get_opt_date, get_opt_f64, get_opt_i64, get_opt_text, get_required_str,
    get_required_text, now_rfc3339, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: [&str; 3] = ["planned", "running", "finished"];

fn validate_status(raw: &str) -> Result<String, HandlerErr> {
    if STATUSES.contains(&raw) {
        Ok(raw.to_string())
    } else {
        Err(HandlerErr::bad_params(
            "status must be one of: planned, running, finished",
        ))
    }
}

fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", course_id)
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.code, c.title, c.location, c.start_date, c.end_date, c.capacity,
                c.pass_threshold, c.attendance_threshold, c.status,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id AND e.status = 'enrolled') AS enrolled_count,
           (SELECT COUNT(*) FROM lessons l WHERE l.course_id = c.id) AS lesson_count
         FROM courses c
         ORDER BY c.start_date, c.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "code": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "location": row.get::<_, Option<String>>(3)?,
                "startDate": row.get::<_, Option<String>>(4)?,
                "endDate": row.get::<_, Option<String>>(5)?,
                "capacity": row.get::<_, Option<i64>>(6)?,
                "passThreshold": row.get::<_, f64>(7)?,
                "attendanceThreshold": row.get::<_, f64>(8)?,
                "status": row.get::<_, String>(9)?,
                "enrolledCount": row.get::<_, i64>(10)?,
                "lessonCount": row.get::<_, i64>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let code = get_required_text(&req.params, "code")?;
        let title = get_required_text(&req.params, "title")?;
        let location = get_opt_text(&req.params, "location");
        let start_date = get_opt_date(&req.params, "startDate")?;
        let end_date = get_opt_date(&req.params, "endDate")?;
        let capacity = get_opt_i64(&req.params, "capacity")?;
        if let Some(c) = capacity {
            if c < 1 {
                return Err(HandlerErr::bad_params("capacity must be positive"));
            }
        }
        let pass_threshold = get_opt_f64(&req.params, "passThreshold")?.unwrap_or(75.0);
        let attendance_threshold = get_opt_f64(&req.params, "attendanceThreshold")?.unwrap_or(80.0);
        for (name, v) in [
            ("passThreshold", pass_threshold),
            ("attendanceThreshold", attendance_threshold),
        ] {
            if !(0.0..=100.0).contains(&v) {
                return Err(HandlerErr::bad_params(format!("{} must be 0..=100", name)));
            }
        }
        let status = match get_opt_text(&req.params, "status") {
            Some(raw) => validate_status(&raw)?,
            None => "planned".to_string(),
        };

        let course_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO courses(id, code, title, location, start_date, end_date, capacity,
                                 pass_threshold, attendance_threshold, status)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &course_id,
                &code,
                &title,
                &location,
                &start_date,
                &end_date,
                capacity,
                pass_threshold,
                attendance_threshold,
                &status,
            ],
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "courses" }))
        })?;

        Ok(json!({ "courseId": course_id, "code": code }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !course_exists(conn, &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }

        // Validate every field before touching the row; one UPDATE or none.
        let mut fields: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(code) = get_opt_text(&req.params, "code") {
            fields.push("code = ?".to_string());
            values.push(SqlValue::Text(code));
        }
        if let Some(title) = get_opt_text(&req.params, "title") {
            fields.push("title = ?".to_string());
            values.push(SqlValue::Text(title));
        }
        if req.params.get("location").is_some() {
            fields.push("location = ?".to_string());
            values.push(match get_opt_text(&req.params, "location") {
                Some(s) => SqlValue::Text(s),
                None => SqlValue::Null,
            });
        }
        for (param, column) in [("startDate", "start_date"), ("endDate", "end_date")] {
            if req.params.get(param).is_some() {
                fields.push(format!("{} = ?", column));
                values.push(match get_opt_date(&req.params, param)? {
                    Some(d) => SqlValue::Text(d),
                    None => SqlValue::Null,
                });
            }
        }
        if req.params.get("capacity").is_some() {
            let capacity = get_opt_i64(&req.params, "capacity")?;
            if let Some(c) = capacity {
                if c < 1 {
                    return Err(HandlerErr::bad_params("capacity must be positive"));
                }
            }
            fields.push("capacity = ?".to_string());
            values.push(match capacity {
                Some(c) => SqlValue::Integer(c),
                None => SqlValue::Null,
            });
        }
        for (param, column) in [
            ("passThreshold", "pass_threshold"),
            ("attendanceThreshold", "attendance_threshold"),
        ] {
            if let Some(v) = get_opt_f64(&req.params, param)? {
                if !(0.0..=100.0).contains(&v) {
                    return Err(HandlerErr::bad_params(format!("{} must be 0..=100", param)));
                }
                fields.push(format!("{} = ?", column));
                values.push(SqlValue::Real(v));
            }
        }
        if let Some(raw) = get_opt_text(&req.params, "status") {
            let status = validate_status(&raw)?;
            fields.push("status = ?".to_string());
            values.push(SqlValue::Text(status));
        }

        if !fields.is_empty() {
            values.push(SqlValue::Text(course_id.clone()));
            let sql = format!("UPDATE courses SET {} WHERE id = ?", fields.join(", "));
            conn.execute(&sql, params_from_iter(values))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }

        Ok(json!({ "courseId": course_id, "updated": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !course_exists(conn, &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        // Explicit dependency order; no ON DELETE CASCADE in the schema.
        for (sql, table) in [
            (
                "DELETE FROM evaluation_items
                 WHERE evaluation_id IN (SELECT id FROM evaluations WHERE course_id = ?)",
                "evaluation_items",
            ),
            ("DELETE FROM evaluations WHERE course_id = ?", "evaluations"),
            (
                "DELETE FROM attendance
                 WHERE lesson_id IN (SELECT id FROM lessons WHERE course_id = ?)",
                "attendance",
            ),
            ("DELETE FROM lessons WHERE course_id = ?", "lessons"),
            ("DELETE FROM enrollments WHERE course_id = ?", "enrollments"),
            (
                "DELETE FROM course_instructors WHERE course_id = ?",
                "course_instructors",
            ),
            ("DELETE FROM courses WHERE id = ?", "courses"),
        ] {
            if let Err(e) = tx.execute(sql, [&course_id]) {
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

fn handle_assign_instructor(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let user_id = get_required_str(&req.params, "userId")?;
        let role = get_opt_text(&req.params, "role").unwrap_or_else(|| "assistant".to_string());
        if role != "lead" && role != "assistant" {
            return Err(HandlerErr::bad_params("role must be lead or assistant"));
        }
        if !course_exists(conn, &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        let active: Option<i64> = conn
            .query_row("SELECT active FROM users WHERE id = ?", [&user_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?;
        match active {
            None => return Err(HandlerErr::not_found("user not found")),
            Some(0) => return Err(HandlerErr::conflict("user is deactivated")),
            Some(_) => {}
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        if role == "lead" {
            // One lead per course; the previous lead steps down.
            tx.execute(
                "UPDATE course_instructors SET role = 'assistant'
                 WHERE course_id = ? AND role = 'lead' AND user_id != ?",
                (&course_id, &user_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        tx.execute(
            "INSERT INTO course_instructors(course_id, user_id, role) VALUES(?, ?, ?)
             ON CONFLICT(course_id, user_id) DO UPDATE SET role = excluded.role",
            (&course_id, &user_id, &role),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        Ok(json!({ "courseId": course_id, "userId": user_id, "role": role }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_remove_instructor(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let user_id = get_required_str(&req.params, "userId")?;
        let changed = conn
            .execute(
                "DELETE FROM course_instructors WHERE course_id = ? AND user_id = ?",
                (&course_id, &user_id),
            )
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
        if changed == 0 {
            return Err(HandlerErr::not_found("instructor is not assigned to course"));
        }
        Ok(json!({ "removed": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_instructors_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !course_exists(conn, &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        let mut stmt = conn
            .prepare(
                "SELECT u.id, u.full_name, u.email, ci.role
                 FROM course_instructors ci
                 JOIN users u ON u.id = ci.user_id
                 WHERE ci.course_id = ?
                 ORDER BY ci.role, u.full_name",
            )
            .map_err(HandlerErr::db_query)?;
        let rows = stmt
            .query_map([&course_id], |r| {
                Ok(json!({
                    "userId": r.get::<_, String>(0)?,
                    "fullName": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "role": r.get::<_, String>(3)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "instructors": rows }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        if !course_exists(conn, &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
            return Err(HandlerErr::not_found("student not found"));
        }
        let dup: Option<String> = conn
            .query_row(
                "SELECT status FROM enrollments WHERE course_id = ? AND student_id = ?",
                (&course_id, &student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        if let Some(status) = dup {
            return Err(HandlerErr::conflict("student already has an enrollment")
                .with_details(json!({ "status": status })));
        }

        let capacity: Option<i64> = conn
            .query_row("SELECT capacity FROM courses WHERE id = ?", [&course_id], |r| {
                r.get(0)
            })
            .map_err(HandlerErr::db_query)?;
        if let Some(cap) = capacity {
            let enrolled: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM enrollments WHERE course_id = ? AND status = 'enrolled'",
                    [&course_id],
                    |r| r.get(0),
                )
                .map_err(HandlerErr::db_query)?;
            if enrolled >= cap {
                return Err(HandlerErr::conflict("course is full")
                    .with_details(json!({ "capacity": cap })));
            }
        }

        let enrollment_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO enrollments(id, course_id, student_id, status, enrolled_at)
             VALUES(?, ?, ?, 'enrolled', ?)",
            (&enrollment_id, &course_id, &student_id, now_rfc3339()),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "enrollments" }))
        })?;
        Ok(json!({ "enrollmentId": enrollment_id }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_withdraw(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        let changed = conn
            .execute(
                "UPDATE enrollments SET status = 'withdrawn'
                 WHERE course_id = ? AND student_id = ? AND status = 'enrolled'",
                (&course_id, &student_id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        if changed == 0 {
            return Err(HandlerErr::not_found("no active enrollment for student"));
        }
        Ok(json!({ "withdrawn": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_unenroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
                (&course_id, &student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("no enrollment for student"));
        }

        let has_attendance: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM attendance a
                 JOIN lessons l ON l.id = a.lesson_id
                 WHERE l.course_id = ? AND a.student_id = ?",
                (&course_id, &student_id),
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(HandlerErr::db_query)?;
        let has_evaluations: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM evaluations WHERE course_id = ? AND student_id = ?",
                (&course_id, &student_id),
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(HandlerErr::db_query)?;
        if has_attendance || has_evaluations {
            return Err(HandlerErr::conflict(
                "student has recorded work in this course; withdraw instead",
            ));
        }

        conn.execute(
            "DELETE FROM enrollments WHERE course_id = ? AND student_id = ?",
            (&course_id, &student_id),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
        Ok(json!({ "unenrolled": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "courses.assignInstructor" => Some(handle_assign_instructor(state, req)),
        "courses.removeInstructor" => Some(handle_remove_instructor(state, req)),
        "courses.instructors" => Some(handle_instructors_list(state, req)),
        "courses.enroll" => Some(handle_enroll(state, req)),
        "courses.withdraw" => Some(handle_withdraw(state, req)),
        "courses.unenroll" => Some(handle_unenroll(state, req)),
        _ => None,
    }
}
