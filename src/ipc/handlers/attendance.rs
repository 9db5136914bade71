use crate::calc::{attendance_rate, round_off_1_decimal, AttendanceCounts};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    current_user_id, db_ref, get_opt_text, get_required_str, now_rfc3339, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const STATUSES: [&str; 4] = ["present", "late", "absent", "excused"];

fn validate_status(raw: &str) -> Result<String, HandlerErr> {
    if STATUSES.contains(&raw) {
        Ok(raw.to_string())
    } else {
        Err(HandlerErr::bad_params(
            "status must be one of: present, late, absent, excused",
        ))
    }
}

fn lesson_course(conn: &Connection, lesson_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT course_id FROM lessons WHERE id = ?",
        [lesson_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("lesson not found"))
}

fn require_enrollment(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
            (course_id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::conflict("student is not enrolled in this course"));
    }
    Ok(())
}

fn handle_attendance_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let recorded_by = match current_user_id(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        let status = validate_status(&get_required_str(&req.params, "status")?)?;
        let note = get_opt_text(&req.params, "note");

        let course_id = lesson_course(conn, &lesson_id)?;
        require_enrollment(conn, &course_id, &student_id)?;

        conn.execute(
            "INSERT INTO attendance(lesson_id, student_id, status, note, recorded_by, recorded_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(lesson_id, student_id) DO UPDATE SET
               status = excluded.status,
               note = excluded.note,
               recorded_by = excluded.recorded_by,
               recorded_at = excluded.recorded_at",
            rusqlite::params![
                &lesson_id,
                &student_id,
                &status,
                &note,
                &recorded_by,
                now_rfc3339(),
            ],
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "attendance" }))
        })?;
        Ok(json!({ "lessonId": lesson_id, "studentId": student_id, "status": status }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_attendance_set_lesson(state: &mut AppState, req: &Request) -> serde_json::Value {
    let recorded_by = match current_user_id(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        let course_id = lesson_course(conn, &lesson_id)?;

        let entries = req
            .params
            .get("entries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| HandlerErr::bad_params("missing entries"))?;
        let mut parsed: Vec<(String, String, Option<String>)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let student_id = get_required_str(entry, "studentId")?;
            let status = validate_status(&get_required_str(entry, "status")?)?;
            let note = get_opt_text(entry, "note");
            require_enrollment(conn, &course_id, &student_id)?;
            parsed.push((student_id, status, note));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        if let Err(e) = tx.execute("DELETE FROM attendance WHERE lesson_id = ?", [&lesson_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_delete_failed", e.to_string()));
        }
        let recorded_at = now_rfc3339();
        for (student_id, status, note) in &parsed {
            if let Err(e) = tx.execute(
                "INSERT INTO attendance(lesson_id, student_id, status, note, recorded_by, recorded_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                rusqlite::params![&lesson_id, student_id, status, note, &recorded_by, &recorded_at],
            ) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "studentId": student_id })));
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        Ok(json!({ "lessonId": lesson_id, "recorded": parsed.len() }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_attendance_lesson(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        if !row_exists(conn, "SELECT 1 FROM lessons WHERE id = ?", &lesson_id)? {
            return Err(HandlerErr::not_found("lesson not found"));
        }
        let mut stmt = conn
            .prepare(
                "SELECT a.student_id, s.last_name, s.first_name, a.status, a.note,
                        a.recorded_by, a.recorded_at
                 FROM attendance a
                 JOIN students s ON s.id = a.student_id
                 WHERE a.lesson_id = ?
                 ORDER BY s.sort_order",
            )
            .map_err(HandlerErr::db_query)?;
        let rows = stmt
            .query_map([&lesson_id], |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "displayName": format!("{}, {}", last, first),
                    "status": r.get::<_, String>(3)?,
                    "note": r.get::<_, Option<String>>(4)?,
                    "recordedBy": r.get::<_, String>(5)?,
                    "recordedAt": r.get::<_, String>(6)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "lessonId": lesson_id, "entries": rows }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_attendance_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }

        let lessons_held: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM lessons WHERE course_id = ?",
                [&course_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query)?;

        let mut cell_stmt = conn
            .prepare(
                "SELECT a.student_id, a.lesson_id, a.status
                 FROM attendance a
                 JOIN lessons l ON l.id = a.lesson_id
                 WHERE l.course_id = ?",
            )
            .map_err(HandlerErr::db_query)?;
        let cells = cell_stmt
            .query_map([&course_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;

        let mut by_student: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut counts: HashMap<String, AttendanceCounts> = HashMap::new();
        for (student_id, lesson_id, status) in cells {
            let c = counts.entry(student_id.clone()).or_default();
            match status.as_str() {
                "present" => c.present += 1,
                "late" => c.late += 1,
                "absent" => c.absent += 1,
                "excused" => c.excused += 1,
                _ => {}
            }
            by_student
                .entry(student_id)
                .or_default()
                .insert(lesson_id, status);
        }

        let mut students_stmt = conn
            .prepare(
                "SELECT s.id, s.last_name, s.first_name
                 FROM enrollments e
                 JOIN students s ON s.id = e.student_id
                 WHERE e.course_id = ?
                 ORDER BY s.sort_order",
            )
            .map_err(HandlerErr::db_query)?;
        let students = students_stmt
            .query_map([&course_id], |r| {
                let id: String = r.get(0)?;
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok((id, format!("{}, {}", last, first)))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;

        let rows: Vec<serde_json::Value> = students
            .into_iter()
            .map(|(id, display_name)| {
                let c = counts.get(&id).copied().unwrap_or_default();
                json!({
                    "studentId": id,
                    "displayName": display_name,
                    "cells": by_student.get(&id).cloned().unwrap_or_default(),
                    "counts": c,
                    "rate": round_off_1_decimal(attendance_rate(&c, lessons_held as usize)),
                })
            })
            .collect();

        Ok(json!({ "courseId": course_id, "perStudent": rows }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.set" => Some(handle_attendance_set(state, req)),
        "attendance.setLesson" => Some(handle_attendance_set_lesson(state, req)),
        "attendance.lesson" => Some(handle_attendance_lesson(state, req)),
        "attendance.course" => Some(handle_attendance_course(state, req)),
        _ => None,
    }
}
