use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_ref, get_opt_bool, get_opt_date, get_opt_text, get_required_str, get_required_text,
    now_rfc3339, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_ref(state) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.email, s.phone, s.birth_date,
                s.certification_no, s.medical_expiry, s.note, s.active, s.sort_order,
           (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = s.id) AS enrollment_count,
           (SELECT COUNT(*) FROM student_documents d WHERE d.student_id = s.id) AS document_count
         FROM students s
         ORDER BY s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "lastName": row.get::<_, String>(1)?,
                "firstName": row.get::<_, String>(2)?,
                "email": row.get::<_, Option<String>>(3)?,
                "phone": row.get::<_, Option<String>>(4)?,
                "birthDate": row.get::<_, Option<String>>(5)?,
                "certificationNo": row.get::<_, Option<String>>(6)?,
                "medicalExpiry": row.get::<_, Option<String>>(7)?,
                "note": row.get::<_, Option<String>>(8)?,
                "active": row.get::<_, i64>(9)? != 0,
                "sortOrder": row.get::<_, i64>(10)?,
                "enrollmentCount": row.get::<_, i64>(11)?,
                "documentCount": row.get::<_, i64>(12)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let last_name = get_required_text(&req.params, "lastName")?;
        let first_name = get_required_text(&req.params, "firstName")?;
        let email = get_opt_text(&req.params, "email");
        let phone = get_opt_text(&req.params, "phone");
        let birth_date = get_opt_date(&req.params, "birthDate")?;
        let certification_no = get_opt_text(&req.params, "certificationNo");
        let medical_expiry = get_opt_date(&req.params, "medicalExpiry")?;
        let note = get_opt_text(&req.params, "note");
        let active = get_opt_bool(&req.params, "active")?.unwrap_or(true);

        let next_sort: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
                [],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query)?;

        let student_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO students(id, last_name, first_name, email, phone, birth_date,
                                  certification_no, medical_expiry, note, active, sort_order, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &student_id,
                &last_name,
                &first_name,
                &email,
                &phone,
                &birth_date,
                &certification_no,
                &medical_expiry,
                &note,
                if active { 1 } else { 0 },
                next_sort,
                now_rfc3339(),
            ],
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "students" }))
        })?;

        Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let student_id = get_required_str(&req.params, "studentId")?;
        if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
            return Err(HandlerErr::not_found("student not found"));
        }

        // Validate every field before touching the row; one UPDATE or none.
        let mut fields: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        // Text fields update to the given value; null/blank clears them.
        let text_fields = [
            ("email", "email"),
            ("phone", "phone"),
            ("certificationNo", "certification_no"),
            ("note", "note"),
        ];
        for (param, column) in text_fields {
            if req.params.get(param).is_some() {
                fields.push(format!("{} = ?", column));
                values.push(match get_opt_text(&req.params, param) {
                    Some(s) => SqlValue::Text(s),
                    None => SqlValue::Null,
                });
            }
        }
        for (param, column) in [("birthDate", "birth_date"), ("medicalExpiry", "medical_expiry")] {
            if req.params.get(param).is_some() {
                fields.push(format!("{} = ?", column));
                values.push(match get_opt_date(&req.params, param)? {
                    Some(d) => SqlValue::Text(d),
                    None => SqlValue::Null,
                });
            }
        }
        if let Some(last_name) = get_opt_text(&req.params, "lastName") {
            fields.push("last_name = ?".to_string());
            values.push(SqlValue::Text(last_name));
        }
        if let Some(first_name) = get_opt_text(&req.params, "firstName") {
            fields.push("first_name = ?".to_string());
            values.push(SqlValue::Text(first_name));
        }
        if let Some(active) = get_opt_bool(&req.params, "active")? {
            fields.push("active = ?".to_string());
            values.push(SqlValue::Integer(if active { 1 } else { 0 }));
        }

        if !fields.is_empty() {
            fields.push("updated_at = ?".to_string());
            values.push(SqlValue::Text(now_rfc3339()));
            values.push(SqlValue::Text(student_id.clone()));
            let sql = format!("UPDATE students SET {} WHERE id = ?", fields.join(", "));
            conn.execute(&sql, params_from_iter(values))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }

        Ok(json!({ "studentId": student_id, "updated": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_students_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
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

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for (i, id) in ids.iter().enumerate() {
            let changed = tx
                .execute(
                    "UPDATE students SET sort_order = ? WHERE id = ?",
                    (i as i64, id),
                )
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            if changed == 0 {
                let _ = tx.rollback();
                return Err(HandlerErr::not_found("student not found")
                    .with_details(json!({ "studentId": id })));
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        Ok(json!({ "reordered": ids.len() }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let student_id = get_required_str(&req.params, "studentId")?;
        if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
            return Err(HandlerErr::not_found("student not found"));
        }
        for (sql, what) in [
            (
                "SELECT 1 FROM enrollments WHERE student_id = ? LIMIT 1",
                "enrollments",
            ),
            (
                "SELECT 1 FROM evaluations WHERE student_id = ? LIMIT 1",
                "evaluations",
            ),
            (
                "SELECT 1 FROM attendance WHERE student_id = ? LIMIT 1",
                "attendance",
            ),
        ] {
            if row_exists(conn, sql, &student_id)? {
                return Err(HandlerErr::conflict(format!(
                    "student has {}; remove those first",
                    what
                )));
            }
        }

        // Attached documents go with the student.
        let mut stmt = conn
            .prepare("SELECT stored_path FROM student_documents WHERE student_id = ?")
            .map_err(HandlerErr::db_query)?;
        let paths: Vec<String> = stmt
            .query_map([&student_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for (sql, table) in [
            (
                "DELETE FROM student_documents WHERE student_id = ?",
                "student_documents",
            ),
            ("DELETE FROM students WHERE id = ?", "students"),
        ] {
            if let Err(e) = tx.execute(sql, [&student_id]) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": table })));
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        // Files last, so a failed delete never orphans db rows.
        for p in paths {
            let _ = std::fs::remove_file(p);
        }
        Ok(json!({ "deleted": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_documents_attach(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let student_id = get_required_str(&req.params, "studentId")?;
        let source_path = PathBuf::from(get_required_text(&req.params, "sourcePath")?);
        if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
            return Err(HandlerErr::not_found("student not found"));
        }
        if !source_path.is_file() {
            return Err(HandlerErr::bad_params("sourcePath is not a file"));
        }
        let file_name = source_path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr::bad_params("sourcePath has no file name"))?;
        let label = get_opt_text(&req.params, "label").unwrap_or_else(|| file_name.clone());

        let bytes = std::fs::read(&source_path)
            .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
        let sha256 = {
            let mut h = Sha256::new();
            h.update(&bytes);
            format!("{:x}", h.finalize())
        };

        let document_id = Uuid::new_v4().to_string();
        let documents_dir = workspace.join("documents");
        std::fs::create_dir_all(&documents_dir)
            .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
        let stored_path = documents_dir.join(format!("{}-{}", document_id, file_name));
        std::fs::write(&stored_path, &bytes)
            .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;

        conn.execute(
            "INSERT INTO student_documents(id, student_id, label, file_name, stored_path,
                                           byte_size, sha256, uploaded_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &document_id,
                &student_id,
                &label,
                &file_name,
                stored_path.to_string_lossy(),
                bytes.len() as i64,
                &sha256,
                now_rfc3339(),
            ],
        )
        .map_err(|e| {
            // Don't leave the copied file behind on a failed insert.
            let _ = std::fs::remove_file(&stored_path);
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "student_documents" }))
        })?;

        Ok(json!({
            "documentId": document_id,
            "label": label,
            "byteSize": bytes.len(),
            "sha256": sha256,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_documents_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let student_id = get_required_str(&req.params, "studentId")?;
        if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
            return Err(HandlerErr::not_found("student not found"));
        }
        let mut stmt = conn
            .prepare(
                "SELECT id, label, file_name, byte_size, sha256, uploaded_at
                 FROM student_documents
                 WHERE student_id = ?
                 ORDER BY uploaded_at",
            )
            .map_err(HandlerErr::db_query)?;
        let docs = stmt
            .query_map([&student_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "label": r.get::<_, String>(1)?,
                    "fileName": r.get::<_, String>(2)?,
                    "byteSize": r.get::<_, i64>(3)?,
                    "sha256": r.get::<_, String>(4)?,
                    "uploadedAt": r.get::<_, String>(5)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        Ok(json!({ "documents": docs }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_documents_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let document_id = get_required_str(&req.params, "documentId")?;
        let stored_path: Option<String> = conn
            .query_row(
                "SELECT stored_path FROM student_documents WHERE id = ?",
                [&document_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        let Some(stored_path) = stored_path else {
            return Err(HandlerErr::not_found("document not found"));
        };
        conn.execute("DELETE FROM student_documents WHERE id = ?", [&document_id])
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
        let _ = std::fs::remove_file(stored_path);
        Ok(json!({ "deleted": true }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.reorder" => Some(handle_students_reorder(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.documents.attach" => Some(handle_documents_attach(state, req)),
        "students.documents.list" => Some(handle_documents_list(state, req)),
        "students.documents.remove" => Some(handle_documents_remove(state, req)),
        _ => None,
    }
}
