use crate::calc::{self, ScoredItem};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    current_user_id, db_ref, get_opt_date, get_opt_text, get_required_str, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ParsedItem {
    skill_id: String,
    points: f64,
    note: Option<String>,
}

fn parse_items(params: &serde_json::Value) -> Result<Vec<ParsedItem>, HandlerErr> {
    let raw = params
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing items"))?;
    let mut items = Vec::with_capacity(raw.len());
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    for entry in raw {
        let skill_id = get_required_str(entry, "skillId")?;
        let points = entry
            .get("points")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| HandlerErr::bad_params("items[].points must be a number"))?;
        if !seen.insert(skill_id.clone()) {
            return Err(HandlerErr::bad_params("items may list each skill only once"));
        }
        items.push(ParsedItem {
            skill_id,
            points,
            note: get_opt_text(entry, "note"),
        });
    }
    Ok(items)
}

/// Validates items against the catalog and the course pass threshold by
/// scoring them; the score doubles as the response payload.
fn score_items(
    conn: &Connection,
    course_id: &str,
    items: &[ParsedItem],
) -> Result<calc::EvaluationScore, HandlerErr> {
    let course = calc::course_header(conn, course_id)?;
    let defs = calc::load_skill_defs(conn)?;
    let score = calc::score_evaluation(
        items.iter().map(|i| ScoredItem {
            skill_id: &i.skill_id,
            points: i.points,
        }),
        &defs,
        course.pass_threshold,
    )?;
    Ok(score)
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let evaluator_id = match current_user_id(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        if !row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        let enrolled: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
                (&course_id, &student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        if enrolled.is_none() {
            return Err(HandlerErr::conflict("student is not enrolled in this course"));
        }

        let lesson_id = get_opt_text(&req.params, "lessonId");
        if let Some(lid) = &lesson_id {
            let belongs: Option<String> = conn
                .query_row("SELECT course_id FROM lessons WHERE id = ?", [lid], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(HandlerErr::db_query)?;
            match belongs {
                None => return Err(HandlerErr::not_found("lesson not found")),
                Some(cid) if cid != course_id => {
                    return Err(HandlerErr::bad_params("lesson belongs to another course"))
                }
                Some(_) => {}
            }
        }

        let eval_date = get_opt_date(&req.params, "evalDate")?;
        let comment = get_opt_text(&req.params, "comment");
        let items = parse_items(&req.params)?;
        let score = score_items(conn, &course_id, &items)?;

        let evaluation_id = Uuid::new_v4().to_string();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        if let Err(e) = tx.execute(
            "INSERT INTO evaluations(id, course_id, student_id, lesson_id, evaluator_id, eval_date, comment)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &evaluation_id,
                &course_id,
                &student_id,
                &lesson_id,
                &evaluator_id,
                &eval_date,
                &comment,
            ],
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "evaluations" })));
        }
        for item in &items {
            if let Err(e) = tx.execute(
                "INSERT INTO evaluation_items(evaluation_id, skill_id, points, note)
                 VALUES(?, ?, ?, ?)",
                rusqlite::params![&evaluation_id, &item.skill_id, item.points, &item.note],
            ) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "evaluation_items" })));
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        Ok(json!({ "evaluationId": evaluation_id, "score": score }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_evaluations_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let evaluation_id = get_required_str(&req.params, "evaluationId")?;
        let course_id: Option<String> = conn
            .query_row(
                "SELECT course_id FROM evaluations WHERE id = ?",
                [&evaluation_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        let Some(course_id) = course_id else {
            return Err(HandlerErr::not_found("evaluation not found"));
        };

        // Validate and score everything up front, then write in one tx.
        let eval_date = if req.params.get("evalDate").is_some() {
            Some(get_opt_date(&req.params, "evalDate")?)
        } else {
            None
        };
        let comment = if req.params.get("comment").is_some() {
            Some(get_opt_text(&req.params, "comment"))
        } else {
            None
        };
        let scored_items = if req.params.get("items").is_some() {
            let items = parse_items(&req.params)?;
            let score = score_items(conn, &course_id, &items)?;
            Some((items, score))
        } else {
            None
        };

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        if let Some(eval_date) = &eval_date {
            if let Err(e) = tx.execute(
                "UPDATE evaluations SET eval_date = ? WHERE id = ?",
                (eval_date, &evaluation_id),
            ) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_update_failed", e.to_string()));
            }
        }
        if let Some(comment) = &comment {
            if let Err(e) = tx.execute(
                "UPDATE evaluations SET comment = ? WHERE id = ?",
                (comment, &evaluation_id),
            ) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_update_failed", e.to_string()));
            }
        }
        if let Some((items, _)) = &scored_items {
            if let Err(e) = tx.execute(
                "DELETE FROM evaluation_items WHERE evaluation_id = ?",
                [&evaluation_id],
            ) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_delete_failed", e.to_string()));
            }
            for item in items {
                if let Err(e) = tx.execute(
                    "INSERT INTO evaluation_items(evaluation_id, skill_id, points, note)
                     VALUES(?, ?, ?, ?)",
                    rusqlite::params![&evaluation_id, &item.skill_id, item.points, &item.note],
                ) {
                    let _ = tx.rollback();
                    return Err(HandlerErr::new("db_insert_failed", e.to_string())
                        .with_details(json!({ "table": "evaluation_items" })));
                }
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        let score = scored_items.map(|(_, score)| score);
        Ok(json!({ "evaluationId": evaluation_id, "updated": true, "score": score }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_evaluations_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let evaluation_id = get_required_str(&req.params, "evaluationId")?;
        if !row_exists(conn, "SELECT 1 FROM evaluations WHERE id = ?", &evaluation_id)? {
            return Err(HandlerErr::not_found("evaluation not found"));
        }
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for sql in [
            "DELETE FROM evaluation_items WHERE evaluation_id = ?",
            "DELETE FROM evaluations WHERE id = ?",
        ] {
            if let Err(e) = tx.execute(sql, [&evaluation_id]) {
                let _ = tx.rollback();
                return Err(HandlerErr::new("db_delete_failed", e.to_string()));
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

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        if !row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
            return Err(HandlerErr::not_found("course not found"));
        }
        let student_filter = get_opt_text(&req.params, "studentId");

        let ctx = calc::CalcContext {
            conn,
            course_id: &course_id,
        };
        let summary = calc::compute_course_summary(&ctx)?;
        let rows: Vec<&calc::EvaluationRow> = summary
            .evaluations
            .iter()
            .filter(|e| {
                student_filter
                    .as_deref()
                    .map(|sid| e.student_id == sid)
                    .unwrap_or(true)
            })
            .collect();
        Ok(json!({ "evaluations": rows }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_evaluations_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let evaluation_id = get_required_str(&req.params, "evaluationId")?;
        let head: Option<(String, String, Option<String>, String, Option<String>, Option<String>)> =
            conn.query_row(
                "SELECT course_id, student_id, lesson_id, evaluator_id, eval_date, comment
                 FROM evaluations WHERE id = ?",
                [&evaluation_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        let Some((course_id, student_id, lesson_id, evaluator_id, eval_date, comment)) = head
        else {
            return Err(HandlerErr::not_found("evaluation not found"));
        };

        let mut items_stmt = conn
            .prepare(
                "SELECT ei.skill_id, sk.code, sk.name, sk.critical, sk.max_points,
                        sk.pass_points, ei.points, ei.note
                 FROM evaluation_items ei
                 JOIN skills sk ON sk.id = ei.skill_id
                 WHERE ei.evaluation_id = ?
                 ORDER BY sk.code",
            )
            .map_err(HandlerErr::db_query)?;
        let items = items_stmt
            .query_map([&evaluation_id], |r| {
                Ok(json!({
                    "skillId": r.get::<_, String>(0)?,
                    "code": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "critical": r.get::<_, i64>(3)? != 0,
                    "maxPoints": r.get::<_, f64>(4)?,
                    "passPoints": r.get::<_, f64>(5)?,
                    "points": r.get::<_, f64>(6)?,
                    "note": r.get::<_, Option<String>>(7)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;

        let parsed: Vec<ParsedItem> = items
            .iter()
            .map(|i| ParsedItem {
                skill_id: i["skillId"].as_str().unwrap_or_default().to_string(),
                points: i["points"].as_f64().unwrap_or_default(),
                note: None,
            })
            .collect();
        let score = score_items(conn, &course_id, &parsed)?;

        Ok(json!({
            "evaluationId": evaluation_id,
            "courseId": course_id,
            "studentId": student_id,
            "lessonId": lesson_id,
            "evaluatorId": evaluator_id,
            "evalDate": eval_date,
            "comment": comment,
            "items": items,
            "score": score,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.update" => Some(handle_evaluations_update(state, req)),
        "evaluations.delete" => Some(handle_evaluations_delete(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.get" => Some(handle_evaluations_get(state, req)),
        _ => None,
    }
}
