use std::path::PathBuf;

use crate::calc::{self, round_off_1_decimal};
use crate::ipc::error::ok;
use crate::ipc::helpers::{db_ref, get_opt_text, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::report;
use serde_json::json;

fn handle_course_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let ctx = calc::CalcContext {
            conn,
            course_id: &course_id,
        };
        let summary = calc::compute_course_summary(&ctx)?;
        Ok(json!(summary))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        let ctx = calc::CalcContext {
            conn,
            course_id: &course_id,
        };
        let summary = calc::compute_course_summary(&ctx)?;

        let aggregate = summary
            .per_student
            .iter()
            .find(|s| s.student_id == student_id)
            .ok_or_else(|| HandlerErr::not_found("student is not enrolled in this course"))?;
        let evaluations: Vec<&calc::EvaluationRow> = summary
            .evaluations
            .iter()
            .filter(|e| e.student_id == student_id)
            .collect();
        let skill_best = summary.skill_best.get(&student_id);
        let attendance_cells = summary.attendance_cells.get(&student_id);

        Ok(json!({
            "course": summary.course,
            "lessons": summary.lessons,
            "student": aggregate,
            "attendanceRate": round_off_1_decimal(aggregate.attendance_rate),
            "evaluations": evaluations,
            "skillBest": skill_best,
            "attendanceCells": attendance_cells,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_export_workbook(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let conn = db_ref(state)?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let ctx = calc::CalcContext {
            conn,
            course_id: &course_id,
        };
        let summary = calc::compute_course_summary(&ctx)?;

        // Default lands the file next to the database, named after the course.
        let out_path = match get_opt_text(&req.params, "outPath") {
            Some(p) => PathBuf::from(p),
            None => {
                let workspace = state
                    .workspace
                    .as_ref()
                    .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
                workspace.join(format!("{}-report.xlsx", summary.course.code))
            }
        };
        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(
                    HandlerErr::bad_params("outPath parent directory does not exist")
                        .with_details(json!({ "outPath": out_path.display().to_string() })),
                );
            }
        }

        let wrote = report::export_course_workbook(&summary, &out_path)
            .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;
        tracing::info!(path = %out_path.display(), "workbook exported");

        Ok(json!({
            "path": out_path.display().to_string(),
            "sheetNames": wrote.sheet_names,
            "studentCount": wrote.student_count,
            "lessonCount": wrote.lesson_count,
            "evaluationCount": wrote.evaluation_count,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.courseSummary" => Some(handle_course_summary(state, req)),
        "reports.studentSummary" => Some(handle_student_summary(state, req)),
        "reports.exportWorkbook" => Some(handle_export_workbook(state, req)),
        _ => None,
    }
}
