use crate::calc::{round_off_1_decimal, CourseSummaryModel, EvaluationRow};
use crate::xlsx::{Cell, Sheet, Workbook};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct WorkbookSummary {
    pub sheet_names: Vec<&'static str>,
    pub student_count: usize,
    pub lesson_count: usize,
    pub evaluation_count: usize,
}

pub fn export_course_workbook(
    model: &CourseSummaryModel,
    out_path: &Path,
) -> anyhow::Result<WorkbookSummary> {
    let mut wb = Workbook::new();
    wb.add_sheet(overview_sheet(model));
    wb.add_sheet(attendance_sheet(model));
    wb.add_sheet(evaluations_sheet(model));
    wb.add_sheet(skills_sheet(model));
    wb.save(out_path)?;

    Ok(WorkbookSummary {
        sheet_names: vec!["Overview", "Attendance", "Evaluations", "Skills"],
        student_count: model.per_student.len(),
        lesson_count: model.lessons.len(),
        evaluation_count: model.evaluations.len(),
    })
}

fn opt_text(v: &Option<String>) -> Cell {
    match v {
        Some(s) => Cell::text(s.clone()),
        None => Cell::Empty,
    }
}

fn pct_cell(v: Option<f64>) -> Cell {
    match v {
        Some(p) => Cell::Number(round_off_1_decimal(p)),
        None => Cell::Empty,
    }
}

fn overview_sheet(model: &CourseSummaryModel) -> Sheet {
    let course = &model.course;
    let mut sheet = Sheet::new("Overview");
    sheet.push_row(vec![
        Cell::text("Course"),
        Cell::text(format!("{} {}", course.code, course.title)),
    ]);
    sheet.push_row(vec![Cell::text("Location"), opt_text(&course.location)]);
    sheet.push_row(vec![
        Cell::text("Dates"),
        Cell::text(format!(
            "{} to {}",
            course.start_date.as_deref().unwrap_or("?"),
            course.end_date.as_deref().unwrap_or("?")
        )),
    ]);
    sheet.push_row(vec![Cell::text("Status"), Cell::text(course.status.clone())]);
    sheet.push_row(vec![
        Cell::text("Pass threshold (%)"),
        Cell::Number(course.pass_threshold),
    ]);
    sheet.push_row(vec![
        Cell::text("Attendance threshold (%)"),
        Cell::Number(course.attendance_threshold),
    ]);
    sheet.push_empty_row();

    sheet.push_row(vec![
        Cell::text("Student"),
        Cell::text("Enrollment"),
        Cell::text("Attendance %"),
        Cell::text("Evaluations"),
        Cell::text("Passed"),
        Cell::text("Failed"),
        Cell::text("Critical fails"),
        Cell::text("Mean %"),
        Cell::text("Median %"),
        Cell::text("Outcome"),
    ]);
    for s in &model.per_student {
        sheet.push_row(vec![
            Cell::text(s.display_name.clone()),
            Cell::text(s.enrollment_status.clone()),
            Cell::Number(round_off_1_decimal(s.attendance_rate)),
            Cell::Number(s.evaluation_count as f64),
            Cell::Number(s.passed_count as f64),
            Cell::Number(s.failed_count as f64),
            Cell::Number(s.critical_fail_count as f64),
            pct_cell(s.mean_percent),
            pct_cell(s.median_percent),
            Cell::text(if s.certified {
                "CERTIFIED"
            } else {
                "NOT CERTIFIED"
            }),
        ]);
    }
    sheet
}

fn status_letter(status: &str) -> &'static str {
    match status {
        "present" => "P",
        "late" => "L",
        "absent" => "A",
        "excused" => "E",
        _ => "?",
    }
}

fn attendance_sheet(model: &CourseSummaryModel) -> Sheet {
    let mut sheet = Sheet::new("Attendance");
    let mut header = vec![Cell::text("Student")];
    for l in &model.lessons {
        let date = l.date.as_deref().unwrap_or("");
        header.push(Cell::text(if date.is_empty() {
            format!("{}. {}", l.idx, l.title)
        } else {
            format!("{}. {} ({})", l.idx, l.title, date)
        }));
    }
    header.push(Cell::text("Rate %"));
    sheet.push_row(header);

    for s in &model.per_student {
        let cells = model.attendance_cells.get(&s.student_id);
        let mut row = vec![Cell::text(s.display_name.clone())];
        for l in &model.lessons {
            let status = cells.and_then(|m| m.get(&l.lesson_id));
            row.push(match status {
                Some(st) => Cell::text(status_letter(st)),
                None => Cell::Empty,
            });
        }
        row.push(Cell::Number(round_off_1_decimal(s.attendance_rate)));
        sheet.push_row(row);
    }
    sheet
}

fn evaluations_sheet(model: &CourseSummaryModel) -> Sheet {
    let student_names: HashMap<&str, &str> = model
        .per_student
        .iter()
        .map(|s| (s.student_id.as_str(), s.display_name.as_str()))
        .collect();
    let lesson_titles: HashMap<&str, String> = model
        .lessons
        .iter()
        .map(|l| (l.lesson_id.as_str(), format!("{}. {}", l.idx, l.title)))
        .collect();

    let mut sheet = Sheet::new("Evaluations");
    sheet.push_row(vec![
        Cell::text("Student"),
        Cell::text("Date"),
        Cell::text("Lesson"),
        Cell::text("Evaluator"),
        Cell::text("Items"),
        Cell::text("Earned"),
        Cell::text("Possible"),
        Cell::text("Percent"),
        Cell::text("Critical fails"),
        Cell::text("Outcome"),
        Cell::text("Comment"),
    ]);
    for e in &model.evaluations {
        sheet.push_row(eval_row(e, &student_names, &lesson_titles));
    }
    sheet
}

fn eval_row(
    e: &EvaluationRow,
    student_names: &HashMap<&str, &str>,
    lesson_titles: &HashMap<&str, String>,
) -> Vec<Cell> {
    let lesson = e
        .lesson_id
        .as_deref()
        .and_then(|id| lesson_titles.get(id).cloned());
    vec![
        Cell::text(
            student_names
                .get(e.student_id.as_str())
                .copied()
                // Withdrawn-and-unenrolled students can still own rows.
                .unwrap_or(e.student_id.as_str())
                .to_string(),
        ),
        opt_text(&e.eval_date),
        match lesson {
            Some(t) => Cell::text(t),
            None => Cell::Empty,
        },
        Cell::text(e.evaluator_name.clone()),
        Cell::Number(e.score.item_count as f64),
        Cell::Number(e.score.earned),
        Cell::Number(e.score.possible),
        pct_cell(e.score.percent),
        if e.score.critical_fails.is_empty() {
            Cell::Empty
        } else {
            Cell::text(e.score.critical_fails.join(", "))
        },
        Cell::text(if e.score.passed { "PASS" } else { "FAIL" }),
        opt_text(&e.comment),
    ]
}

fn skills_sheet(model: &CourseSummaryModel) -> Sheet {
    let mut sheet = Sheet::new("Skills");
    let mut header = vec![Cell::text("Student")];
    for skill in &model.skills {
        header.push(Cell::text(if skill.critical {
            format!("{} *", skill.code)
        } else {
            skill.code.clone()
        }));
    }
    sheet.push_row(header);

    for s in &model.per_student {
        let best = model.skill_best.get(&s.student_id);
        let mut row = vec![Cell::text(s.display_name.clone())];
        for skill in &model.skills {
            let points = best.and_then(|m| m.get(&skill.skill_id));
            row.push(match points {
                Some(p) => Cell::Number(*p),
                None => Cell::Empty,
            });
        }
        sheet.push_row(row);
    }
    sheet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_letters_cover_known_states() {
        assert_eq!(status_letter("present"), "P");
        assert_eq!(status_letter("late"), "L");
        assert_eq!(status_letter("absent"), "A");
        assert_eq!(status_letter("excused"), "E");
        assert_eq!(status_letter("weird"), "?");
    }
}
