use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// 1-decimal display rounding used on report surfaces:
/// `(10x + 0.5).floor() / 10`. Aggregation always runs on full precision.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDef {
    pub skill_id: String,
    pub code: String,
    pub name: String,
    pub category: Option<String>,
    pub critical: bool,
    pub max_points: f64,
    pub pass_points: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredItem<'a> {
    pub skill_id: &'a str,
    pub points: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationScore {
    pub earned: f64,
    pub possible: f64,
    pub percent: Option<f64>,
    pub item_count: usize,
    /// Codes of critical skills scored below their pass mark.
    pub critical_fails: Vec<String>,
    pub passed: bool,
}

/// Scores one evaluation's item set against the skill catalog.
///
/// A critical skill below its pass mark fails the evaluation outright,
/// whatever the percentage works out to. The percent is still reported so
/// the UI can show "82% but failed mask clear".
pub fn score_evaluation<'a, I>(
    items: I,
    defs: &HashMap<String, SkillDef>,
    pass_threshold: f64,
) -> Result<EvaluationScore, CalcError>
where
    I: IntoIterator<Item = ScoredItem<'a>>,
{
    let mut earned = 0.0;
    let mut possible = 0.0;
    let mut item_count = 0usize;
    let mut critical_fails: Vec<String> = Vec::new();

    for item in items {
        let Some(def) = defs.get(item.skill_id) else {
            return Err(CalcError::new("not_found", "unknown skill in evaluation"));
        };
        if item.points < 0.0 || item.points > def.max_points {
            return Err(CalcError::new(
                "bad_params",
                format!(
                    "points for {} must be in 0..={}",
                    def.code, def.max_points
                ),
            ));
        }
        item_count += 1;
        earned += item.points;
        possible += def.max_points;
        if def.critical && item.points < def.pass_points {
            critical_fails.push(def.code.clone());
        }
    }
    critical_fails.sort();

    let percent = if possible > 0.0 {
        Some(100.0 * earned / possible)
    } else {
        None
    };
    let passed = item_count > 0
        && critical_fails.is_empty()
        && percent.map(|p| p >= pass_threshold).unwrap_or(false);

    Ok(EvaluationScore {
        earned,
        possible,
        percent,
        item_count,
        critical_fails,
        passed,
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub excused: usize,
}

/// Attendance rate in percent over the course's held lessons. Excused
/// lessons are not counted against the student; a held lesson with no
/// record counts as a miss. With nothing counted at all the rate reads 100.
pub fn attendance_rate(counts: &AttendanceCounts, lessons_held: usize) -> f64 {
    let denom = lessons_held.saturating_sub(counts.excused);
    if denom == 0 {
        return 100.0;
    }
    100.0 * ((counts.present + counts.late) as f64) / (denom as f64)
}

pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub course_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseHeader {
    pub id: String,
    pub code: String,
    pub title: String,
    pub location: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub capacity: Option<i64>,
    pub pass_threshold: f64,
    pub attendance_threshold: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonDef {
    pub lesson_id: String,
    pub idx: i64,
    pub date: Option<String>,
    pub title: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRow {
    pub evaluation_id: String,
    pub student_id: String,
    pub lesson_id: Option<String>,
    pub evaluator_name: String,
    pub eval_date: Option<String>,
    pub comment: Option<String>,
    #[serde(flatten)]
    pub score: EvaluationScore,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAggregate {
    pub student_id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
    pub enrollment_status: String,
    pub attendance: AttendanceCounts,
    pub attendance_rate: f64,
    pub evaluation_count: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub critical_fail_count: usize,
    pub mean_percent: Option<f64>,
    pub median_percent: Option<f64>,
    pub certified: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummaryModel {
    pub course: CourseHeader,
    pub lessons: Vec<LessonDef>,
    pub skills: Vec<SkillDef>,
    pub evaluations: Vec<EvaluationRow>,
    #[serde(rename = "perStudent")]
    pub per_student: Vec<StudentAggregate>,
    /// Best points per (studentId, skillId) across the course.
    pub skill_best: HashMap<String, HashMap<String, f64>>,
    /// Recorded status per (studentId, lessonId).
    pub attendance_cells: HashMap<String, HashMap<String, String>>,
}

pub fn load_skill_defs(conn: &Connection) -> Result<HashMap<String, SkillDef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name, category, critical, max_points, pass_points
             FROM skills",
        )
        .map_err(CalcError::db)?;
    let defs = stmt
        .query_map([], |r| {
            Ok(SkillDef {
                skill_id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                category: r.get(3)?,
                critical: r.get::<_, i64>(4)? != 0,
                max_points: r.get(5)?,
                pass_points: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(defs.into_iter().map(|d| (d.skill_id.clone(), d)).collect())
}

pub fn course_header(conn: &Connection, course_id: &str) -> Result<CourseHeader, CalcError> {
    conn.query_row(
        "SELECT id, code, title, location, start_date, end_date, capacity,
                pass_threshold, attendance_threshold, status
         FROM courses WHERE id = ?",
        [course_id],
        |r| {
            Ok(CourseHeader {
                id: r.get(0)?,
                code: r.get(1)?,
                title: r.get(2)?,
                location: r.get(3)?,
                start_date: r.get(4)?,
                end_date: r.get(5)?,
                capacity: r.get(6)?,
                pass_threshold: r.get(7)?,
                attendance_threshold: r.get(8)?,
                status: r.get(9)?,
            })
        },
    )
    .optional()
    .map_err(CalcError::db)?
    .ok_or_else(|| CalcError::new("not_found", "course not found"))
}

struct EnrolledStudent {
    id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
    enrollment_status: String,
}

pub fn compute_course_summary(ctx: &CalcContext<'_>) -> Result<CourseSummaryModel, CalcError> {
    let conn = ctx.conn;
    let course_id = ctx.course_id;

    let course = course_header(conn, course_id)?;
    let defs = load_skill_defs(conn)?;

    let mut lessons_stmt = conn
        .prepare(
            "SELECT id, idx, date, title, kind
             FROM lessons WHERE course_id = ? ORDER BY idx",
        )
        .map_err(CalcError::db)?;
    let lessons: Vec<LessonDef> = lessons_stmt
        .query_map([course_id], |r| {
            Ok(LessonDef {
                lesson_id: r.get(0)?,
                idx: r.get(1)?,
                date: r.get(2)?,
                title: r.get(3)?,
                kind: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut students_stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.sort_order, s.active, e.status
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.course_id = ?
             ORDER BY s.sort_order",
        )
        .map_err(CalcError::db)?;
    let students: Vec<EnrolledStudent> = students_stmt
        .query_map([course_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(EnrolledStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                sort_order: r.get(3)?,
                active: r.get::<_, i64>(4)? != 0,
                enrollment_status: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    // Attendance counts per student across the course's lessons.
    let mut att_stmt = conn
        .prepare(
            "SELECT a.student_id, a.lesson_id, a.status
             FROM attendance a
             JOIN lessons l ON l.id = a.lesson_id
             WHERE l.course_id = ?",
        )
        .map_err(CalcError::db)?;
    let att_rows = att_stmt
        .query_map([course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    let mut att_by_student: HashMap<String, AttendanceCounts> = HashMap::new();
    let mut attendance_cells: HashMap<String, HashMap<String, String>> = HashMap::new();
    for (sid, lid, status) in att_rows {
        let c = att_by_student.entry(sid.clone()).or_default();
        match status.as_str() {
            "present" => c.present += 1,
            "late" => c.late += 1,
            "absent" => c.absent += 1,
            "excused" => c.excused += 1,
            _ => {}
        }
        attendance_cells.entry(sid).or_default().insert(lid, status);
    }

    // Every evaluation in the course, with its items, scored once.
    let mut eval_stmt = conn
        .prepare(
            "SELECT ev.id, ev.student_id, ev.lesson_id, ev.eval_date, ev.comment,
                    u.full_name
             FROM evaluations ev
             JOIN users u ON u.id = ev.evaluator_id
             WHERE ev.course_id = ?
             ORDER BY ev.eval_date, ev.id",
        )
        .map_err(CalcError::db)?;
    let eval_heads = eval_stmt
        .query_map([course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut items_stmt = conn
        .prepare(
            "SELECT skill_id, points FROM evaluation_items WHERE evaluation_id = ?",
        )
        .map_err(CalcError::db)?;

    let mut evaluations: Vec<EvaluationRow> = Vec::with_capacity(eval_heads.len());
    let mut skill_best: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for (eval_id, student_id, lesson_id, eval_date, comment, evaluator_name) in eval_heads {
        let items: Vec<(String, f64)> = items_stmt
            .query_map([&eval_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CalcError::db)?;

        let score = score_evaluation(
            items.iter().map(|(sid, pts)| ScoredItem {
                skill_id: sid,
                points: *pts,
            }),
            &defs,
            course.pass_threshold,
        )?;

        let per_student = skill_best.entry(student_id.clone()).or_default();
        for (sid, pts) in &items {
            let best = per_student.entry(sid.clone()).or_insert(*pts);
            if *pts > *best {
                *best = *pts;
            }
        }

        evaluations.push(EvaluationRow {
            evaluation_id: eval_id,
            student_id,
            lesson_id,
            evaluator_name,
            eval_date,
            comment,
            score,
        });
    }

    let per_student = students
        .iter()
        .map(|s| {
            let attendance = att_by_student.get(&s.id).copied().unwrap_or_default();
            let rate = attendance_rate(&attendance, lessons.len());

            let own: Vec<&EvaluationRow> = evaluations
                .iter()
                .filter(|e| e.student_id == s.id)
                .collect();
            let evaluation_count = own.len();
            let passed_count = own.iter().filter(|e| e.score.passed).count();
            let failed_count = evaluation_count - passed_count;
            let critical_fail_count = own
                .iter()
                .filter(|e| !e.score.critical_fails.is_empty())
                .count();
            let percents: Vec<f64> = own.iter().filter_map(|e| e.score.percent).collect();
            let mean_percent = if percents.is_empty() {
                None
            } else {
                Some(percents.iter().sum::<f64>() / percents.len() as f64)
            };
            let median_percent = if percents.is_empty() {
                None
            } else {
                Some(compute_median(&percents))
            };

            let certified = evaluation_count > 0
                && failed_count == 0
                && rate >= course.attendance_threshold;

            StudentAggregate {
                student_id: s.id.clone(),
                display_name: s.display_name.clone(),
                sort_order: s.sort_order,
                active: s.active,
                enrollment_status: s.enrollment_status.clone(),
                attendance,
                attendance_rate: rate,
                evaluation_count,
                passed_count,
                failed_count,
                critical_fail_count,
                mean_percent,
                median_percent,
                certified,
            }
        })
        .collect();

    let mut skills: Vec<SkillDef> = defs.values().cloned().collect();
    skills.sort_by(|a, b| a.code.cmp(&b.code));

    Ok(CourseSummaryModel {
        course,
        lessons,
        skills,
        evaluations,
        per_student,
        skill_best,
        attendance_cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, code: &str, critical: bool, max: f64, pass: f64) -> SkillDef {
        SkillDef {
            skill_id: id.to_string(),
            code: code.to_string(),
            name: code.to_string(),
            category: None,
            critical,
            max_points: max,
            pass_points: pass,
        }
    }

    fn catalog() -> HashMap<String, SkillDef> {
        [
            def("s1", "MASK-CLEAR", true, 5.0, 3.0),
            def("s2", "FIN-PIVOT", false, 5.0, 3.0),
            def("s3", "CESA", true, 5.0, 3.0),
        ]
        .into_iter()
        .map(|d| (d.skill_id.clone(), d))
        .collect()
    }

    #[test]
    fn round_off_one_decimal() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(86.6666), 86.7);
    }

    #[test]
    fn critical_fail_short_circuits_high_percent() {
        let defs = catalog();
        let items = [
            ScoredItem { skill_id: "s1", points: 2.0 }, // critical, below pass
            ScoredItem { skill_id: "s2", points: 5.0 },
            ScoredItem { skill_id: "s3", points: 5.0 },
        ];
        let score = score_evaluation(items, &defs, 75.0).expect("score");
        assert_eq!(score.critical_fails, vec!["MASK-CLEAR".to_string()]);
        assert!(!score.passed);
        // 12/15 = 80% would pass on threshold alone.
        let p = score.percent.expect("percent");
        assert!((p - 80.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_comparison_is_inclusive() {
        let defs = catalog();
        let at = [
            ScoredItem { skill_id: "s2", points: 3.0 },
            ScoredItem { skill_id: "s3", points: 4.5 },
        ];
        let score = score_evaluation(at, &defs, 75.0).expect("score");
        let p = score.percent.expect("percent");
        assert!((p - 75.0).abs() < 1e-9);
        assert!(score.passed);

        let below = [
            ScoredItem { skill_id: "s2", points: 3.0 },
            ScoredItem { skill_id: "s3", points: 4.0 },
        ];
        let score = score_evaluation(below, &defs, 75.0).expect("score");
        assert!(!score.passed);
    }

    #[test]
    fn empty_evaluation_never_passes() {
        let defs = catalog();
        let score = score_evaluation([], &defs, 0.0).expect("score");
        assert_eq!(score.item_count, 0);
        assert_eq!(score.percent, None);
        assert!(!score.passed);
    }

    #[test]
    fn unknown_skill_and_out_of_range_points_are_errors() {
        let defs = catalog();
        let unknown = [ScoredItem { skill_id: "nope", points: 1.0 }];
        assert_eq!(
            score_evaluation(unknown, &defs, 75.0).unwrap_err().code,
            "not_found"
        );
        let too_high = [ScoredItem { skill_id: "s2", points: 5.5 }];
        assert_eq!(
            score_evaluation(too_high, &defs, 75.0).unwrap_err().code,
            "bad_params"
        );
    }

    #[test]
    fn attendance_rate_excludes_excused() {
        let counts = AttendanceCounts {
            present: 6,
            late: 1,
            absent: 1,
            excused: 2,
        };
        // 7 of 8 counted lessons out of 10 held.
        assert!((attendance_rate(&counts, 10) - 87.5).abs() < 1e-9);

        let all_excused = AttendanceCounts {
            excused: 4,
            ..Default::default()
        };
        assert_eq!(attendance_rate(&all_excused, 4), 100.0);
        assert_eq!(attendance_rate(&AttendanceCounts::default(), 0), 100.0);
    }

    #[test]
    fn attendance_rate_counts_unmarked_lessons_as_misses() {
        // Held lessons with no record count against the student.
        assert_eq!(attendance_rate(&AttendanceCounts::default(), 4), 0.0);

        let partial = AttendanceCounts {
            present: 2,
            ..Default::default()
        };
        assert!((attendance_rate(&partial, 4) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(compute_median(&[]), 0.0);
        assert_eq!(compute_median(&[70.0]), 70.0);
        assert_eq!(compute_median(&[60.0, 90.0]), 75.0);
        assert_eq!(compute_median(&[90.0, 60.0, 80.0]), 80.0);
    }
}
