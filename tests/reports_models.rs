use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_divecertd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn divecertd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn bootstrap_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "b1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "b2",
        "users.create",
        json!({
            "fullName": "Dana Reef",
            "email": "dana@example.test",
            "password": "trimix-2024"
        }),
    );
    let login = request_ok(
        stdin,
        reader,
        "b3",
        "auth.login",
        json!({ "email": "dana@example.test", "password": "trimix-2024" }),
    );
    login
        .get("sessionToken")
        .and_then(|v| v.as_str())
        .expect("sessionToken")
        .to_string()
}

/// One course, two students, one lesson each attended, one skill. Pat passes
/// the skill, Quinn misses the critical pass mark.
struct Fixture {
    course_id: String,
    pat_id: String,
    quinn_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, token: &str) -> Fixture {
    let course = request_ok(
        stdin,
        reader,
        "s1",
        "courses.create",
        json!({
            "sessionToken": token,
            "code": "OWD-2026-05",
            "title": "Open Water Diver",
            "passThreshold": 75.0,
            "attendanceThreshold": 80.0
        }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();

    let mut ids = Vec::new();
    for (i, (last, first)) in [("Porpoise", "Pat"), ("Quillfish", "Quinn")].iter().enumerate() {
        let created = request_ok(
            stdin,
            reader,
            &format!("st{}", i),
            "students.create",
            json!({ "sessionToken": token, "lastName": last, "firstName": first }),
        );
        let id = created
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string();
        let _ = request_ok(
            stdin,
            reader,
            &format!("en{}", i),
            "courses.enroll",
            json!({ "sessionToken": token, "courseId": course_id, "studentId": id }),
        );
        ids.push(id);
    }

    let lesson = request_ok(
        stdin,
        reader,
        "s2",
        "lessons.create",
        json!({
            "sessionToken": token,
            "courseId": course_id,
            "title": "Confined water 1",
            "kind": "pool",
            "date": "2026-06-01"
        }),
    );
    let lesson_id = lesson
        .get("lessonId")
        .and_then(|v| v.as_str())
        .expect("lessonId")
        .to_string();
    for (i, id) in ids.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("at{}", i),
            "attendance.set",
            json!({
                "sessionToken": token,
                "lessonId": lesson_id,
                "studentId": id,
                "status": "present"
            }),
        );
    }

    let skill = request_ok(
        stdin,
        reader,
        "s3",
        "skills.create",
        json!({
            "sessionToken": token,
            "code": "MASK-CLEAR",
            "name": "Mask clear and replace",
            "critical": true,
            "maxPoints": 5.0,
            "passPoints": 3.0
        }),
    );
    let skill_id = skill
        .get("skillId")
        .and_then(|v| v.as_str())
        .expect("skillId")
        .to_string();

    for (i, (id, points)) in [(&ids[0], 5.0), (&ids[1], 2.0)].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("ev{}", i),
            "evaluations.create",
            json!({
                "sessionToken": token,
                "courseId": course_id,
                "studentId": id,
                "evalDate": "2026-06-01",
                "items": [{ "skillId": skill_id, "points": points }]
            }),
        );
    }

    Fixture {
        course_id,
        pat_id: ids.remove(0),
        quinn_id: ids.remove(0),
    }
}

#[test]
fn course_summary_certifies_only_clean_passes() {
    let workspace = temp_dir("divecert-reports-course");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let fx = seed(&mut stdin, &mut reader, &token);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.courseSummary",
        json!({ "sessionToken": token, "courseId": fx.course_id }),
    );
    assert_eq!(
        summary
            .get("course")
            .and_then(|c| c.get("code"))
            .and_then(|v| v.as_str()),
        Some("OWD-2026-05")
    );
    let per_student = summary
        .get("perStudent")
        .and_then(|v| v.as_array())
        .expect("perStudent");
    assert_eq!(per_student.len(), 2);

    let by_id = |id: &str| {
        per_student
            .iter()
            .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(id))
            .expect("student aggregate")
    };
    let pat = by_id(&fx.pat_id);
    assert_eq!(pat.get("certified").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(pat.get("passedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        pat.get("attendanceRate").and_then(|v| v.as_f64()),
        Some(100.0)
    );

    let quinn = by_id(&fx.quinn_id);
    assert_eq!(quinn.get("certified").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(quinn.get("failedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        quinn.get("criticalFailCount").and_then(|v| v.as_u64()),
        Some(1)
    );

    // Best-points grid carries the evaluated skill for both students.
    let skill_best = summary.get("skillBest").expect("skillBest");
    assert!(skill_best.get(&fx.pat_id).is_some());
    assert!(skill_best.get(&fx.quinn_id).is_some());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn no_show_student_is_not_certified() {
    let workspace = temp_dir("divecert-reports-noshow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let fx = seed(&mut stdin, &mut reader, &token);

    // Enrolled, evaluated with a clean pass, but never marked at any lesson.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "sessionToken": token, "lastName": "Sargasso", "firstName": "Sal" }),
    );
    let sal_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.enroll",
        json!({ "sessionToken": token, "courseId": fx.course_id, "studentId": sal_id }),
    );
    let skills = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "skills.list",
        json!({ "sessionToken": token }),
    );
    let skill_id = skills
        .get("skills")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .expect("skill id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": sal_id,
            "evalDate": "2026-06-01",
            "items": [{ "skillId": skill_id, "points": 5.0 }]
        }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.courseSummary",
        json!({ "sessionToken": token, "courseId": fx.course_id }),
    );
    let per_student = summary
        .get("perStudent")
        .and_then(|v| v.as_array())
        .expect("perStudent");
    let sal = per_student
        .iter()
        .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(sal_id.as_str()))
        .expect("student aggregate");

    // One held lesson with no record counts as a miss.
    assert_eq!(sal.get("attendanceRate").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(sal.get("passedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(sal.get("certified").and_then(|v| v.as_bool()), Some(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_summary_is_scoped_to_one_enrollee() {
    let workspace = temp_dir("divecert-reports-student");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let fx = seed(&mut stdin, &mut reader, &token);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.studentSummary",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.quinn_id
        }),
    );
    let student = summary.get("student").expect("student");
    assert_eq!(
        student.get("studentId").and_then(|v| v.as_str()),
        Some(fx.quinn_id.as_str())
    );
    let evaluations = summary
        .get("evaluations")
        .and_then(|v| v.as_array())
        .expect("evaluations");
    assert_eq!(evaluations.len(), 1);
    assert_eq!(
        evaluations[0].get("passed").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        summary.get("attendanceRate").and_then(|v| v.as_f64()),
        Some(100.0)
    );

    // Outsiders are not summarized.
    let outsider = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "sessionToken": token, "lastName": "Drift", "firstName": "Outis" }),
    );
    let outsider_id = outsider
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId");
    let missing = request(
        &mut stdin,
        &mut reader,
        "3",
        "reports.studentSummary",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": outsider_id
        }),
    );
    assert_eq!(missing.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        missing
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
