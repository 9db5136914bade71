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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
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

struct Fixture {
    course_id: String,
    student_id: String,
    // mask clear (critical), fin pivot, cesa (critical), all 5/3
    skills: Vec<String>,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, token: &str) -> Fixture {
    let course = request_ok(
        stdin,
        reader,
        "s1",
        "courses.create",
        json!({
            "sessionToken": token,
            "code": "OWD-2026-04",
            "title": "Open Water Diver",
            "passThreshold": 75.0
        }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        "s2",
        "students.create",
        json!({ "sessionToken": token, "lastName": "Marlin", "firstName": "Sam" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "courses.enroll",
        json!({ "sessionToken": token, "courseId": course_id, "studentId": student_id }),
    );

    let mut skills = Vec::new();
    for (i, (code, name, critical)) in [
        ("MASK-CLEAR", "Mask clear and replace", true),
        ("FIN-PIVOT", "Fin pivot neutral buoyancy", false),
        ("CESA", "Controlled emergency swimming ascent", true),
    ]
    .iter()
    .enumerate()
    {
        let created = request_ok(
            stdin,
            reader,
            &format!("sk{}", i),
            "skills.create",
            json!({
                "sessionToken": token,
                "code": code,
                "name": name,
                "critical": critical,
                "maxPoints": 5.0,
                "passPoints": 3.0
            }),
        );
        skills.push(
            created
                .get("skillId")
                .and_then(|v| v.as_str())
                .expect("skillId")
                .to_string(),
        );
    }
    Fixture {
        course_id,
        student_id,
        skills,
    }
}

#[test]
fn critical_skill_below_pass_mark_fails_a_strong_percentage() {
    let workspace = temp_dir("divecert-eval-critical");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let fx = seed(&mut stdin, &mut reader, &token);

    // 12/15 = 80%, above threshold, but the critical mask clear is a 2.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.student_id,
            "evalDate": "2026-06-01",
            "items": [
                { "skillId": fx.skills[0], "points": 2.0 },
                { "skillId": fx.skills[1], "points": 5.0 },
                { "skillId": fx.skills[2], "points": 5.0 }
            ]
        }),
    );
    let score = created.get("score").expect("score");
    assert_eq!(score.get("passed").and_then(|v| v.as_bool()), Some(false));
    let pct = score.get("percent").and_then(|v| v.as_f64()).expect("pct");
    assert!((pct - 80.0).abs() < 1e-9);
    assert_eq!(
        score.get("criticalFails").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    // Exactly on threshold passes when no critical skill is missed.
    let at_threshold = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.student_id,
            "evalDate": "2026-06-02",
            "items": [
                { "skillId": fx.skills[1], "points": 3.0 },
                { "skillId": fx.skills[2], "points": 4.5 }
            ]
        }),
    );
    let score = at_threshold.get("score").expect("score");
    assert_eq!(score.get("passed").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn evaluation_items_are_validated_and_replaced_atomically() {
    let workspace = temp_dir("divecert-eval-items");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let fx = seed(&mut stdin, &mut reader, &token);

    let over_max = request(
        &mut stdin,
        &mut reader,
        "1",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.student_id,
            "items": [{ "skillId": fx.skills[0], "points": 6.0 }]
        }),
    );
    assert_eq!(error_code(&over_max), "bad_params");

    let duplicate_skill = request(
        &mut stdin,
        &mut reader,
        "2",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.student_id,
            "items": [
                { "skillId": fx.skills[0], "points": 3.0 },
                { "skillId": fx.skills[0], "points": 4.0 }
            ]
        }),
    );
    assert_eq!(error_code(&duplicate_skill), "bad_params");

    let unknown_skill = request(
        &mut stdin,
        &mut reader,
        "3",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.student_id,
            "items": [{ "skillId": "no-such-skill", "points": 3.0 }]
        }),
    );
    assert_eq!(error_code(&unknown_skill), "not_found");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "evaluations.create",
        json!({
            "sessionToken": token,
            "courseId": fx.course_id,
            "studentId": fx.student_id,
            "evalDate": "2026-06-03",
            "items": [
                { "skillId": fx.skills[0], "points": 4.0, "note": "smooth" },
                { "skillId": fx.skills[1], "points": 2.0 }
            ]
        }),
    );
    let evaluation_id = created
        .get("evaluationId")
        .and_then(|v| v.as_str())
        .expect("evaluationId")
        .to_string();

    // Updating with a new item set replaces the old one wholesale.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evaluations.update",
        json!({
            "sessionToken": token,
            "evaluationId": evaluation_id,
            "comment": "retest after surface interval",
            "items": [
                { "skillId": fx.skills[0], "points": 5.0 },
                { "skillId": fx.skills[1], "points": 4.0 },
                { "skillId": fx.skills[2], "points": 4.0 }
            ]
        }),
    );
    let score = updated.get("score").expect("score");
    assert_eq!(score.get("itemCount").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(score.get("passed").and_then(|v| v.as_bool()), Some(true));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "evaluations.get",
        json!({ "sessionToken": token, "evaluationId": evaluation_id }),
    );
    let items = fetched
        .get("items")
        .and_then(|v| v.as_array())
        .expect("items");
    assert_eq!(items.len(), 3);
    assert_eq!(
        fetched.get("comment").and_then(|v| v.as_str()),
        Some("retest after surface interval")
    );

    // A rejected update must not land its valid fields either.
    let mixed = request(
        &mut stdin,
        &mut reader,
        "6b",
        "evaluations.update",
        json!({
            "sessionToken": token,
            "evaluationId": evaluation_id,
            "comment": "should not stick",
            "items": [{ "skillId": fx.skills[0], "points": 6.0 }]
        }),
    );
    assert_eq!(error_code(&mixed), "bad_params");
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6c",
        "evaluations.get",
        json!({ "sessionToken": token, "evaluationId": evaluation_id }),
    );
    assert_eq!(
        fetched.get("comment").and_then(|v| v.as_str()),
        Some("retest after surface interval")
    );
    assert_eq!(
        fetched
            .get("items")
            .and_then(|v| v.as_array())
            .expect("items")
            .len(),
        3
    );

    // A skill in use can no longer be removed from the catalog.
    let blocked = request(
        &mut stdin,
        &mut reader,
        "7",
        "skills.delete",
        json!({ "sessionToken": token, "skillId": fx.skills[0] }),
    );
    assert_eq!(error_code(&blocked), "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "evaluations.delete",
        json!({ "sessionToken": token, "evaluationId": evaluation_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "9",
        "evaluations.get",
        json!({ "sessionToken": token, "evaluationId": evaluation_id }),
    );
    assert_eq!(error_code(&gone), "not_found");
    // With its only reference gone the skill is deletable again.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "skills.delete",
        json!({ "sessionToken": token, "skillId": fx.skills[0] }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
