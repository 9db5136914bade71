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

#[test]
fn bootstrap_account_is_forced_admin_and_roles_gate_user_management() {
    let workspace = temp_dir("divecert-auth-roles");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First account: no session, role param ignored in favor of admin.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "fullName": "Dana Reef",
            "email": "Dana@Example.Test",
            "password": "trimix-2024",
            "role": "instructor"
        }),
    );
    assert_eq!(first.get("role").and_then(|v| v.as_str()), Some("admin"));
    // Emails are stored lowercased.
    assert_eq!(
        first.get("email").and_then(|v| v.as_str()),
        Some("dana@example.test")
    );

    let admin_login = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "dana@example.test", "password": "trimix-2024" }),
    );
    let admin_token = admin_login
        .get("sessionToken")
        .and_then(|v| v.as_str())
        .expect("sessionToken")
        .to_string();

    // Second account defaults to instructor.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({
            "sessionToken": admin_token,
            "fullName": "Noa Current",
            "email": "noa@example.test",
            "password": "nitrox-2024"
        }),
    );
    assert_eq!(
        second.get("role").and_then(|v| v.as_str()),
        Some("instructor")
    );

    let instructor_login = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "noa@example.test", "password": "nitrox-2024" }),
    );
    let instructor_token = instructor_login
        .get("sessionToken")
        .and_then(|v| v.as_str())
        .expect("sessionToken")
        .to_string();

    // Instructors may run course work but not user management.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.list",
        json!({ "sessionToken": instructor_token }),
    );
    let forbidden = request(
        &mut stdin,
        &mut reader,
        "7",
        "users.list",
        json!({ "sessionToken": instructor_token }),
    );
    assert_eq!(error_code(&forbidden), "forbidden");

    // Wrong password, unknown email, and disabled account all read the same.
    let wrong = request(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "email": "dana@example.test", "password": "wrong-password" }),
    );
    assert_eq!(error_code(&wrong), "unauthorized");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "9",
        "auth.login",
        json!({ "email": "nobody@example.test", "password": "trimix-2024" }),
    );
    assert_eq!(error_code(&unknown), "unauthorized");

    // Logout invalidates the token.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "auth.logout",
        json!({ "sessionToken": instructor_token }),
    );
    let after_logout = request(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "sessionToken": instructor_token }),
    );
    assert_eq!(error_code(&after_logout), "unauthorized");

    // Short passwords are refused.
    let short = request(
        &mut stdin,
        &mut reader,
        "12",
        "users.create",
        json!({
            "sessionToken": admin_token,
            "fullName": "Too Short",
            "email": "short@example.test",
            "password": "tiny"
        }),
    );
    assert_eq!(error_code(&short), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn password_reset_flow_rotates_the_credential_once() {
    let workspace = temp_dir("divecert-auth-reset");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "fullName": "Dana Reef",
            "email": "dana@example.test",
            "password": "trimix-2024"
        }),
    );

    let requested = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.requestPasswordReset",
        json!({ "email": "dana@example.test" }),
    );
    let token = requested
        .get("token")
        .and_then(|v| v.as_str())
        .expect("reset token")
        .to_string();

    // Unknown accounts get the same "requested" answer but no token.
    let opaque = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.requestPasswordReset",
        json!({ "email": "nobody@example.test" }),
    );
    assert_eq!(opaque.get("requested").and_then(|v| v.as_bool()), Some(true));
    assert!(opaque.get("token").is_none());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.resetPassword",
        json!({ "token": token, "newPassword": "heliox-2025" }),
    );

    // Old password is dead, new one works, token is single-use.
    let old = request(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "email": "dana@example.test", "password": "trimix-2024" }),
    );
    assert_eq!(error_code(&old), "unauthorized");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "email": "dana@example.test", "password": "heliox-2025" }),
    );
    let reused = request(
        &mut stdin,
        &mut reader,
        "8",
        "auth.resetPassword",
        json!({ "token": token, "newPassword": "another-pass-1" }),
    );
    assert_eq!(value_is_error(&reused), true);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

fn value_is_error(value: &serde_json::Value) -> bool {
    value.get("ok").and_then(|v| v.as_bool()) == Some(false)
}

#[test]
fn first_run_without_workspace_names_the_real_problem() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // No workspace selected yet; the bootstrap create must not be mistaken
    // for a session problem.
    let created = request(
        &mut stdin,
        &mut reader,
        "1",
        "users.create",
        json!({
            "fullName": "Dana Reef",
            "email": "dana@example.test",
            "password": "trimix-2024"
        }),
    );
    assert_eq!(error_code(&created), "no_workspace");

    drop(stdin);
    let _ = child.wait();
}
