use std::process::{Command, Stdio};

// Integration tests driving the real binary via the cargo-provided path.

fn subshell_path() -> String {
    std::env::var("CARGO_BIN_EXE_subshell").unwrap_or_else(|_| "target/debug/subshell".to_string())
}

fn run_script(script: &str, extra: &[&str]) -> std::process::Output {
    Command::new(subshell_path())
        .args(extra)
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .output()
        .expect("spawn subshell")
}

#[test]
fn pipeline_streams_to_stdout() {
    let out = run_script("echo hi | tr a-z A-Z", &[]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "HI\n");
}

#[test]
fn stdout_capture_prints_captured_text() {
    let out = run_script("printf 'a\\nb\\n' | grep b", &["--capture", "stdout"]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "b\n");
}

#[test]
fn exit_code_comes_from_last_stage() {
    let out = run_script("false", &[]);
    assert_eq!(out.status.code(), Some(1));
    let out = run_script("false | true", &[]);
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn trailing_redirect_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = Command::new(subshell_path())
        .current_dir(dir.path())
        .arg("-c")
        .arg("echo stored > out.txt")
        .stdin(Stdio::null())
        .output()
        .expect("spawn subshell");
    assert!(out.status.success());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "stored\n"
    );
}

#[test]
fn stderr_merges_into_captured_stdout() {
    let out = run_script("sh -c 'echo oops >&2' 2>&1", &["--capture", "stdout"]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "oops\n");
}

#[test]
fn missing_command_reports_and_fails() {
    let out = run_script("definitely-not-a-command-xyz", &[]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("command not found"));
}

#[test]
fn shebang_script_runs_through_its_interpreter() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("greet");
    std::fs::write(&script, "#!/bin/sh\necho \"hello $1\"\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let out = run_script(
        &format!("{} world", script.display()),
        &["--capture", "stdout"],
    );
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello world\n");
}

#[test]
fn background_pipeline_returns_immediately() {
    // No piped streams: the sleeping child would hold a pipe open for
    // its full duration and stall the read-to-EOF in output().
    let started = std::time::Instant::now();
    let status = Command::new(subshell_path())
        .arg("-c")
        .arg("sleep 5 &")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("spawn subshell");
    assert!(status.success());
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[test]
fn script_file_runs_line_by_line() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("batch.sub");
    std::fs::write(&script, "# comment\necho one\n\necho two\n").unwrap();
    let out = Command::new(subshell_path())
        .arg("--capture")
        .arg("stdout")
        .arg(script.to_str().unwrap())
        .stdin(Stdio::null())
        .output()
        .expect("spawn subshell");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "one\ntwo\n");
}
