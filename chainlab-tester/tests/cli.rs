use std::process::Command;

fn temp_path(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "chainlab-cli-{label}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ))
}

#[test]
fn cli_list_lessons_writes_output() {
    let exe = env!("CARGO_BIN_EXE_chainlab-tester");
    let output_path = temp_path("list");
    let status = Command::new(exe)
        .args(["--list-lessons", "--output"])
        .arg(&output_path)
        .status()
        .expect("run cli");
    assert!(status.success());
    let content = std::fs::read_to_string(output_path).expect("read output");
    assert!(content.contains("Available lessons"));
    assert!(content.contains("transaction-simulator"));
}

#[test]
fn cli_validate_succeeds_for_bundled_lessons() {
    let exe = env!("CARGO_BIN_EXE_chainlab-tester");
    let output = Command::new(exe)
        .arg("--validate")
        .output()
        .expect("run cli");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("10 lessons passed catalog validation"));
}

#[test]
fn cli_runs_every_policy_with_json_report() {
    let exe = env!("CARGO_BIN_EXE_chainlab-tester");
    let output_path = temp_path("run");
    let output = Command::new(exe)
        .args([
            "--lessons",
            "gas-under-pressure,approval-risk",
            "--policies",
            "all",
            "--seeds",
            "1,0x2A",
            "--iterations",
            "1",
            "--report",
            "json",
            "--output",
        ])
        .arg(&output_path)
        .output()
        .expect("run cli");
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let content = std::fs::read_to_string(output_path).expect("read output");
    let results: serde_json::Value = serde_json::from_str(&content).expect("json report");
    let results = results.as_array().expect("array of results");
    assert_eq!(results.len(), 2 * 3 * 2);
    assert!(results.iter().all(|r| r["passed"] == true));
}

#[test]
fn cli_rejects_unknown_lessons() {
    let exe = env!("CARGO_BIN_EXE_chainlab-tester");
    let output = Command::new(exe)
        .args(["--lessons", "warp-drive"])
        .output()
        .expect("run cli");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown lesson"));
}
