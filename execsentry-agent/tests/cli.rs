//! Binary smoke tests.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

/// Command with an isolated home so no user configuration leaks in.
fn agent(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("execsentry-agent").expect("binary built");
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("RUST_LOG")
        .timeout(std::time::Duration::from_secs(30));
    cmd
}

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn prints_help() {
    let home = TempDir::new().expect("tempdir");
    agent(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--list-rules"))
        .stdout(predicate::str::contains("--events"));
}

#[test]
fn prints_version() {
    let home = TempDir::new().expect("tempdir");
    agent(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn lists_builtin_rules() {
    let home = TempDir::new().expect("tempdir");
    agent(&home)
        .arg("--list-rules")
        .assert()
        .success()
        .stdout(predicate::str::contains("defense_evasion_log_files_deleted"))
        .stdout(predicate::str::contains("System Log File Deletion"));
}

#[test]
fn matching_event_prints_one_json_alert() {
    let home = TempDir::new().expect("tempdir");
    let output = agent(&home)
        .write_stdin("{\"command\":\"rm\",\"args\":[\"-f\",\"/var/log/auth.log\"]}\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).expect("utf-8");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1, "unexpected output: {stdout}");

    let alert: serde_json::Value = serde_json::from_str(lines[0]).expect("json alert");
    assert_eq!(alert["rule_id"], "defense_evasion_log_files_deleted");
    assert_eq!(alert["severity"], "high");
    assert!(
        alert["detail"]
            .as_str()
            .is_some_and(|d| d.contains("/var/log/auth.log"))
    );
}

#[test]
fn non_matching_and_malformed_input_is_quiet() {
    let home = TempDir::new().expect("tempdir");
    agent(&home)
        .write_stdin(concat!(
            "{\"command\":\"cat\",\"args\":[\"/var/log/auth.log\"]}\n",
            "this is not json\n",
            "\n",
            "{\"command\":\"rm\",\"args\":[\"/tmp/scratch\"]}\n",
        ))
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn reads_events_from_file_with_config_rules() {
    let home = TempDir::new().expect("tempdir");
    let config = config_file(
        r#"
[engine]
builtin_rules = false

[[rules]]
id = "tmp-wipe"
name = "Temp wipe"
severity = "low"
trigger_verbs = ["rm"]
patterns = ["/tmp/*"]
"#,
    );
    let events = config_file("{\"command\":\"rm\",\"args\":[\"/tmp/evidence\"]}\n");

    agent(&home)
        .arg("--config")
        .arg(config.path())
        .arg("--events")
        .arg(events.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rule_id\":\"tmp-wipe\""))
        .stdout(predicate::str::contains("defense_evasion").not());
}

#[test]
fn invalid_config_exits_with_error() {
    let home = TempDir::new().expect("tempdir");
    let config = config_file("[engine]\nqueue_capacity = 0\n");
    agent(&home)
        .arg("--config")
        .arg(config.path())
        .write_stdin("")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn no_rules_exits_with_error() {
    let home = TempDir::new().expect("tempdir");
    agent(&home)
        .arg("--no-builtin-rules")
        .write_stdin("")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no detection rules"));
}

#[test]
fn replay_beyond_queue_capacity_alerts_on_every_event() {
    let home = TempDir::new().expect("tempdir");
    let input: String = (0..1000)
        .map(|i| format!("{{\"command\":\"rm\",\"args\":[\"-f\",\"/var/log/app-{i}.log\"]}}\n"))
        .collect();

    let config = config_file("[logging]\nformat = \"json\"\n");

    let output = agent(&home)
        .arg("--config")
        .arg(config.path())
        .arg("--queue-capacity")
        .arg("10")
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("utf-8");
    let alerts: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("json alert"))
        .collect();
    assert_eq!(alerts.len(), 1000);
    assert!(
        alerts[999]["detail"]
            .as_str()
            .is_some_and(|d| d.contains("/var/log/app-999.log"))
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("\"events_dropped\":0"), "unexpected logs: {stderr}");
}

#[cfg(unix)]
#[test]
fn sigterm_stops_agent_while_input_is_open() {
    use std::io::{BufRead, BufReader};
    use std::process::{Command as StdCommand, Stdio};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    let home = TempDir::new().expect("tempdir");
    let mut child = StdCommand::new(env!("CARGO_BIN_EXE_execsentry-agent"))
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("agent spawned");
    // Held so the agent never sees end of input.
    let stdin = child.stdin.take().expect("stdin piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        let line = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("agent should start");
        if line.contains("Rule engine started") {
            break;
        }
    }
    std::thread::sleep(Duration::from_millis(200));

    let kill = StdCommand::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .expect("kill runs");
    assert!(kill.success());

    let mut logs = Vec::new();
    while let Ok(line) = rx.recv_timeout(Duration::from_secs(10)) {
        logs.push(line);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().expect("wait") {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("agent ignored SIGTERM; logs: {logs:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    drop(stdin);

    assert!(status.success(), "exit status {status:?}; logs: {logs:?}");
    assert!(logs.iter().any(|l| l.contains("Received SIGTERM")), "logs: {logs:?}");
}
