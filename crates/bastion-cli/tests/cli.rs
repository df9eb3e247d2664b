use assert_cmd::Command;
use std::fs;
use std::path::Path;

/// A config pointing at an unroutable gateway with state kept in `dir`.
fn write_config(dir: &Path) -> String {
    let path = dir.join("config.toml");
    let state = dir.join("state");
    fs::write(
        &path,
        format!(
            r#"
[gateway]
host = "192.0.2.1"

[timeouts]
connect = 1
command = 1

[state]
dir = "{}"
"#,
            state.display()
        ),
    )
    .unwrap();
    path.to_string_lossy().to_string()
}

fn bastion() -> Command {
    Command::cargo_bin("bastion").unwrap()
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn invalid_port_fails_before_touching_the_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = bastion()
        .args(["--config", &config, "--yes", "--json", "add", "80x", "tcp"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["status"], "failed");
    assert_eq!(value["phase"], "validating");
    assert!(value["reason"].as_str().unwrap().contains("invalid port spec"));
    // Nothing was recorded or locked.
    assert!(!dir.path().join("state").exists());
}

#[test]
fn reversed_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = bastion()
        .args(["--config", &config, "--yes", "add", "8085-8080"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid port spec '8085-8080'"));
}

#[test]
fn unknown_protocol_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = bastion()
        .args(["--config", &config, "--yes", "--json", "remove", "8080", "icmp"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["action"], "remove");
    assert!(value["reason"].as_str().unwrap().contains("invalid protocol 'icmp'"));
}

#[test]
fn missing_host_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("absent.toml");

    let output = bastion()
        .args(["--config", config.to_str().unwrap(), "--yes", "add", "8080"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no gateway host configured"));
}

#[test]
fn local_list_of_fresh_state_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = bastion()
        .args(["--config", &config, "--json", "list", "--local"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(stdout_json(&output), serde_json::json!([]));
}

#[test]
fn init_config_writes_defaults_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg").join("config.toml");
    let path = path.to_str().unwrap();

    bastion()
        .args(["--config", path, "--host", "vps.example.com", "init-config"])
        .assert()
        .success();

    let written = fs::read_to_string(path).unwrap();
    assert!(written.contains("host = \"vps.example.com\""));
    assert!(written.contains("table = \"bastion\""));

    bastion()
        .args(["--config", path, "init-config"])
        .assert()
        .failure();

    bastion()
        .args(["--config", path, "init-config", "--force"])
        .assert()
        .success();
}

#[test]
fn malformed_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[homelab]\ntunnel_v4 = \"nope\"\n").unwrap();

    let output = bastion()
        .args(["--config", path.to_str().unwrap(), "list", "--local"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to parse config"));
}

#[cfg(unix)]
#[test]
fn interrupt_while_connecting_releases_the_lock() {
    use std::os::unix::fs::PermissionsExt;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    // An ssh that never answers, so the process sits in connect holding the lock.
    let bin = dir.path().join("bin");
    fs::create_dir(&bin).unwrap();
    let ssh = bin.join("ssh");
    fs::write(&ssh, "#!/bin/sh\nexec sleep 5\n").unwrap();
    fs::set_permissions(&ssh, fs::Permissions::from_mode(0o755)).unwrap();
    let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("bastion"))
        .args(["--config", &config, "--yes", "add", "8080"])
        .env("PATH", path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let lock = dir.path().join("state").join("root_192.0.2.1_22.lock");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !lock.exists() {
        assert!(Instant::now() < deadline, "lock file never appeared");
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(200));

    let killed = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let status = child.wait().unwrap();
    // Exited through the connect timeout rather than dying on the signal.
    assert_eq!(status.code(), Some(1));
    assert!(!lock.exists(), "stale lock left at {}", lock.display());
}
