use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_session_options() -> Result<(), Box<dyn std::error::Error>> {
    Command::cargo_bin("docsession-server")?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--idle-timeout-minutes"))
        .stdout(predicate::str::contains("--disconnect-behavior"))
        .stdout(predicate::str::contains("DOCSESSION_MAX_SESSIONS"));
    Ok(())
}

#[test]
fn zero_max_sessions_fails_before_binding() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    Command::cargo_bin("docsession-server")?
        .env_remove("DOCSESSION_MAX_SESSIONS")
        .args(["--max-sessions", "0", "--listen-addr", "127.0.0.1:0"])
        .arg("--temp-dir")
        .arg(dir.path())
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_sessions"));
    Ok(())
}

#[test]
fn unknown_disconnect_behavior_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    Command::cargo_bin("docsession-server")?
        .env_remove("DOCSESSION_DISCONNECT_BEHAVIOR")
        .args(["--disconnect-behavior", "shred"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disconnect behavior"));
    Ok(())
}
