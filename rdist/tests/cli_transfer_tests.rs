//! Runs the `rdist` binary against a fake `rsync` placed first on PATH.
//!
//! The fake accepts every target except host `locked`, for which it fails like an ssh key
//! rejection. Arguments of every invocation are appended to `calls.log` next to it.

use assert_cmd::Command;
use std::os::unix::fs::PermissionsExt;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let rsync = bin.join("rsync");
        std::fs::write(
            &rsync,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    *@locked:*) echo 'Permission denied (publickey).' >&2; exit 255 ;;\n  esac\ndone\nexit 0\n",
                dir.path().join("calls.log").display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&rsync, std::fs::Permissions::from_mode(0o755)).unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "not a real key").unwrap();
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600)).unwrap();
        std::fs::write(dir.path().join("config.toml"), "").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        Self { dir }
    }

    fn command(&self) -> Command {
        self.command_with_key(&self.dir.path().join("id_ed25519"))
    }

    fn command_with_key(&self, key: &std::path::Path) -> Command {
        let mut cmd = Command::cargo_bin("rdist").unwrap();
        let path = format!(
            "{}:{}",
            self.dir.path().join("bin").display(),
            std::env::var("PATH").unwrap_or_default()
        );
        cmd.env("PATH", path)
            .arg("--config")
            .arg(self.dir.path().join("config.toml"))
            .arg("--key-file")
            .arg(key)
            .args(["--no-redrive", "--retry-delay-sec", "0", "--max-attempts", "2"])
            .arg("--report-file")
            .arg(self.report_path());
        cmd
    }

    fn source(&self) -> String {
        format!("{}/", self.dir.path().join("src").display())
    }

    fn report_path(&self) -> std::path::PathBuf {
        self.dir.path().join("report.json")
    }

    fn report(&self) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(self.report_path()).unwrap()).unwrap()
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[test]
fn all_targets_succeed() {
    let fixture = Fixture::new();
    fixture
        .command()
        .args(["-H", "deploy@web1", "-H", "deploy@web2:2222"])
        .args([fixture.source().as_str(), "/opt/app"])
        .assert()
        .success();
    let report = fixture.report();
    assert_eq!(report["passes"], 1);
    assert_eq!(report["report"]["total"], 2);
    assert_eq!(report["report"]["failed"], serde_json::json!([]));
    let calls = fixture.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().any(|call| call.ends_with("deploy@web1:/opt/app")));
    assert!(calls.iter().any(|call| call.contains("-p 2222")));
    // never implied
    assert!(calls.iter().all(|call| !call.contains("--delete")));
}

#[test]
fn rejected_key_fails_the_run() {
    let fixture = Fixture::new();
    fixture
        .command()
        .args(["-H", "deploy@web1", "-H", "deploy@locked"])
        .args([fixture.source().as_str(), "/opt/app"])
        .assert()
        .failure()
        .code(1);
    let report = fixture.report();
    assert_eq!(report["report"]["total"], 2);
    assert_eq!(report["report"]["succeeded"][0]["host"], "web1");
    let failed = &report["report"]["failed"][0];
    assert_eq!(failed["target"]["host"], "locked");
    assert_eq!(failed["attempts_made"], 2);
    assert_eq!(failed["final_outcome"]["exit_reason"], "AuthFailure");
    assert_eq!(failed["final_outcome"]["succeeded"], false);
    // one call for web1, two attempts for locked
    assert_eq!(fixture.calls().len(), 3);
}

#[test]
fn malformed_descriptor_is_skipped_but_fails_the_run() {
    let fixture = Fixture::new();
    fixture
        .command()
        .args(["-H", "deploy@web1", "-H", "web2:notaport"])
        .args([fixture.source().as_str(), "/opt/app"])
        .assert()
        .failure()
        .code(1);
    let report = fixture.report();
    assert_eq!(report["report"]["total"], 1);
    assert_eq!(report["report"]["succeeded"][0]["host"], "web1");
    assert_eq!(fixture.calls().len(), 1);
}

#[test]
fn missing_key_file_stops_before_any_transfer() {
    let fixture = Fixture::new();
    fixture
        .command_with_key(std::path::Path::new("/nonexistent/rdist-test-key"))
        .args(["-H", "deploy@web1"])
        .args([fixture.source().as_str(), "/opt/app"])
        .assert()
        .failure()
        .code(1);
    assert!(fixture.calls().is_empty());
    assert!(!fixture.report_path().exists());
}

#[test]
fn missing_paths_are_rejected() {
    let fixture = Fixture::new();
    fixture
        .command()
        .args(["-H", "deploy@web1"])
        .assert()
        .failure()
        .code(1);
    assert!(fixture.calls().is_empty());
}
