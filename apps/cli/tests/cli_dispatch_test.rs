//! End-to-end tests for the `kiln` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Project with a CSV snapshot, one training script and two manifests.
fn project() -> TempDir {
    let temp = TempDir::new().unwrap();
    let root = temp.path();

    let mut csv = String::from("x,noise,target\n");
    for i in 0..40 {
        let x = f64::from(i) / 4.0;
        csv.push_str(&format!("{x},{},{}\n", i % 3, 2.0 * x + 1.0));
    }
    std::fs::write(root.join("data.csv"), csv).unwrap();
    std::fs::write(root.join("train.py"), "def train(df): ...\n").unwrap();

    std::fs::create_dir(root.join("manifests")).unwrap();
    std::fs::write(
        root.join("manifests/baseline.yaml"),
        "model_id: baseline\nentry_point: baseline\nsignature_files: [train.py]\nconfig:\n  target: target\n",
    )
    .unwrap();
    std::fs::write(
        root.join("manifests/linear.toml"),
        "model_id = \"linear\"\nentry_point = \"linear\"\nsignature_files = [\"train.py\"]\n\n[config]\ntarget = \"target\"\nepochs = 300\n",
    )
    .unwrap();
    temp
}

fn kiln(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.current_dir(root)
        .env("HOME", root)
        .env("KILN_STORE", format!("sqlite://{}", root.join("runs.db").display()))
        .env("KILN_DATA", root.join("data.csv"))
        .env_remove("KILN_SNAPSHOT_ID")
        .env_remove("KILN_MANIFESTS")
        .env_remove("KILN_CONCURRENCY")
        .env_remove("RUST_LOG");
    cmd
}

fn dispatch_json(root: &Path, extra: &[&str]) -> (serde_json::Value, i32) {
    let output = kiln(root).arg("dispatch").arg("--json").args(extra).output().unwrap();
    let json = serde_json::from_slice(&output.stdout).expect("dispatch --json should print JSON");
    (json, output.status.code().unwrap())
}

#[test]
fn test_dispatch_then_redispatch_skips() {
    let temp = project();

    let (first, code) = dispatch_json(temp.path(), &[]);
    assert_eq!(code, 0);
    assert_eq!(first["report"]["counters"]["succeeded"], 2);

    let (second, code) = dispatch_json(temp.path(), &[]);
    assert_eq!(code, 0);
    assert_eq!(second["report"]["counters"]["skipped"], 2);
    assert_eq!(second["report"]["entries"][0]["outcome"]["skipped"]["reason"]["kind"], "already_completed");
}

#[test]
fn test_dry_run_trains_nothing() {
    let temp = project();

    let (plan, code) = dispatch_json(temp.path(), &["--dry-run"]);
    assert_eq!(code, 0);
    assert_eq!(plan["report"]["dry_run"], true);
    assert_eq!(plan["report"]["counters"]["would_run"], 2);
    assert!(!temp.path().join("runs.db").exists());

    kiln(temp.path())
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs found"));
}

#[test]
fn test_invalid_manifest_exits_one() {
    let temp = project();
    std::fs::write(temp.path().join("manifests/broken.yaml"), "model_id: broken\n").unwrap();

    let (report, code) = dispatch_json(temp.path(), &[]);
    assert_eq!(code, 1);
    assert_eq!(report["report"]["counters"]["succeeded"], 2);
    assert_eq!(report["report"]["entries"][1]["outcome"]["failed"]["kind"], "config_invalid");
}

#[test]
fn test_failed_job_exits_two() {
    let temp = project();
    std::fs::write(
        temp.path().join("manifests/wrong_target.yaml"),
        "model_id: wrong\nentry_point: baseline\nsignature_files: [train.py]\nconfig:\n  target: missing_column\n",
    )
    .unwrap();

    let (report, code) = dispatch_json(temp.path(), &[]);
    assert_eq!(code, 2);
    assert_eq!(report["report"]["counters"]["failed"], 1);
}

#[test]
fn test_dispatch_with_selection() {
    let temp = project();

    let (out, code) = dispatch_json(temp.path(), &["--select", "rmse", "--direction", "min"]);
    assert_eq!(code, 0);
    assert_eq!(out["selection"]["selection"], "selected");
    assert_eq!(out["selection"]["best"]["model_id"], "linear");
    assert_eq!(out["leaderboard"].as_array().unwrap().len(), 2);

    kiln(temp.path())
        .args(["select", "r2", "--direction", "max"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Best model:"))
        .stdout(predicate::str::contains("linear"));
}

#[test]
fn test_select_without_runs() {
    let temp = project();
    kiln(temp.path())
        .args(["select", "rmse"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No completed run"));
}

#[test]
fn test_signature_is_stable_and_tracks_code() {
    let temp = project();
    let sig = |root: &Path| {
        let output = kiln(root).args(["signature", "baseline", "--json"]).output().unwrap();
        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["jobs"][0]["canonical_config"], r#"{"target":"target"}"#);
        json["jobs"][0]["signature"].as_str().unwrap().to_string()
    };

    let before = sig(temp.path());
    assert_eq!(before.len(), 64);
    assert_eq!(sig(temp.path()), before);

    std::fs::write(temp.path().join("train.py"), "def train(df): return 1\n").unwrap();
    assert_ne!(sig(temp.path()), before);
}

#[test]
fn test_runs_show_and_reap() {
    let temp = project();
    let (report, _) = dispatch_json(temp.path(), &[]);
    let run_id = report["report"]["entries"][0]["outcome"]["succeeded"]["run_id"].as_str().unwrap().to_string();

    kiln(temp.path())
        .args(["runs", "show", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("model.json"));

    kiln(temp.path())
        .args(["runs", "reap", "--older-than", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No stale runs"));
}

#[test]
fn test_missing_snapshot_is_an_error() {
    let temp = project();
    kiln(temp.path())
        .env_remove("KILN_DATA")
        .arg("dispatch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No data snapshot"));
}

#[test]
fn test_config_file_supplies_store() {
    let temp = project();
    std::fs::write(temp.path().join("kiln.toml"), "store = \"sqlite://from-config.db\"\nsnapshot_id = \"v1\"\n").unwrap();

    kiln(temp.path()).env_remove("KILN_STORE").arg("dispatch").assert().success();
    assert!(temp.path().join("from-config.db").exists());
}

#[test]
fn test_force_retrains_completed_jobs() {
    let temp = project();
    let (first, _) = dispatch_json(temp.path(), &[]);
    assert_eq!(first["report"]["counters"]["succeeded"], 2);

    let (forced, code) = dispatch_json(temp.path(), &["--force"]);
    assert_eq!(code, 0);
    assert_eq!(forced["report"]["counters"]["succeeded"], 2);
    assert_ne!(
        forced["report"]["entries"][0]["outcome"]["succeeded"]["run_id"],
        first["report"]["entries"][0]["outcome"]["succeeded"]["run_id"]
    );
}
