#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

const ALICE: &str = "01J0SQQP7M70P6Y3R4T8D8G8M2";

fn rk_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_rk") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/rk");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "reward-kernel-cli", "--bin", "rk"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build rk binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rk-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut raw = path.as_os_str().to_owned();
        raw.push(suffix);
        let _ = std::fs::remove_file(raw);
    }
}

fn rk_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(rk_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run rk command {:?}: {err}", args),
    }
}

fn rk_json(db_path: &Path, args: &[&str]) -> Value {
    let output = rk_output(db_path, args);
    assert!(
        output.status.success(),
        "rk {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn fixture_path(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/cli/v1/fixtures")
        .join(name)
        .display()
        .to_string()
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(rk_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "points",
        "ledger",
        "profile",
        "streak",
        "badge",
        "quest",
        "challenge",
        "level",
        "event",
        "policy",
        "user",
    ] {
        assert!(stdout.contains(required), "missing `{}` in help:\n{}", required, stdout);
    }
}

#[test]
fn award_and_spend_emit_ledger_entries() {
    let db = temp_db("award-spend");

    let award = rk_json(
        &db,
        &["points", "award", "--user", ALICE, "--points", "100", "--action", "complete_lesson"],
    );
    assert_eq!(award["entry"]["transaction_type"], "earn");
    assert_eq!(award["entry"]["balance_after"], 100);
    assert_eq!(award["profile"]["total_points"], 100);
    assert_eq!(award["truncated"], false);

    let spend = rk_json(
        &db,
        &[
            "points",
            "spend",
            "--user",
            ALICE,
            "--amount",
            "60",
            "--reference-type",
            "purchase",
            "--reference-id",
            "order-7",
        ],
    );
    assert_eq!(spend["entry"]["transaction_type"], "spend");
    assert_eq!(spend["entry"]["points"], -60);
    assert_eq!(spend["entry"]["balance_after"], 40);
    assert_eq!(spend["entry"]["reference_id"], "order-7");
    assert_eq!(spend["profile"]["available_points"], 40);
    assert_eq!(spend["rewards"].as_array().map(Vec::len), Some(0));

    let balance = rk_json(&db, &["points", "balance", "--user", ALICE]);
    assert_eq!(balance["balance"], 40);

    let history = rk_json(&db, &["ledger", "history", "--user", ALICE, "--type", "spend"]);
    let entries = match history["entries"].as_array() {
        Some(value) => value.clone(),
        None => panic!("history entries missing: {history}"),
    };
    assert_eq!(entries.len(), 1);
    assert!(history["next_cursor"].is_null());

    remove_db(&db);
}

#[test]
fn overdraft_fails_without_writing() {
    let db = temp_db("overdraft");
    let _ = rk_json(
        &db,
        &["points", "award", "--user", ALICE, "--points", "40", "--action", "login"],
    );

    let output = rk_output(&db, &["points", "spend", "--user", ALICE, "--amount", "41"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("insufficient funds"), "stderr={}", stderr);
    assert!(stderr.contains("available 40"), "stderr={}", stderr);

    let balance = rk_json(&db, &["points", "balance", "--user", ALICE]);
    assert_eq!(balance["balance"], 40);
    remove_db(&db);
}

#[test]
fn ledger_check_reports_drift_and_exits_non_zero() {
    let db = temp_db("check");
    let _ = rk_json(
        &db,
        &["points", "award", "--user", ALICE, "--points", "25", "--action", "login"],
    );

    let healthy = rk_json(&db, &["ledger", "check"]);
    assert_eq!(healthy["contract_version"], "ledger_check.v1");
    assert_eq!(healthy["healthy"], true);
    assert_eq!(healthy["status"]["ledger_entries"], 1);

    let conn = match Connection::open(&db) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    if let Err(err) = conn.execute("UPDATE reward_profiles SET available_points = 99", []) {
        panic!("failed to inject drift: {err}");
    }
    drop(conn);

    let output = rk_output(&db, &["ledger", "check"]);
    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["healthy"], false);
    assert_eq!(report["issues"][0]["code"], "balance_drift");
    assert_eq!(report["drift_sample"][0]["cached_balance"], 99);
    assert_eq!(report["drift_sample"][0]["ledger_balance"], 25);

    let reconciled = rk_json(&db, &["ledger", "reconcile", "--user", ALICE]);
    assert_eq!(reconciled["drift_corrected"], true);
    assert_eq!(reconciled["ledger_balance"], 25);
    let _ = rk_json(&db, &["ledger", "check"]);
    remove_db(&db);
}

#[test]
fn badge_definitions_and_streaks_round_through_cli() {
    let db = temp_db("badge");

    let badge = rk_json(&db, &["badge", "create", "--file", &fixture_path("badge.sample.json")]);
    assert_eq!(badge["name"], "Week Warrior");
    assert_eq!(badge["rarity"], "rare");
    assert_eq!(badge["is_active"], true);

    let badge_id = match badge["badge_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("badge_id missing: {badge}"),
    };
    let deactivated = rk_json(&db, &["badge", "deactivate", "--id", &badge_id]);
    assert_eq!(deactivated["is_active"], false);
    let active = rk_json(&db, &["badge", "list", "--active-only"]);
    assert_eq!(active.as_array().map(Vec::len), Some(0));

    let first = rk_json(
        &db,
        &["streak", "record", "--user", ALICE, "--date", "2026-03-01"],
    );
    assert_eq!(first["streak"]["current_count"], 1);
    let second = rk_json(
        &db,
        &["streak", "record", "--user", ALICE, "--date", "2026-03-02"],
    );
    assert_eq!(second["streak"]["current_count"], 2);

    let sweep = rk_json(&db, &["streak", "sweep", "--as-of", "2026-03-10"]);
    assert_eq!(sweep["decayed"], 1);
    remove_db(&db);
}

#[test]
fn quest_progress_completes_once() {
    let db = temp_db("quest");
    let quest_file = std::env::temp_dir().join(format!("rk-quest-{}.json", Ulid::new()));
    let body = serde_json::json!({
        "name": "Three Lessons",
        "criteria": {"progress": {"lessons": 3}},
        "points_reward": 30
    });
    if let Err(err) = std::fs::write(&quest_file, body.to_string()) {
        panic!("failed to write quest file: {err}");
    }

    let quest = rk_json(&db, &["quest", "create", "--file", &quest_file.display().to_string()]);
    let quest_id = match quest["quest_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("quest_id missing: {quest}"),
    };

    let partial = rk_json(
        &db,
        &[
            "quest",
            "progress",
            "--user",
            ALICE,
            "--id",
            &quest_id,
            "--delta-json",
            r#"{"lessons": 2}"#,
        ],
    );
    assert_eq!(partial["is_completed"], false);

    let done = rk_json(
        &db,
        &[
            "quest",
            "progress",
            "--user",
            ALICE,
            "--id",
            &quest_id,
            "--delta-json",
            r#"{"lessons": 1}"#,
        ],
    );
    assert_eq!(done["is_completed"], true);
    assert_eq!(done["completed_now"], true);

    let again = rk_json(
        &db,
        &[
            "quest",
            "progress",
            "--user",
            ALICE,
            "--id",
            &quest_id,
            "--delta-json",
            r#"{"lessons": 1}"#,
        ],
    );
    assert_eq!(again["completed_now"], false);

    let balance = rk_json(&db, &["points", "balance", "--user", ALICE]);
    assert_eq!(balance["balance"], 30);

    let _ = std::fs::remove_file(&quest_file);
    remove_db(&db);
}
