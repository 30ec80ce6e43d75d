use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn default_config() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/default.toml")
}

/// 两张相邻的 A4 多页图纸，标题栏含锚点、内部编码与页码。
fn a4_pair() -> String {
    let mut out = String::new();
    let mut pair = |code: i32, value: String| {
        writeln!(out, "{code}\n{value}").expect("write to string");
    };
    pair(0, "SECTION".into());
    pair(2, "ENTITIES".into());
    for (origin, code, page) in [
        (0.0, "1234567-JG001-001", "共2张 第1张"),
        (215.0, "1234567-JG001-002", "共2张 第2张"),
    ] {
        pair(0, "LWPOLYLINE".into());
        pair(8, "FRAME".into());
        pair(90, "4".into());
        pair(70, "1".into());
        for (x, y) in [(0.0, 0.0), (210.0, 0.0), (210.0, 297.0), (0.0, 297.0)] {
            pair(10, format!("{}", origin + x));
            pair(20, format!("{y}"));
        }
        let anchor = origin + 210.0;
        for (dx, y, content) in [(150.0, 55.0, "CNPE"), (45.0, 25.0, code), (15.0, 15.0, page)] {
            pair(0, "TEXT".into());
            pair(8, "TB".into());
            pair(10, format!("{}", anchor - dx));
            pair(20, format!("{y}"));
            pair(40, "2.5".into());
            pair(1, content.to_string());
        }
    }
    pair(0, "ENDSEC".into());
    pair(0, "EOF".into());
    out
}

#[test]
fn help_lists_options() {
    Command::cargo_bin("cadsheet")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-split"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn directory_input_produces_splits_and_report() {
    let dir = tempfile::tempdir().expect("temp dir");
    let drawings = dir.path().join("drawings");
    fs::create_dir_all(&drawings).expect("drawings dir");
    fs::write(drawings.join("sheets.DXF"), a4_pair()).expect("write dxf");
    fs::write(drawings.join("notes.txt"), "ignored").expect("write txt");
    let out = dir.path().join("out");

    Command::cargo_bin("cadsheet")
        .expect("binary")
        .arg(&drawings)
        .arg("--config")
        .arg(default_config())
        .arg("--out")
        .arg(&out)
        .arg("--job-id")
        .arg("cli-job")
        .arg("--concurrency")
        .arg("2")
        .assert()
        .success()
        .stdout(predicate::str::contains("job cli-job: succeeded_with_flags"));

    assert!(out.join("sheets").join("1234567-JG001-001.dxf").is_file());
    assert!(out.join("sheets").join("1234567-JG001-002.dxf").is_file());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("report.json")).expect("report"))
            .expect("report json");
    assert_eq!(report["job"]["id"], "cli-job");
    assert_eq!(report["job"]["drawings"][0]["sheet_sets"][0]["master"], 0);
    assert_eq!(report["job"]["album"]["cover_internal_code"], "1234567-JG001-FM");
    let outputs = report["outputs"].as_array().expect("outputs");
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0]["sha256"].as_str().map(str::len), Some(64));
    assert_eq!(outputs[0]["sheet_set"], 0);
}

#[test]
fn no_split_writes_only_the_report() {
    let dir = tempfile::tempdir().expect("temp dir");
    let input = dir.path().join("sheets.dxf");
    fs::write(&input, a4_pair()).expect("write dxf");
    let out = dir.path().join("out");
    let report = dir.path().join("custom").join("job.json");

    Command::cargo_bin("cadsheet")
        .expect("binary")
        .arg(&input)
        .arg("--config")
        .arg(default_config())
        .arg("--out")
        .arg(&out)
        .arg("--no-split")
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("job job-"));

    assert!(report.is_file());
    assert!(!out.join("sheets").exists());
}

#[test]
fn drawing_without_frames_exits_with_failure_status() {
    let dir = tempfile::tempdir().expect("temp dir");
    let input = dir.path().join("blank.dxf");
    fs::write(&input, "0\nSECTION\n2\nENTITIES\n0\nLINE\n8\n0\n10\n0\n20\n0\n11\n5\n21\n0\n0\nENDSEC\n0\nEOF\n")
        .expect("write dxf");

    Command::cargo_bin("cadsheet")
        .expect("binary")
        .arg(&input)
        .arg("--config")
        .arg(default_config())
        .arg("--out")
        .arg(dir.path().join("out"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("failed"));
}

#[test]
fn missing_input_is_reported() {
    let dir = tempfile::tempdir().expect("temp dir");
    Command::cargo_bin("cadsheet")
        .expect("binary")
        .arg(dir.path().join("nope.dxf"))
        .arg("--config")
        .arg(default_config())
        .assert()
        .failure()
        .stderr(predicate::str::contains("输入不存在"));
}
