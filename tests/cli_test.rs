#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

const REFUSE_BAD: &str = r#"d=$(cat); if [ "$d" = bad ]; then echo refused >&2; exit 3; fi; printf %s "$d""#;

fn ffindex(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ffindex"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("FFINDEX_LOG")
        .output()
        .unwrap()
}

fn seed(dir: &Path) -> (String, String) {
    let d = dir.join("in.ffdata");
    let i = dir.join("in.ffindex");
    fs::write(&d, b"good\0bad\0fine\0").unwrap();
    fs::write(&i, "g1\t0\t5\nb\t5\t4\ng2\t9\t5\n").unwrap();
    (d.display().to_string(), i.display().to_string())
}

fn path(dir: &Path, name: &str) -> String {
    dir.join(name).display().to_string()
}

#[test]
fn test_skipped_records_exit_2_with_summary_and_report() {
    let dir = tempdir().unwrap();
    let (d, i) = seed(dir.path());
    let (out_d, out_i, report) = (path(dir.path(), "out.ffdata"), path(dir.path(), "out.ffindex"),
                                  path(dir.path(), "report.json"));

    let out = ffindex(&[
        "apply", &d, &i, "-d", &out_d, "-i", &out_i, "-j", "2",
        "--policy", "skip", "--report", &report, "--", "sh", "-c", REFUSE_BAD,
    ]);

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(2), "{stderr}");
    assert!(stderr.contains("2/3 records processed, 1 failed"), "{stderr}");

    assert_eq!(fs::read(&out_d).unwrap(), b"good\0fine\0");
    assert_eq!(fs::read_to_string(&out_i).unwrap(), "g1\t0\t5\ng2\t5\t5\n");

    let json: serde_json::Value = serde_json::from_slice(&fs::read(&report).unwrap()).unwrap();
    assert_eq!(json["policy"], "skip-and-report");
    assert_eq!(json["total"], 3);
    assert_eq!(json["succeeded"], 2);
    assert_eq!(json["failures"][0]["name"], "b");
    assert_eq!(json["failures"][0]["position"], 1);
    assert_eq!(json["failures"][0]["exit_code"], 3);
}

#[test]
fn test_clean_run_exits_0_and_keeps_records() {
    let dir = tempdir().unwrap();
    let (d, i) = seed(dir.path());
    let (out_d, out_i) = (path(dir.path(), "out.ffdata"), path(dir.path(), "out.ffindex"));

    let out = ffindex(&["-q", "apply", &d, &i, "-d", &out_d, "-i", &out_i, "-j", "3", "--", "cat"]);

    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(fs::read(&out_d).unwrap(), b"good\0bad\0fine\0");
    assert_eq!(fs::read_to_string(&out_i).unwrap(), fs::read_to_string(&i).unwrap());
}

#[test]
fn test_abort_exits_1_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let (d, i) = seed(dir.path());
    let (out_d, out_i) = (path(dir.path(), "out.ffdata"), path(dir.path(), "out.ffindex"));

    let out = ffindex(&["apply", &d, &i, "-d", &out_d, "-i", &out_i, "--", "sh", "-c", REFUSE_BAD]);

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("ffindex: Aborted after record 1 (b) failed"), "{stderr}");
    assert!(!Path::new(&out_d).exists());
    assert!(!Path::new(&out_i).exists());
}

#[test]
fn test_missing_index_exits_1() {
    let dir = tempdir().unwrap();
    let (d, _) = seed(dir.path());
    let missing = path(dir.path(), "nope.ffindex");
    let (out_d, out_i) = (path(dir.path(), "out.ffdata"), path(dir.path(), "out.ffindex"));

    let out = ffindex(&["apply", &d, &missing, "-d", &out_d, "-i", &out_i, "--", "cat"]);

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("nope.ffindex"), "{stderr}");
    assert!(!Path::new(&out_d).exists());
}

#[test]
fn test_get_prints_record_without_terminator() {
    let dir = tempdir().unwrap();
    let (d, i) = seed(dir.path());

    let out = ffindex(&["get", &d, &i, "g2", "g1"]);

    assert_eq!(out.status.code(), Some(0));
    assert_eq!(out.stdout, b"finegood");
}
