use std::path::Path;
use std::process::Command;

use groundtruth::{store, InstructionTable};

fn write_sample(dir: &Path) {
    let table: InstructionTable = [(0x10, 2), (0x20, 3), (0x30, 1)].into_iter().collect();
    store::write_rich(dir.join("ls.capture"), &table, 0x1000, "d").unwrap();
    store::write_legacy(dir.join("ls_objdump.out"), [0x1010, 0x1021, 0x1040], 0).unwrap();
}

#[test]
fn evaluate_prints_batch_line() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_gt-evaluate"))
        .arg(dir.path().join("ls.capture"))
        .arg(dir.path().join("ls_objdump.out"))
        .arg(dir.path().join("fp.txt"))
        .arg(dir.path().join("fn.txt"))
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().last(), Some("BATCH 1 1 1 2"));
    assert!(dir.path().join("fp.txt").is_file());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("fn.txt")).unwrap(),
        "0x1020 len 3\n0x1030 len 1\n"
    );
}

#[test]
fn evaluate_fails_without_required_arguments() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_gt-evaluate"))
        .arg(dir.path().join("ls.capture"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn evaluate_fails_on_unreadable_input() {
    let dir = tempfile::tempdir().unwrap();
    write_sample(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_gt-evaluate"))
        .arg(dir.path().join("missing.capture"))
        .arg(dir.path().join("ls_objdump.out"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!String::from_utf8_lossy(&output.stdout).contains("BATCH"));
}

#[test]
fn batch_writes_csv_report() {
    let dynamic = tempfile::tempdir().unwrap();
    let statics = tempfile::tempdir().unwrap();
    write_sample(dynamic.path());
    std::fs::rename(
        dynamic.path().join("ls_objdump.out"),
        statics.path().join("ls_objdump.out"),
    )
    .unwrap();
    store::write_rich(dynamic.path().join("cat.capture"), &InstructionTable::new(), 0, "d").unwrap();
    let report = dynamic.path().join("report.csv");

    let status = Command::new(env!("CARGO_BIN_EXE_gt-batch"))
        .arg(dynamic.path())
        .arg(statics.path())
        .arg("_objdump.out")
        .arg(&report)
        .status()
        .unwrap();

    assert!(status.success());
    assert_eq!(
        std::fs::read_to_string(report).unwrap(),
        "binary,tp,fp_c,fp_o,fn\nls,1,1,1,2\n"
    );
}
