use std::collections::BTreeSet;
use std::path::Path;

use groundtruth::evaluate::{evaluate, DetailLogs, GroundTruth};
use groundtruth::{digest, store, InstructionTable};

/// ELF64 image whose only executable section is `.text` at 0x401000, file offset 0x1000.
fn write_binary(path: &Path, padding: u8) {
    let shoff = 0x40usize;
    let mut bytes = vec![0u8; shoff + 2 * 0x40];
    bytes[..4].copy_from_slice(b"\x7fELF");
    bytes[4] = 2;
    bytes[5] = 1;
    bytes[6] = 1;
    bytes[16..18].copy_from_slice(&2u16.to_le_bytes());
    bytes[18..20].copy_from_slice(&62u16.to_le_bytes());
    bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
    bytes[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
    bytes[52..54].copy_from_slice(&0x40u16.to_le_bytes());
    bytes[58..60].copy_from_slice(&0x40u16.to_le_bytes());
    bytes[60..62].copy_from_slice(&2u16.to_le_bytes());

    let text = shoff + 0x40;
    bytes[text + 4..text + 8].copy_from_slice(&1u32.to_le_bytes());
    bytes[text + 8..text + 16].copy_from_slice(&6u64.to_le_bytes());
    bytes[text + 16..text + 24].copy_from_slice(&0x401000u64.to_le_bytes());
    bytes[text + 24..text + 32].copy_from_slice(&0x1000u64.to_le_bytes());

    // Changes the digest without moving any section.
    bytes.push(padding);
    std::fs::write(path, bytes).unwrap();
}

fn table(entries: &[(i64, u8)]) -> InstructionTable {
    entries.iter().copied().collect()
}

#[test]
fn rich_capture_survives_a_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.capture");
    let instructions = table(&[(0x1000, 4), (0x1004, 1), (0x2000, 15)]);

    store::write_rich(&path, &instructions, 0x400000, "abc123").unwrap();
    let capture = store::read_rich(&path).unwrap();

    assert_eq!(capture.digest, "abc123");
    assert_eq!(capture.base_address, 0x400000);
    assert_eq!(capture.instructions, instructions);
}

#[test]
fn legacy_capture_holds_absolute_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.out");

    store::write_legacy(&path, [0x10, 0x20], 0x400000).unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
    let offsets = store::read_legacy(&path).unwrap();
    assert_eq!(offsets, BTreeSet::from([0x400010, 0x400020]));
}

#[test]
fn reruns_accumulate_until_the_binary_changes() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("target");
    let output = dir.path().join("target.capture");
    write_binary(&binary, 0);

    let first = store::merge_on_exit(&output, &binary, table(&[(0x1000, 4)])).unwrap();
    assert_eq!(first.base_address, 0x400000);
    assert_eq!(first.digest, digest::digest_file(&binary).unwrap());

    let second = store::merge_on_exit(&output, &binary, table(&[(0x1000, 2), (0x1010, 3)])).unwrap();
    assert_eq!(second.instructions, table(&[(0x1000, 4), (0x1010, 3)]));
    assert_eq!(store::read_rich(&output).unwrap(), second);

    write_binary(&binary, 1);
    let third = store::merge_on_exit(&output, &binary, table(&[(0x1020, 1)])).unwrap();
    assert_ne!(third.digest, second.digest);
    assert_eq!(third.instructions, table(&[(0x1020, 1)]));
}

#[test]
fn evaluates_captures_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let dynamic = dir.path().join("sample.capture");
    let statics = dir.path().join("sample.out");

    store::write_rich(&dynamic, &table(&[(0x10, 2), (0x20, 3), (0x30, 1)]), 0x1000, "d").unwrap();
    store::write_legacy(&statics, [0x1010, 0x1021, 0x1040], 0).unwrap();

    let capture = store::read_rich(&dynamic).unwrap();
    let statics = store::read_legacy(&statics).unwrap();
    let truth = GroundTruth::new(&capture.instructions, capture.base_address);

    let mut fp = Vec::new();
    let mut fn_ = Vec::new();
    let mut unk = Vec::new();
    let counts = evaluate(
        &statics,
        &truth,
        &mut DetailLogs::cascade([&mut fp, &mut fn_, &mut unk]),
    )
    .unwrap();

    assert_eq!(counts.batch_line(), "BATCH 1 1 1 2");
    assert_eq!(String::from_utf8(fp).unwrap(), "0x1021 in 0x1020 len 3\n");
    assert_eq!(String::from_utf8(fn_).unwrap(), "0x1020 len 3\n0x1030 len 1\n");
    assert_eq!(String::from_utf8(unk).unwrap(), "0x1040 after 0x1030\n");
}
