//! Persistence of captures and the digest gated merge performed at the end of a run.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use crate::format::{self, RichCapture};
use crate::{digest, elf, CaptureError, Hex, InstructionTable};

fn create(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path)
}

/// Writes every offset with `base_address` applied and no metadata.
pub fn write_legacy(
    path: impl AsRef<Path>,
    offsets: impl IntoIterator<Item = i64>,
    base_address: i64,
) -> Result<(), format::Error> {
    let mut writer = BufWriter::new(create(path.as_ref())?);
    format::emit_legacy(&mut writer, offsets, base_address)?;
    writer.flush()?;
    Ok(())
}

pub fn read_legacy(path: impl AsRef<Path>) -> Result<BTreeSet<i64>, format::Error> {
    let mut reader = BufReader::new(File::open(path)?);
    format::parse_legacy(&mut reader)
}

pub fn write_rich(
    path: impl AsRef<Path>,
    instructions: &InstructionTable,
    base_address: i64,
    digest: &str,
) -> Result<(), format::Error> {
    let mut writer = BufWriter::new(create(path.as_ref())?);
    format::emit_rich(&mut writer, instructions, base_address, digest)?;
    writer.flush()?;
    Ok(())
}

pub fn read_rich(path: impl AsRef<Path>) -> Result<RichCapture, format::Error> {
    let mut reader = BufReader::new(File::open(path)?);
    format::parse_rich(&mut reader)
}

/// What a previous capture can contribute to the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorCapture {
    /// No usable capture: the file is missing or could not be read.
    Empty,
    /// A capture of the same binary.
    Valid(RichCapture),
    /// A capture of a different build of the binary. Nothing in it is reused.
    Stale { digest: String },
}

impl PriorCapture {
    pub fn load(path: impl AsRef<Path>, digest: &str) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::Empty;
        }

        match read_rich(path) {
            Ok(capture) if capture.digest == digest => Self::Valid(capture),
            Ok(capture) => {
                tracing::warn! {
                    path = %path.display(),
                    previous = %capture.digest,
                    current = %digest,
                    "binary changed since the previous capture, discarding it"
                };
                Self::Stale {
                    digest: capture.digest,
                }
            }
            Err(err) => {
                tracing::warn! {
                    path = %path.display(),
                    error = %err,
                    "unable to read previous capture, starting over"
                };
                Self::Empty
            }
        }
    }
}

/// Merges the instructions of this run into the capture at `path` and persists the result.
///
/// The digest of `binary` decides whether the previous capture is reused. The merged capture
/// is always written in the rich format and is returned.
pub fn merge_on_exit(
    path: impl AsRef<Path>,
    binary: impl AsRef<Path>,
    instructions: InstructionTable,
) -> Result<RichCapture, CaptureError> {
    let digest = digest::digest_file(binary.as_ref())?;
    merge_with_digest(path, binary, instructions, digest)
}

pub fn merge_with_digest(
    path: impl AsRef<Path>,
    binary: impl AsRef<Path>,
    mut instructions: InstructionTable,
    digest: String,
) -> Result<RichCapture, CaptureError> {
    let path = path.as_ref();
    let captured = instructions.len();

    let base_address = match PriorCapture::load(path, &digest) {
        PriorCapture::Valid(prior) => {
            // Lengths already on disk win over the ones seen in this run.
            instructions.extend(prior.instructions);
            prior.base_address
        }
        PriorCapture::Empty | PriorCapture::Stale { .. } => elf::base_address_of(binary)?,
    };

    write_rich(path, &instructions, base_address, &digest)?;

    tracing::info! {
        path = %path.display(),
        digest = %digest,
        base_address = %Hex(base_address),
        captured = captured,
        total = instructions.len(),
        "wrote capture"
    };

    Ok(RichCapture {
        digest,
        base_address,
        instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::fixtures::elf64;

    fn table(entries: &[(i64, u8)]) -> InstructionTable {
        entries.iter().copied().collect()
    }

    fn binary(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("traced");
        std::fs::write(&path, elf64(0x401000, 0x1000)).unwrap();
        path
    }

    #[test]
    fn first_run_computes_base_address() {
        let dir = tempfile::tempdir().unwrap();
        let binary = binary(dir.path());
        let path = dir.path().join("capture");

        let capture = merge_on_exit(&path, &binary, table(&[(0x1000, 4)])).unwrap();
        assert_eq!(capture.base_address, 0x400000);
        assert_eq!(capture.digest, digest::digest_file(&binary).unwrap());
        assert_eq!(read_rich(&path).unwrap(), capture);
    }

    #[test]
    fn same_digest_unions_and_keeps_stored_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let binary = binary(dir.path());
        let path = dir.path().join("capture");
        write_rich(&path, &table(&[(0x10, 2), (0x20, 3)]), 0x7000, "same").unwrap();

        let capture = merge_with_digest(
            &path,
            &binary,
            table(&[(0x20, 9), (0x30, 1)]),
            "same".to_string(),
        )
        .unwrap();

        // The stored base address is kept even though the binary says otherwise.
        assert_eq!(capture.base_address, 0x7000);
        assert_eq!(capture.instructions, table(&[(0x10, 2), (0x20, 3), (0x30, 1)]));
    }

    #[test]
    fn merging_a_capture_into_itself_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let binary = binary(dir.path());
        let path = dir.path().join("capture");
        let original = table(&[(0x10, 2), (0x20, 3), (0x30, 1)]);
        write_rich(&path, &original, 0x400000, "d").unwrap();

        let again = read_rich(&path).unwrap().instructions;
        let capture = merge_with_digest(&path, &binary, again, "d".to_string()).unwrap();
        assert_eq!(capture.instructions, original);
        assert_eq!(read_rich(&path).unwrap().instructions, original);
    }

    #[test]
    fn changed_digest_discards_previous_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let binary = binary(dir.path());
        let path = dir.path().join("capture");
        write_rich(&path, &table(&[(0x10, 2), (0x20, 3)]), 0x7000, "A").unwrap();

        let capture =
            merge_with_digest(&path, &binary, table(&[(0x40, 5)]), "B".to_string()).unwrap();
        assert_eq!(capture.digest, "B");
        assert_eq!(capture.base_address, 0x400000);
        assert_eq!(capture.instructions, table(&[(0x40, 5)]));
    }

    #[test]
    fn unreadable_capture_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let binary = binary(dir.path());
        let path = dir.path().join("capture");
        std::fs::write(&path, b"not a capture").unwrap();

        let capture = merge_with_digest(&path, &binary, table(&[(1, 1)]), "d".to_string()).unwrap();
        assert_eq!(capture.base_address, 0x400000);
        assert_eq!(read_rich(&path).unwrap().instructions, table(&[(1, 1)]));
    }

    #[test]
    fn non_elf_binary_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("script.sh");
        std::fs::write(&binary, b"#!/bin/sh\necho hello\n").unwrap();
        let path = dir.path().join("capture");

        let result = merge_with_digest(&path, &binary, table(&[(1, 1)]), "d".to_string());
        assert!(matches!(result, Err(CaptureError::Elf(_))));
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PriorCapture::load(dir.path().join("none"), "d"), PriorCapture::Empty);
    }

    #[test]
    fn corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt");
        std::fs::write(&path, b"garbage").unwrap();
        assert_eq!(PriorCapture::load(&path, "d"), PriorCapture::Empty);
    }

    #[test]
    fn digest_decides_between_valid_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture");
        let table: InstructionTable = [(4, 1)].into_iter().collect();
        write_rich(&path, &table, 0x1000, "aaaa").unwrap();

        match PriorCapture::load(&path, "aaaa") {
            PriorCapture::Valid(capture) => {
                assert_eq!(capture.base_address, 0x1000);
                assert_eq!(capture.instructions, table);
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert_eq!(
            PriorCapture::load(&path, "bbbb"),
            PriorCapture::Stale {
                digest: "aaaa".to_string()
            }
        );
    }
}
