use std::io;

pub mod accumulator;
pub mod batch;
pub mod digest;
pub mod elf;
pub mod evaluate;
pub mod format;
pub mod maps;
pub mod objdump;
pub mod session;
pub mod store;

pub use format::{InstructionOffset, RichCapture};

/// Instruction starts captured for one binary, keyed by file offset (base address excluded).
pub type InstructionTable = std::collections::BTreeMap<i64, u8>;

/// Displays addresses in hex inside log fields.
pub struct Hex<T>(pub T);

impl std::fmt::Display for Hex<u64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for Hex<i64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("unable to resolve addresses")]
    Maps(#[from] maps::Error),

    #[error("capture file error")]
    Format(#[from] format::Error),

    #[error("unable to determine base address")]
    Elf(#[from] elf::Error),

    #[error("IO Error:")]
    Io(#[from] io::Error),
}
