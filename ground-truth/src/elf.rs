//! Base address discovery for ELF binaries.
//!
//! The base address is the value added to a file offset to obtain the virtual address that
//! byte is loaded at. It is taken from the first section that is both allocated and
//! executable: `sh_addr - sh_offset`.

use std::fs::File;
use std::io;
use std::path::Path;

use goblin::container::Ctx;
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR};
use goblin::elf::{Elf, SectionHeader};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to parse ELF headers")]
    Parse(#[from] goblin::error::Error),

    #[error("binary has no section that is both allocated and executable")]
    NoExecutableSection,

    #[error("IO Error:")]
    Io(#[from] io::Error),
}

/// Reads the section table of either ELF class.
///
/// Only the identification and file header are read first. They decide the word size and byte
/// order used to read the section headers.
pub fn section_headers(bytes: &[u8]) -> Result<Vec<SectionHeader>, Error> {
    let header = Elf::parse_header(bytes)?;
    let ctx = Ctx::new(header.container()?, header.endianness()?);
    let sections = SectionHeader::parse(
        bytes,
        header.e_shoff as usize,
        header.e_shnum as usize,
        ctx,
    )?;
    Ok(sections)
}

pub fn base_address(bytes: &[u8]) -> Result<i64, Error> {
    let flags = (SHF_ALLOC | SHF_EXECINSTR) as u64;
    let section = section_headers(bytes)?
        .into_iter()
        .find(|section| section.sh_flags & flags == flags)
        .ok_or(Error::NoExecutableSection)?;

    // Address arithmetic is modular, as for the loader.
    Ok(section.sh_addr.wrapping_sub(section.sh_offset) as i64)
}

pub fn base_address_of(path: impl AsRef<Path>) -> Result<i64, Error> {
    let file = File::open(path)?;
    let mmap = unsafe { memmap::Mmap::map(&file)? };
    base_address(&mmap)
}
