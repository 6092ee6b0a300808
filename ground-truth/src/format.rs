//! Encoding of the two capture formats.
//!
//! # Rich format
//!
//! `| magic: [u8; 8] | version: u8 | dlen: u16 | digest: [u8; dlen] | base: i64 | count: u64 |`
//! followed by `count` records of `| offset: i64 | length: u8 |` in ascending offset order.
//! Offsets exclude the base address. All integers are little-endian.
//!
//! # Legacy format
//!
//! A bare sequence of `i64` little-endian offsets in ascending order, with the base address
//! already applied. There is no header, so the format carries no digest and no lengths.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use crate::InstructionTable;

pub static MAGIC: &[u8; 8] = b"\xf1\x06gtcap\x07";

pub const VERSION: u8 = 1;

/// An instruction start relative to the beginning of the traced binary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstructionOffset {
    pub offset: i64,
    pub length: u8,
}

impl From<(i64, u8)> for InstructionOffset {
    fn from((offset, length): (i64, u8)) -> Self {
        Self { offset, length }
    }
}

/// Contents of a rich capture file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichCapture {
    pub digest: String,
    pub base_address: i64,
    pub instructions: InstructionTable,
}

impl RichCapture {
    pub fn iter(&self) -> impl Iterator<Item = InstructionOffset> + '_ {
        self.instructions.iter().map(|(&o, &l)| (o, l).into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capture contains invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported capture version: {0}")]
    UnsupportedVersion(u8),

    #[error("capture data does not contain enough bytes")]
    NotEnoughBytes,

    #[error("capture digest is not valid UTF-8")]
    BadDigest(#[from] std::string::FromUtf8Error),

    #[error("digest of {0} bytes is too long to store")]
    DigestTooLong(usize),

    #[error("offset {offset:#x} does not fit in 64 bits with base address {base_address:#x}")]
    AddressOverflow { offset: i64, base_address: i64 },

    #[error("IO Error:")]
    Io(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::NotEnoughBytes,
            _ => Self::Io(err),
        }
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], Error> {
    let mut buffer = [0u8; N];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Writes `offset + base_address` for every offset, which must come in ascending order.
pub fn emit_legacy<W: Write>(
    writer: &mut W,
    offsets: impl IntoIterator<Item = i64>,
    base_address: i64,
) -> Result<(), Error> {
    for offset in offsets {
        let absolute = offset
            .checked_add(base_address)
            .ok_or(Error::AddressOverflow {
                offset,
                base_address,
            })?;
        writer.write_all(&absolute.to_le_bytes())?;
    }
    Ok(())
}

pub fn parse_legacy<R: Read>(reader: &mut R) -> Result<BTreeSet<i64>, Error> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let chunks = bytes.chunks_exact(std::mem::size_of::<i64>());
    if !chunks.remainder().is_empty() {
        return Err(Error::NotEnoughBytes);
    }

    Ok(chunks
        .map(|chunk| {
            let mut buffer = [0u8; 8];
            buffer.copy_from_slice(chunk);
            i64::from_le_bytes(buffer)
        })
        .collect())
}

pub fn emit_rich<W: Write>(
    writer: &mut W,
    instructions: &InstructionTable,
    base_address: i64,
    digest: &str,
) -> Result<(), Error> {
    let dlen = u16::try_from(digest.len()).map_err(|_| Error::DigestTooLong(digest.len()))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;
    writer.write_all(&dlen.to_le_bytes())?;
    writer.write_all(digest.as_bytes())?;
    writer.write_all(&base_address.to_le_bytes())?;
    writer.write_all(&(instructions.len() as u64).to_le_bytes())?;

    let mut record = [0u8; 9];
    for (&offset, &length) in instructions {
        record[..8].copy_from_slice(&offset.to_le_bytes());
        record[8] = length;
        writer.write_all(&record)?;
    }
    Ok(())
}

pub fn parse_rich<R: Read>(reader: &mut R) -> Result<RichCapture, Error> {
    let magic: [u8; 8] = read_array(reader)?;
    if &magic != MAGIC {
        return Err(Error::InvalidMagic);
    }

    let version: [u8; 1] = read_array(reader)?;
    let version = version[0];
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let dlen = u16::from_le_bytes(read_array(reader)?) as usize;
    let mut digest = vec![0u8; dlen];
    reader.read_exact(&mut digest)?;
    let digest = String::from_utf8(digest)?;

    let base_address = i64::from_le_bytes(read_array(reader)?);
    let count = u64::from_le_bytes(read_array(reader)?);

    let mut instructions = InstructionTable::new();
    for _ in 0..count {
        let record: [u8; 9] = read_array(reader)?;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&record[..8]);
        instructions
            .entry(i64::from_le_bytes(offset))
            .or_insert(record[8]);
    }

    Ok(RichCapture {
        digest,
        base_address,
        instructions,
    })
}
