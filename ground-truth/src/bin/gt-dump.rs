use anyhow::{Context, Result};
use clap::Parser;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use groundtruth::{digest, store, Hex};
use tracing_subscriber::filter::EnvFilter;

/// Prints a rich capture with the raw bytes of each recorded instruction.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Binary the capture was recorded against.
    binary: PathBuf,

    /// Rich capture file.
    capture: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let capture = store::read_rich(&args.capture)
        .with_context(|| format!("unable to read capture {:?}", args.capture))?;
    let digest = digest::digest_file(&args.binary)
        .with_context(|| format!("unable to hash {:?}", args.binary))?;

    let file = File::open(&args.binary).with_context(|| format!("unable to open {:?}", args.binary))?;
    let image = unsafe { memmap::Mmap::map(&file)? };

    let mut out = BufWriter::new(io::stdout().lock());

    let status = if digest == capture.digest { "matches" } else { "does not match" };
    writeln!(out, "digest: {} ({status} binary)", capture.digest)?;
    writeln!(out, "base address: {}", Hex(capture.base_address))?;
    writeln!(out, "instructions: {}", capture.instructions.len())?;

    for insn in capture.iter() {
        let address = Hex(insn.offset.wrapping_add(capture.base_address));
        let bytes = usize::try_from(insn.offset).ok().and_then(|start| {
            let end = start.checked_add(insn.length as usize)?;
            image.get(start..end)
        });
        match bytes {
            Some(bytes) => writeln!(out, "{address}: {}", hex::encode(bytes))?,
            None => {
                tracing::warn!(offset = %Hex(insn.offset), "instruction lies outside of the binary");
                writeln!(out, "{address}: <outside of binary>")?
            }
        }
    }

    out.flush()?;
    Ok(())
}
