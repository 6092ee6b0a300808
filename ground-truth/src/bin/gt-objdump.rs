use anyhow::{bail, Context, Result};
use clap::Parser;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use groundtruth::{objdump, store};
use tracing_subscriber::filter::EnvFilter;

/// Disassembles every file in a directory with `objdump -d` and stores the instruction starts
/// as legacy captures.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory of binaries to disassemble.
    input_dir: PathBuf,

    /// Directory receiving `<name>_objdump_raw.txt` and `<name>_objdump.out`.
    output_dir: PathBuf,

    /// Disassembler to run.
    #[arg(long, default_value_t = String::from("objdump"))]
    objdump: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("unable to create {:?}", args.output_dir))?;

    let mut inputs = Vec::new();
    for entry in fs::read_dir(&args.input_dir)
        .with_context(|| format!("unable to list {:?}", args.input_dir))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            inputs.push(entry.path());
        }
    }
    inputs.sort();

    for input in &inputs {
        let Some(name) = input.file_name().and_then(|name| name.to_str()) else {
            tracing::warn!(path = %input.display(), "skipping file with non-UTF-8 name");
            continue;
        };

        match disassemble(&args.objdump, input, &args.output_dir, name) {
            Ok((instructions, undecoded)) => {
                println!("{name}: {instructions} instructions, {undecoded} undecodable");
            }
            Err(err) => {
                tracing::warn!(path = %input.display(), error = ?err, "skipping file");
            }
        }
    }

    Ok(())
}

fn disassemble(objdump: &str, input: &Path, output_dir: &Path, name: &str) -> Result<(usize, usize)> {
    let output = Command::new(objdump)
        .arg("-d")
        .arg(input)
        .output()
        .with_context(|| format!("unable to run {objdump}"))?;
    if !output.status.success() {
        bail!(
            "{objdump} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    fs::write(output_dir.join(format!("{name}_objdump_raw.txt")), &output.stdout)?;

    let listing = objdump::parse_listing(&String::from_utf8_lossy(&output.stdout));
    // objdump already prints runtime addresses
    store::write_legacy(
        output_dir.join(format!("{name}_objdump.out")),
        listing.offsets.iter().copied(),
        0,
    )?;

    Ok((listing.offsets.len(), listing.undecoded))
}
