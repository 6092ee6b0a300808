use anyhow::{Context, Result};
use clap::Parser;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use groundtruth::batch;
use tracing_subscriber::filter::EnvFilter;

/// Evaluates every capture in a directory and collects the counts into a CSV file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory of `<name>.capture` files recorded by the QEMU plugin.
    dynamic_dir: PathBuf,

    /// Directory of legacy captures produced by the static tool under test.
    static_dir: PathBuf,

    /// Appended to `<name>` to find the static capture, e.g. `_objdump.out`.
    static_suffix: String,

    /// CSV file to write.
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let samples = batch::find_samples(&args.dynamic_dir, &args.static_dir, &args.static_suffix)?;
    tracing::info!(samples = samples.len(), "evaluating captures");

    let output = File::create(&args.output)
        .with_context(|| format!("unable to create {:?}", args.output))?;
    batch::write_report(&samples, BufWriter::new(output))?;

    Ok(())
}
