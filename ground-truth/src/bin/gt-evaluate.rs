use anyhow::Result;
use clap::Parser;

use std::path::PathBuf;

use groundtruth::batch;
use tracing_subscriber::filter::EnvFilter;

/// Scores a static disassembly against the instructions observed at run time.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Rich capture recorded by the QEMU plugin.
    dynamic: PathBuf,

    /// Legacy capture produced by the static tool under test.
    r#static: PathBuf,

    /// Lists static offsets that fall inside an executed instruction.
    fp_list: Option<PathBuf>,

    /// Lists executed instructions missing from the static capture. Requires `fp_list`.
    fn_list: Option<PathBuf>,

    /// Lists static offsets that cannot be confirmed either way. Requires `fn_list`.
    unk_list: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Optional positionals fill left to right.
    let lists: Vec<PathBuf> = [args.fp_list, args.fn_list, args.unk_list]
        .into_iter()
        .flatten()
        .collect();

    let evaluation = batch::evaluate_files(&args.dynamic, &args.r#static, &lists)?;
    println!("{evaluation}");

    Ok(())
}
