//! Evaluation of capture files on disk, one sample at a time or a directory at once.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::evaluate::{evaluate, DetailLogs, EvaluationCounts, GroundTruth};
use crate::{format, store, Hex};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read capture {path:?}")]
    Capture {
        path: PathBuf,
        #[source]
        source: format::Error,
    },

    #[error("unable to create {path:?}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to list {path:?}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to write report")]
    Csv(#[from] csv::Error),

    #[error("IO Error:")]
    Io(#[from] io::Error),
}

fn read_rich(path: &Path) -> Result<format::RichCapture, Error> {
    store::read_rich(path).map_err(|source| Error::Capture {
        path: path.to_owned(),
        source,
    })
}

fn read_legacy(path: &Path) -> Result<std::collections::BTreeSet<i64>, Error> {
    store::read_legacy(path).map_err(|source| Error::Capture {
        path: path.to_owned(),
        source,
    })
}

/// Outcome of scoring one static capture against one dynamic capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub digest: String,
    pub base_address: i64,
    pub dynamic_instructions: usize,
    pub static_instructions: usize,
    pub counts: EvaluationCounts,
}

impl std::fmt::Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "digest: {}", self.digest)?;
        writeln!(f, "base address: {}", Hex(self.base_address))?;
        writeln!(f, "dynamic instructions: {}", self.dynamic_instructions)?;
        writeln!(f, "static instructions: {}", self.static_instructions)?;
        writeln!(f, "{}", self.counts)?;
        write!(f, "{}", self.counts.batch_line())
    }
}

/// Scores the legacy capture at `static_path` against the rich capture at `dynamic`.
///
/// `lists` name the detail listings in cascade order: confirmed false positives, false
/// negatives, unknown false positives. Paths past the third are ignored.
pub fn evaluate_files(
    dynamic: &Path,
    static_path: &Path,
    lists: &[PathBuf],
) -> Result<Evaluation, Error> {
    let capture = read_rich(dynamic)?;
    let statics = read_legacy(static_path)?;

    let mut writers = Vec::new();
    for path in lists.iter().take(3) {
        let file = File::create(path).map_err(|source| Error::Create {
            path: path.clone(),
            source,
        })?;
        writers.push(BufWriter::new(file));
    }
    let mut logs = DetailLogs::cascade(writers);

    let truth = GroundTruth::new(&capture.instructions, capture.base_address);
    let counts = evaluate(&statics, &truth, &mut logs)?;

    Ok(Evaluation {
        digest: capture.digest,
        base_address: capture.base_address,
        dynamic_instructions: capture.instructions.len(),
        static_instructions: statics.len(),
        counts,
    })
}

/// A dynamic capture paired with the static capture of the same binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: String,
    pub dynamic: PathBuf,
    pub static_path: PathBuf,
}

/// Pairs every `<name>.capture` in `dynamic_dir` with `<static_dir>/<name><suffix>`.
///
/// Samples whose static capture does not exist are skipped. Samples are sorted by name.
pub fn find_samples(
    dynamic_dir: &Path,
    static_dir: &Path,
    suffix: &str,
) -> Result<Vec<Sample>, Error> {
    let list_error = |source| Error::List {
        path: dynamic_dir.to_owned(),
        source,
    };

    let mut samples = Vec::new();
    for entry in fs::read_dir(dynamic_dir).map_err(list_error)? {
        let entry = entry.map_err(list_error)?;
        if !entry.file_type().map_err(list_error)?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "capture") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            tracing::warn!(path = %path.display(), "skipping capture with non-UTF-8 name");
            continue;
        };

        let static_path = static_dir.join(format!("{name}{suffix}"));
        if !static_path.is_file() {
            tracing::warn!(sample = name, path = %static_path.display(), "static capture not found, skipping");
            continue;
        }

        samples.push(Sample {
            name: name.to_owned(),
            dynamic: path,
            static_path,
        });
    }

    samples.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(samples)
}

#[derive(Serialize, Debug)]
struct Row<'a> {
    binary: &'a str,
    tp: u64,
    fp_c: u64,
    fp_o: u64,
    #[serde(rename = "fn")]
    fn_: u64,
}

/// Evaluates every sample and writes one CSV row per sample, `binary,tp,fp_c,fp_o,fn`.
pub fn write_report<W: io::Write>(samples: &[Sample], writer: W) -> Result<(), Error> {
    let mut output = csv::Writer::from_writer(writer);

    for sample in samples {
        let counts = evaluate_files(&sample.dynamic, &sample.static_path, &[])?.counts;
        tracing::info!(sample = %sample.name, batch = %counts.batch_line());

        output.serialize(Row {
            binary: &sample.name,
            tp: counts.true_positive,
            fp_c: counts.confirmed_false_positive,
            fp_o: counts.unknown_false_positive,
            fn_: counts.false_negative,
        })?;
    }

    output.flush()?;
    Ok(())
}
