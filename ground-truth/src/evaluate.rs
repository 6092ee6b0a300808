//! Classification of a static disassembler's instruction starts against a captured ground truth.
//!
//! Static offsets are absolute (they include the base address); ground truth offsets are
//! relative to the start of the binary. Every static offset is classified as exactly one of:
//!
//! - a true positive, when an executed instruction starts at the same offset,
//! - a confirmed false positive, when it points inside the bytes of an executed instruction,
//! - an unknown false positive, when it points between executed instructions or before the
//!   first one, where nothing executed to prove or disprove it.
//!
//! Executed instructions missing from the static output are false negatives.

use std::collections::BTreeSet;
use std::io::{self, Write};

use crate::{InstructionOffset, InstructionTable};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    TruePositive,
    ConfirmedFalsePositive { container: InstructionOffset },
    Unknown { predecessor: Option<InstructionOffset> },
}

#[derive(Debug, Copy, Clone)]
pub struct GroundTruth<'t> {
    instructions: &'t InstructionTable,
    base_address: i64,
}

impl<'t> GroundTruth<'t> {
    pub fn new(instructions: &'t InstructionTable, base_address: i64) -> Self {
        Self {
            instructions,
            base_address,
        }
    }

    pub fn classify(&self, static_offset: i64) -> Verdict {
        // Nothing executed below the image, so an offset that cannot be rebased is unconfirmable.
        let Some(offset) = static_offset.checked_sub(self.base_address) else {
            return Verdict::Unknown { predecessor: None };
        };

        if self.instructions.contains_key(&offset) {
            return Verdict::TruePositive;
        }

        let Some((&start, &length)) = self.instructions.range(..offset).next_back() else {
            return Verdict::Unknown { predecessor: None };
        };
        let predecessor = InstructionOffset { offset: start, length };

        // `start < offset`, so a failed subtraction is a distance far beyond any length.
        let inside = offset
            .checked_sub(start)
            .is_some_and(|distance| distance < i64::from(length));
        if inside {
            Verdict::ConfirmedFalsePositive {
                container: predecessor,
            }
        } else {
            Verdict::Unknown {
                predecessor: Some(predecessor),
            }
        }
    }

    /// Executed instructions that do not appear in `statics`.
    pub fn missed<'s>(
        &'s self,
        statics: &'s BTreeSet<i64>,
    ) -> impl Iterator<Item = InstructionOffset> + 's {
        self.instructions
            .iter()
            .filter(move |&(&offset, _)| {
                offset
                    .checked_add(self.base_address)
                    .map_or(true, |absolute| !statics.contains(&absolute))
            })
            .map(|(&offset, &length)| InstructionOffset { offset, length })
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EvaluationCounts {
    pub true_positive: u64,
    pub confirmed_false_positive: u64,
    pub unknown_false_positive: u64,
    pub false_negative: u64,
}

impl EvaluationCounts {
    /// Machine readable summary consumed by batch drivers.
    pub fn batch_line(&self) -> String {
        format!(
            "BATCH {} {} {} {}",
            self.true_positive,
            self.confirmed_false_positive,
            self.unknown_false_positive,
            self.false_negative
        )
    }
}

impl std::fmt::Display for EvaluationCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "TP: {}", self.true_positive)?;
        writeln!(
            f,
            "FP: {} (confirmed), {} (suspected)",
            self.confirmed_false_positive, self.unknown_false_positive
        )?;
        write!(f, "FN: {}", self.false_negative)
    }
}

/// Optional per-category listings.
///
/// Writers are handed out in a fixed order, each one requiring the previous: confirmed false
/// positives, then false negatives, then unknown false positives.
pub struct DetailLogs<W> {
    false_positives: Option<W>,
    false_negatives: Option<W>,
    unknown: Option<W>,
}

impl<W> Default for DetailLogs<W> {
    fn default() -> Self {
        Self {
            false_positives: None,
            false_negatives: None,
            unknown: None,
        }
    }
}

impl<W: Write> DetailLogs<W> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn cascade(writers: impl IntoIterator<Item = W>) -> Self {
        let mut writers = writers.into_iter();
        let false_positives = writers.next();
        let false_negatives = false_positives.as_ref().and(writers.next());
        let unknown = false_negatives.as_ref().and(writers.next());
        Self {
            false_positives,
            false_negatives,
            unknown,
        }
    }

    fn verdict(&mut self, static_offset: i64, verdict: &Verdict, base_address: i64) -> io::Result<()> {
        match verdict {
            Verdict::TruePositive => Ok(()),
            Verdict::ConfirmedFalsePositive { container } => match self.false_positives.as_mut() {
                Some(log) => writeln!(
                    log,
                    "{:#x} in {:#x} len {}",
                    static_offset,
                    container.offset.wrapping_add(base_address),
                    container.length
                ),
                None => Ok(()),
            },
            Verdict::Unknown { predecessor } => match (self.unknown.as_mut(), predecessor) {
                (Some(log), Some(pred)) => writeln!(
                    log,
                    "{:#x} after {:#x}",
                    static_offset,
                    pred.offset.wrapping_add(base_address)
                ),
                (Some(log), None) => writeln!(log, "{:#x} before first", static_offset),
                (None, _) => Ok(()),
            },
        }
    }

    fn missed(&mut self, insn: &InstructionOffset, base_address: i64) -> io::Result<()> {
        match self.false_negatives.as_mut() {
            Some(log) => writeln!(
                log,
                "{:#x} len {}",
                insn.offset.wrapping_add(base_address),
                insn.length
            ),
            None => Ok(()),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        for log in [&mut self.false_positives, &mut self.false_negatives, &mut self.unknown]
            .into_iter()
            .flatten()
        {
            log.flush()?;
        }
        Ok(())
    }
}

pub fn evaluate<W: Write>(
    statics: &BTreeSet<i64>,
    truth: &GroundTruth,
    logs: &mut DetailLogs<W>,
) -> io::Result<EvaluationCounts> {
    let mut counts = EvaluationCounts::default();

    for &static_offset in statics {
        let verdict = truth.classify(static_offset);
        match verdict {
            Verdict::TruePositive => counts.true_positive += 1,
            Verdict::ConfirmedFalsePositive { .. } => counts.confirmed_false_positive += 1,
            Verdict::Unknown { .. } => counts.unknown_false_positive += 1,
        }
        logs.verdict(static_offset, &verdict, truth.base_address)?;
    }

    for insn in truth.missed(statics) {
        counts.false_negative += 1;
        logs.missed(&insn, truth.base_address)?;
    }

    logs.flush()?;
    tracing::debug!(?counts, "evaluation finished");
    Ok(counts)
}
