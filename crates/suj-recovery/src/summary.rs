use std::fmt;

use serde::{Deserialize, Serialize};
use suj_journal::PruneReport;

use crate::confirm::Gate;
use crate::context::RecoveryStats;
use crate::journal::JournalStatus;
use crate::writeback::WritebackStats;

/// How a recovery run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Journaling is off; a full check is needed instead.
    NotJournaled,
    JournalMissing,
    JournalInvalid { reason: String },
    /// A confirmation gate was declined; nothing was written.
    Declined { gate: Gate },
    Recovered,
}

impl RecoveryOutcome {
    /// Whether the filesystem was left consistent by this run.
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered)
    }

    /// Outcome for a journal that cannot be replayed; `None` when usable.
    #[must_use]
    pub fn from_status(status: &JournalStatus) -> Option<Self> {
        match status {
            JournalStatus::NotJournaled => Some(Self::NotJournaled),
            JournalStatus::Missing => Some(Self::JournalMissing),
            JournalStatus::Invalid { reason } => Some(Self::JournalInvalid {
                reason: reason.clone(),
            }),
            JournalStatus::Usable { .. } => None,
        }
    }
}

/// Report of one recovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub outcome: RecoveryOutcome,
    pub journal_records: u64,
    pub journal_bytes: u64,
    /// Share of the kept journal space holding records, in percent.
    pub utilization: f64,
    pub segments_kept: usize,
    pub segments_pruned: usize,
    pub skipped_blocks: u64,
    pub freed: RecoveryStats,
    pub written: WritebackStats,
}

impl RecoverySummary {
    #[must_use]
    pub fn new(outcome: RecoveryOutcome) -> Self {
        Self {
            outcome,
            journal_records: 0,
            journal_bytes: 0,
            utilization: 0.0,
            segments_kept: 0,
            segments_pruned: 0,
            skipped_blocks: 0,
            freed: RecoveryStats::default(),
            written: WritebackStats::default(),
        }
    }

    pub(crate) fn record_prune(&mut self, report: &PruneReport) {
        self.journal_records = report.records;
        self.journal_bytes = report.bytes;
        self.utilization = report.utilization();
        self.segments_kept = report.kept;
        self.segments_pruned = report.pruned;
    }
}

impl fmt::Display for RecoverySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            RecoveryOutcome::NotJournaled => {
                return write!(f, "Soft updates journaling is not enabled.");
            }
            RecoveryOutcome::JournalMissing => return write!(f, "Journal file not found."),
            RecoveryOutcome::JournalInvalid { reason } => {
                return write!(f, "Journal is invalid: {reason}.");
            }
            RecoveryOutcome::Declined { gate } => {
                return write!(f, "{gate} declined; filesystem not modified.");
            }
            RecoveryOutcome::Recovered => {}
        }
        if self.journal_records > 0 {
            writeln!(
                f,
                "{} journal records in {} bytes for {:.2}% utilization",
                self.journal_records, self.journal_bytes, self.utilization
            )?;
        }
        write!(
            f,
            "Freed {} inodes ({} dirs) {} blocks, and {} frags.",
            self.freed.freed_inodes,
            self.freed.freed_dirs,
            self.freed.freed_blocks,
            self.freed.freed_frags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_summary_reports_utilization_and_frees() {
        let mut summary = RecoverySummary::new(RecoveryOutcome::Recovered);
        summary.record_prune(&PruneReport {
            kept: 1,
            pruned: 0,
            records: 3,
            bytes: 512,
        });
        summary.freed.freed_inodes = 2;
        summary.freed.freed_dirs = 1;
        summary.freed.freed_blocks = 4;
        summary.freed.freed_frags = 3;
        assert_eq!(
            summary.to_string(),
            "3 journal records in 512 bytes for 18.75% utilization\n\
             Freed 2 inodes (1 dirs) 4 blocks, and 3 frags."
        );
    }

    #[test]
    fn declined_summary_names_the_gate() {
        let summary = RecoverySummary::new(RecoveryOutcome::Declined {
            gate: Gate::WriteChanges,
        });
        assert_eq!(
            summary.to_string(),
            "WRITE CHANGES declined; filesystem not modified."
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_string(&RecoveryOutcome::JournalInvalid {
            reason: "invalid size 4096".to_owned(),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"status":"journal_invalid","reason":"invalid size 4096"}"#);
        let back: RecoveryOutcome = serde_json::from_str(&json).expect("deserialize");
        assert!(!back.is_recovered());
    }
}
