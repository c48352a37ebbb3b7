//! One ingestion cycle: find changed logs, parse them, save, remember them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DeviceIdentity, StorageMode};
use crate::models::UsageRecord;
use crate::storage::{path_key, SnapshotStore};


/// Turns one source log file into usage records.
pub trait RecordParser {
    fn parse_file(&self, path: &Path) -> Result<Vec<UsageRecord>>;
}

impl<F> RecordParser for F
where
    F: Fn(&Path) -> Result<Vec<UsageRecord>>,
{
    fn parse_file(&self, path: &Path) -> Result<Vec<UsageRecord>> {
        self(path)
    }
}


/// Summary returned after an ingestion cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub files_scanned: usize,
    pub files_parsed: usize,
    pub records_parsed: usize,
    /// Records an aggregate cycle left out because the ledger already holds them.
    pub records_skipped: usize,
    pub saved: usize,
    pub fingerprints_removed: usize,
    pub issues: Vec<CycleIssue>,
}


/// A file the cycle could not handle; it stays stale for the next cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleIssue {
    pub file_path: String,
    pub message: String,
}


/// Parse every stale candidate, save the records, then commit fingerprints.
///
/// Fingerprints are only written once the batch is saved, so a failed save
/// leaves every file stale. In aggregate mode a tracked file that grew only
/// contributes the records past its last parsed count; a file that now holds
/// fewer records than before was rewritten and is aggregated in full.
pub fn run_cycle(
    store: &dyn SnapshotStore,
    candidates: &[PathBuf],
    parser: &dyn RecordParser,
    mode: StorageMode,
    device: Option<&DeviceIdentity>,
) -> Result<CycleSummary> {
    let mut summary = CycleSummary {
        files_scanned: candidates.len(),
        ..Default::default()
    };

    let report = store.stale_files(candidates)?;
    debug!(
        stale = report.stale.len(),
        deleted = report.deleted.len(),
        "Classified source files"
    );

    let mut records = Vec::new();
    let mut parsed: Vec<(&Path, i64)> = Vec::new();

    for path in &report.stale {
        match parser.parse_file(path) {
            Ok(file_records) => {
                parsed.push((path.as_path(), file_records.len() as i64));
                let skip = match mode {
                    StorageMode::Aggregate => {
                        already_aggregated(&report.parsed_before, path, file_records.len())
                    }
                    StorageMode::Full => 0,
                };
                summary.records_skipped += skip;
                records.extend(file_records.into_iter().skip(skip));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse source file");
                summary.issues.push(CycleIssue {
                    file_path: path_key(path),
                    message: format!("{e:#}"),
                });
            }
        }
    }

    summary.files_parsed = parsed.len();
    summary.records_parsed = records.len() + summary.records_skipped;
    summary.saved = store.save(&records, mode, device)?;

    for (path, record_count) in parsed {
        if let Err(e) = store.commit_fingerprint(path, record_count) {
            warn!(path = %path.display(), error = %e, "Failed to record file fingerprint");
            summary.issues.push(CycleIssue {
                file_path: path_key(path),
                message: format!("{e:#}"),
            });
        }
    }

    summary.fingerprints_removed = store.remove_fingerprints(&report.deleted)?;

    info!(
        scanned = summary.files_scanned,
        parsed = summary.files_parsed,
        records = summary.records_parsed,
        skipped = summary.records_skipped,
        saved = summary.saved,
        removed = summary.fingerprints_removed,
        "Ingestion cycle complete"
    );
    Ok(summary)
}


/// Leading records of `path` that a previous aggregate cycle already counted.
fn already_aggregated(parsed_before: &BTreeMap<String, i64>, path: &Path, parsed_now: usize) -> usize {
    let Some(&before) = parsed_before.get(&path_key(path)) else {
        return 0;
    };
    let before = usize::try_from(before).unwrap_or(0);

    if parsed_now < before {
        warn!(
            path = %path.display(),
            before,
            now = parsed_now,
            "Source file shrank; aggregating it again in full"
        );
        return 0;
    }
    before
}
