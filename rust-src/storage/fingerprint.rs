//! Staleness detection for source log files.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::warn;


/// Modification time and size of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime_ns: i64,
    pub size_bytes: i64,
}


impl FileStat {
    pub fn read(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mtime_ns = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .as_nanos();

        Ok(Self {
            mtime_ns: i64::try_from(mtime_ns)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            size_bytes: i64::try_from(metadata.len())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        })
    }
}


/// A tracked file as it was at its last successful parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedFile {
    pub stat: FileStat,
    pub record_count: i64,
}


/// Files to re-parse and tracked files that disappeared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleReport {
    pub stale: Vec<PathBuf>,
    pub deleted: Vec<String>,
    /// Records seen at the last parse, for stale files that were already tracked.
    pub parsed_before: BTreeMap<String, i64>,
}


impl StaleReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.deleted.is_empty()
    }
}


/// Key under which a path's fingerprint is stored.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}


/// Compare candidates against stored fingerprints.
///
/// A candidate is stale when it is untracked or its mtime or size changed.
/// Candidates that cannot be stat'd are neither stale nor deleted this cycle.
pub fn classify(candidates: &[PathBuf], stored: &HashMap<String, TrackedFile>) -> StaleReport {
    let mut report = StaleReport::default();
    let current: HashSet<String> = candidates.iter().map(|p| path_key(p)).collect();

    for path in candidates {
        let stat = match FileStat::read(path) {
            Ok(stat) => stat,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping inaccessible file");
                continue;
            }
        };

        let key = path_key(path);
        match stored.get(&key) {
            Some(previous) if previous.stat == stat => {}
            Some(previous) => {
                report.parsed_before.insert(key, previous.record_count);
                report.stale.push(path.clone());
            }
            None => report.stale.push(path.clone()),
        }
    }

    report.deleted = stored
        .keys()
        .filter(|path| !current.contains(*path))
        .cloned()
        .collect();
    report.deleted.sort();

    report
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_new_changed_and_deleted() {
        let tmp_dir = TempDir::new().unwrap();
        let unchanged = tmp_dir.path().join("a.jsonl");
        let grown = tmp_dir.path().join("b.jsonl");
        let fresh = tmp_dir.path().join("c.jsonl");
        std::fs::write(&unchanged, "one\n").unwrap();
        std::fs::write(&grown, "one\n").unwrap();
        std::fs::write(&fresh, "one\n").unwrap();

        let tracked = |path: &Path| TrackedFile {
            stat: FileStat::read(path).unwrap(),
            record_count: 1,
        };
        let mut stored = HashMap::new();
        stored.insert(path_key(&unchanged), tracked(&unchanged));
        stored.insert(path_key(&grown), tracked(&grown));
        stored.insert(
            "/gone/old.jsonl".to_string(),
            TrackedFile {
                stat: FileStat { mtime_ns: 1, size_bytes: 1 },
                record_count: 3,
            },
        );

        std::fs::write(&grown, "one\ntwo\n").unwrap();

        let report = classify(&[unchanged.clone(), grown.clone(), fresh.clone()], &stored);
        assert_eq!(report.stale, vec![grown.clone(), fresh]);
        assert_eq!(report.deleted, vec!["/gone/old.jsonl".to_string()]);
        assert_eq!(report.parsed_before.len(), 1);
        assert_eq!(report.parsed_before.get(&path_key(&grown)), Some(&1));
    }

    #[test]
    fn test_unreadable_candidate_is_skipped() {
        let tmp_dir = TempDir::new().unwrap();
        let missing = tmp_dir.path().join("vanished.jsonl");

        let mut stored = HashMap::new();
        stored.insert(
            path_key(&missing),
            TrackedFile {
                stat: FileStat { mtime_ns: 5, size_bytes: 5 },
                record_count: 0,
            },
        );

        let report = classify(&[missing], &stored);
        assert!(report.is_empty());
    }
}
