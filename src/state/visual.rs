use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;

use super::ActiveStateRecord;

pub const LATEST_POINTER: &str = "latest.json";
const GENERATION_PREFIX: &str = "gen-";
const BEFORE_FILE: &str = "before.jpg";
const AFTER_FILE: &str = "after.jpg";
const RESULT_FILE: &str = "result.json";

/// Contents of `latest.json`: where the newest complete export lives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub generation: u64,
    pub run_id: String,
    pub committed_at_ms: u64,
    pub dir: String,
    pub before: String,
    pub after: String,
    pub result: String,
}

/// Writes each commit's images to a fresh directory and then swaps
/// `latest.json` to point at it. A display that follows the pointer always
/// gets a before/after pair from the same commit.
pub struct VisualExporter {
    root: PathBuf,
    keep: usize,
    sequence: u64,
}

impl VisualExporter {
    pub fn new(root: impl Into<PathBuf>, keep: usize) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| io_err(&root, source))?;
        Ok(Self {
            root,
            keep: keep.max(1),
            sequence: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn export(&mut self, record: &ActiveStateRecord) -> Result<LatestPointer, PersistenceError> {
        self.sequence += 1;
        let name = format!(
            "{GENERATION_PREFIX}{:013}-{:06}",
            record.committed_at_ms, self.sequence
        );
        let dir = self.root.join(&name);
        export_record(record, &dir)?;

        let pointer = LatestPointer {
            generation: record.generation,
            run_id: record.run_id.clone(),
            committed_at_ms: record.committed_at_ms,
            dir: name.clone(),
            before: format!("{name}/{BEFORE_FILE}"),
            after: format!("{name}/{AFTER_FILE}"),
            result: format!("{name}/{RESULT_FILE}"),
        };
        let tmp = self.root.join(format!("{LATEST_POINTER}.tmp"));
        let latest = self.root.join(LATEST_POINTER);
        let body = serde_json::to_vec_pretty(&pointer)?;
        fs::write(&tmp, body).map_err(|source| io_err(&tmp, source))?;
        fs::rename(&tmp, &latest).map_err(|source| io_err(&latest, source))?;

        if let Err(e) = self.prune(&name) {
            log::warn!("visual export prune failed: {}", e);
        }
        Ok(pointer)
    }

    /// Read the current pointer, if any.
    pub fn latest(&self) -> Result<Option<LatestPointer>, PersistenceError> {
        let path = self.root.join(LATEST_POINTER);
        match fs::read(&path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_err(&path, source)),
        }
    }

    fn prune(&self, current: &str) -> Result<(), PersistenceError> {
        let mut generations: Vec<String> = fs::read_dir(&self.root)
            .map_err(|source| io_err(&self.root, source))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(GENERATION_PREFIX))
            .collect();
        generations.sort();
        let excess = generations.len().saturating_sub(self.keep);
        for name in generations.into_iter().take(excess) {
            if name == current {
                continue;
            }
            let path = self.root.join(&name);
            fs::remove_dir_all(&path).map_err(|source| io_err(&path, source))?;
        }
        Ok(())
    }
}

/// Write `before.jpg`, `after.jpg` and `result.json` of a record into `dir`.
pub fn export_record(record: &ActiveStateRecord, dir: &Path) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir).map_err(|source| io_err(dir, source))?;
    write_file(&dir.join(BEFORE_FILE), &record.before_jpeg)?;
    write_file(&dir.join(AFTER_FILE), &record.after_jpeg)?;
    let result = serde_json::to_vec_pretty(record)?;
    write_file(&dir.join(RESULT_FILE), &result)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    fs::write(path, bytes).map_err(|source| io_err(path, source))
}

fn io_err(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionResult;

    fn record(generation: u64) -> ActiveStateRecord {
        ActiveStateRecord::new(
            DetectionResult::default(),
            format!("before-{generation}").into_bytes(),
            format!("after-{generation}").into_bytes(),
            "run-visual",
            generation,
            0,
        )
    }

    #[test]
    fn pointer_names_a_complete_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = VisualExporter::new(dir.path(), 2).unwrap();
        assert!(exporter.latest().unwrap().is_none());

        for generation in 1..=4 {
            exporter.export(&record(generation)).unwrap();
        }
        let pointer = exporter.latest().unwrap().unwrap();
        assert_eq!(pointer.generation, 4);
        let before = fs::read(dir.path().join(&pointer.before)).unwrap();
        let after = fs::read(dir.path().join(&pointer.after)).unwrap();
        assert_eq!(before, b"before-4");
        assert_eq!(after, b"after-4");

        let kept = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .count();
        assert_eq!(kept, 2);
    }
}
