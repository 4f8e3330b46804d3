use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};
use crate::raft::log::LogEntry;
use crate::raft::storage::{HardState, LogStore, Snapshot, SnapshotStore};

const HARD_STATE_FILE: &str = "hard_state.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Write `bytes` to `dir/name` via a synced temp file and a rename, so a
/// crash leaves either the old or the new contents.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}

/// File-backed log store.
///
/// Layout under `dir`:
/// - `hard_state.json`: term and vote, replaced atomically
/// - `log.jsonl`: one JSON entry per line, appended and synced
///
/// Truncation and compaction rewrite `log.jsonl` atomically.
#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Open the store at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn rewrite(&self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        write_atomic(&self.dir, LOG_FILE, &buf)
    }
}

impl LogStore for FileLogStore {
    fn load_hard_state(&self) -> Result<HardState> {
        let path = self.dir.join(HARD_STATE_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let contents = fs::read(&path)?;
        serde_json::from_slice(&contents)
            .map_err(|e| RaftError::Corrupted(format!("{}: {}", path.display(), e)))
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        write_atomic(&self.dir, HARD_STATE_FILE, &json)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<()> {
        let mut entries = self.load_entries()?;
        entries.retain(|e| e.index < index);
        self.rewrite(&entries)
    }

    fn compact_to(&mut self, index: u64) -> Result<()> {
        let mut entries = self.load_entries()?;
        entries.retain(|e| e.index > index);
        self.rewrite(&entries)
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(&line).map_err(|e| {
                RaftError::Corrupted(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// File-backed snapshot store keeping a single `snapshot.json`.
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot)?;
        write_atomic(&self.dir, SNAPSHOT_FILE, &json)
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read(&path)?;
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| RaftError::Corrupted(format!("{}: {}", path.display(), e)))
    }
}
