/*!
The resume ledger: the on-disk record of every chunk already written.

The ledger is a single JSON document mapping each normalized file path to
the set of `"<offset>_<sha-hex>"` keys of its completed chunks. The engine
loads it at startup, skips everything it lists, and checkpoints it
periodically and at shutdown, so an interrupted run only redoes the chunks
that never made it to disk.
*/

use thiserror::Error;
use tracing::debug;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Error for ledger persistence
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error on the resume ledger")]
    IO(#[from] std::io::Error),
    #[error("malformed resume ledger")]
    Encoding(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, LedgerError>;

/// The path to set-of-chunk-keys map, kept in memory and mirrored to disk
pub struct ResumeLedger {
    path: PathBuf,
    files: Mutex<HashMap<String, HashSet<String>>>,
}

impl ResumeLedger {
    /// The ledger key of a chunk: `<offset>_<sha-hex>`
    pub fn chunk_key(offset: u64, sha: &[u8; 20]) -> String {
        format!("{}_{}", offset, hex::encode(sha))
    }

    /// Opens a ledger file, loading prior progress if the file exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ResumeLedger> {
        let path = path.as_ref().to_path_buf();
        let files = if path.exists() {
            let bytes = fs::read(&path)?;
            let files: HashMap<String, HashSet<String>> = serde_json::from_slice(&bytes)?;
            debug!(
                ledger = %path.display(),
                files = files.len(),
                "loaded resume ledger"
            );
            files
        } else {
            HashMap::new()
        };
        Ok(ResumeLedger {
            path,
            files: Mutex::new(files),
        })
    }

    pub fn contains(&self, file: &str, chunk_key: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .get(file)
            .map_or(false, |chunks| chunks.contains(chunk_key))
    }

    /// Records a chunk as durably written
    pub fn record(&self, file: &str, chunk_key: String) {
        self.files
            .lock()
            .unwrap()
            .entry(file.to_string())
            .or_default()
            .insert(chunk_key);
    }

    /// Makes sure a file has an entry, even an empty one
    pub fn ensure_file(&self, file: &str) {
        self.files
            .lock()
            .unwrap()
            .entry(file.to_string())
            .or_default();
    }

    /// Drops all recorded progress for a file, used when the file itself
    /// has gone missing from disk. Returns whether anything was recorded.
    pub fn reset_file(&self, file: &str) -> bool {
        let mut files = self.files.lock().unwrap();
        match files.get_mut(file) {
            Some(chunks) if !chunks.is_empty() => {
                chunks.clear();
                true
            }
            _ => false,
        }
    }

    /// Writes the whole document out, through a temp file so a crash mid
    /// checkpoint cannot eat previously recorded progress
    pub fn save(&self) -> Result<()> {
        let bytes = {
            let files = self.files.lock().unwrap();
            serde_json::to_vec(&*files)?
        };
        let scratch = self.path.with_extension("tmp");
        fs::write(&scratch, &bytes)?;
        fs::rename(&scratch, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chunk_key_format() {
        let sha = [0xab_u8; 20];
        assert_eq!(
            ResumeLedger::chunk_key(4096, &sha),
            format!("4096_{}", "ab".repeat(20))
        );
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let ledger = ResumeLedger::open(dir.path().join("7.json")).unwrap();
        assert!(!ledger.contains("a", "0_00"));
    }

    #[test]
    fn record_save_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7.json");

        let ledger = ResumeLedger::open(&path).unwrap();
        ledger.ensure_file("empty.bin");
        ledger.record("data/a.bin", ResumeLedger::chunk_key(0, &[1_u8; 20]));
        ledger.record("data/a.bin", ResumeLedger::chunk_key(64, &[2_u8; 20]));
        ledger.save().unwrap();

        let reloaded = ResumeLedger::open(&path).unwrap();
        assert!(reloaded.contains("data/a.bin", &ResumeLedger::chunk_key(0, &[1_u8; 20])));
        assert!(reloaded.contains("data/a.bin", &ResumeLedger::chunk_key(64, &[2_u8; 20])));
        assert!(!reloaded.contains("data/a.bin", &ResumeLedger::chunk_key(128, &[3_u8; 20])));
        assert!(!reloaded.contains("empty.bin", "0_00"));
    }

    #[test]
    fn reset_clears_recorded_progress() {
        let dir = tempdir().unwrap();
        let ledger = ResumeLedger::open(dir.path().join("7.json")).unwrap();

        assert!(!ledger.reset_file("a"), "nothing recorded yet");
        ledger.record("a", ResumeLedger::chunk_key(0, &[1_u8; 20]));
        assert!(ledger.reset_file("a"));
        assert!(!ledger.contains("a", &ResumeLedger::chunk_key(0, &[1_u8; 20])));
        assert!(!ledger.reset_file("a"), "already empty");
    }

    #[test]
    fn malformed_ledger_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7.json");
        fs::write(&path, b"you shall not parse").unwrap();
        assert!(matches!(
            ResumeLedger::open(&path),
            Err(LedgerError::Encoding(_))
        ));
    }
}
