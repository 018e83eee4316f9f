use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use thiserror::Error;

use crate::fetch::PostId;

/// Error types for the completion ledger
#[derive(Error, Debug)]
pub(crate) enum LedgerError {
    #[error("Failed to read ledger {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to append {id} to ledger {path}: {source}")]
    Append { id: PostId, path: PathBuf, source: io::Error },
}

/// Result type for ledger operations
pub(crate) type LedgerResult<T> = Result<T, LedgerError>;

/// Durable, append-only set of post IDs that finished downloading.
///
/// The backing file holds one ID per line. It is read once when the ledger is
/// opened and only ever appended to afterwards; duplicate and blank lines are
/// tolerated on read.
#[derive(Debug)]
pub(crate) struct CompletionLedger {
    path: PathBuf,
    completed: HashSet<PostId>,
}

impl CompletionLedger {
    /// Loads the ledger at `path`. A missing file is an empty ledger.
    pub(crate) fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let completed = match fs::read_to_string(&path) {
            Ok(content) => content.lines().filter_map(PostId::parse).collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                trace!("Ledger {} does not exist yet, starting empty", path.display());
                HashSet::new()
            }
            Err(source) => return Err(LedgerError::Read { path, source }),
        };

        debug!("Loaded {} completed IDs from {}", completed.len(), path.display());
        Ok(Self { path, completed })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn contains(&self, id: &PostId) -> bool {
        self.completed.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.completed.len()
    }

    /// Records `id` as complete, appending it to the backing file.
    ///
    /// Returns `Ok(false)` when the ID was already recorded. The in-memory set
    /// is updated even if the append fails, so the current run will not fetch
    /// the post again; the error tells the caller the record is not durable.
    pub(crate) fn mark_complete(&mut self, id: &PostId) -> LedgerResult<bool> {
        if !self.completed.insert(id.clone()) {
            return Ok(false);
        }

        self.append_line(id).map_err(|source| LedgerError::Append {
            id: id.clone(),
            path: self.path.clone(),
            source,
        })?;

        trace!("Recorded {} in {}", id, self.path.display());
        Ok(true)
    }

    fn append_line(&self, id: &PostId) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        // One write per record keeps each line intact under O_APPEND.
        file.write_all(format!("{}\n", id).as_bytes())?;
        file.sync_data()
    }
}
