//! File-backed ledger.
//!
//! The whole [`LedgerState`] is re-encoded with `postcard` after each mutation
//! and written next to the target path, synced, then renamed over it. The
//! envelope carries a SHA-256 checksum of the payload which is verified on load.
//! A mutation whose snapshot cannot be written is discarded from memory as well,
//! so the in-process view never runs ahead of the file.

use super::LedgerState;
use crate::error::LedgerError;
use postcard::{from_bytes, to_allocvec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, create_dir_all, rename};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    payload: Vec<u8>,
}

/// Ledger persisted to a single snapshot file.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl FileLedger {
    /// Opens the ledger at `path`, loading the existing snapshot if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, or an existing
    /// snapshot cannot be read, decoded or fails its checksum.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }

        let state = if path.exists() {
            load_snapshot(&path)?
        } else {
            LedgerState::default()
        };
        debug!(path = %path.display(), "opened file ledger");

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> Result<R, LedgerError> {
        let state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(f(&state))
    }

    fn write<R, E>(&self, f: impl FnOnce(&mut LedgerState) -> Result<R, E>) -> Result<R, E>
    where
        E: From<LedgerError>,
    {
        let mut state = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        save_snapshot(&self.path, &next)?;
        *state = next;
        Ok(out)
    }
}

super::impl_execution_ledger!(FileLedger);

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn save_snapshot(path: &Path, state: &LedgerState) -> Result<(), LedgerError> {
    let payload = to_allocvec(state).map_err(|e| LedgerError::Encode(e.to_string()))?;
    let envelope = Envelope {
        version: FORMAT_VERSION,
        checksum: compute_checksum(&payload),
        payload,
    };
    let encoded = to_allocvec(&envelope).map_err(|e| LedgerError::Encode(e.to_string()))?;

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    rename(&tmp, path)?;
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<LedgerState, LedgerError> {
    let mut file = File::open(path)?;
    let mut encoded = Vec::new();
    file.read_to_end(&mut encoded)?;

    let envelope: Envelope =
        from_bytes(&encoded).map_err(|e| LedgerError::Encode(e.to_string()))?;
    if envelope.version != FORMAT_VERSION {
        return Err(LedgerError::Integrity(format!(
            "unsupported ledger format version {}",
            envelope.version
        )));
    }
    if compute_checksum(&envelope.payload) != envelope.checksum {
        return Err(LedgerError::Integrity("checksum mismatch".into()));
    }
    from_bytes(&envelope.payload).map_err(|e| LedgerError::Encode(e.to_string()))
}
