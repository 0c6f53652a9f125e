use super::LedgerState;
use crate::error::LedgerError;
use std::sync::Mutex;

/// Process-local ledger. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
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
        f(&mut state)
    }
}

super::impl_execution_ledger!(InMemoryLedger);
