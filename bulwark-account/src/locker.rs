//! Per-symbol mutual exclusion with owner tagging.
//!
//! Concurrent trades on the same symbol would race position and balance
//! updates, so the gateway holds a symbol lock for the whole submission.
//! Guards are scoped: the lock is released exactly once, on drop, on
//! every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::Symbol;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::{AccountError, AccountResult};

/// Manages one async mutex per trading symbol.
#[derive(Default)]
pub struct SymbolLocker {
    locks: Mutex<HashMap<Symbol, Arc<AsyncMutex<()>>>>,
    owners: Arc<Mutex<HashMap<Symbol, String>>>,
}

impl SymbolLocker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a symbol, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        symbol: &str,
        owner: &str,
        timeout: Duration,
    ) -> AccountResult<SymbolGuard> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(symbol.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| AccountError::SymbolBusy {
                symbol: symbol.to_string(),
                held_by: self.owner_of(symbol),
            })?;
        self.owners
            .lock()
            .insert(symbol.to_string(), owner.to_string());
        debug!(symbol, owner, "symbol lock acquired");
        Ok(SymbolGuard {
            symbol: symbol.to_string(),
            owners: Arc::clone(&self.owners),
            _guard: guard,
        })
    }

    /// Which owner currently holds the lock, if anyone.
    #[must_use]
    pub fn owner_of(&self, symbol: &str) -> Option<String> {
        self.owners.lock().get(symbol).cloned()
    }

    /// Debug view of every locked symbol and its owner.
    #[must_use]
    pub fn locked_symbols(&self) -> HashMap<Symbol, String> {
        self.owners.lock().clone()
    }
}

/// Scoped lock over one symbol. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct SymbolGuard {
    symbol: Symbol,
    owners: Arc<Mutex<HashMap<Symbol, String>>>,
    _guard: OwnedMutexGuard<()>,
}

impl SymbolGuard {
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Drop for SymbolGuard {
    fn drop(&mut self) {
        self.owners.lock().remove(&self.symbol);
        debug!(symbol = %self.symbol, "symbol lock released");
    }
}
