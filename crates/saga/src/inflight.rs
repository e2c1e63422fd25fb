//! Registry of transactions currently being driven.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use common::TransactionId;

/// Transactions that a live saga or reconciliation pass is acting on.
///
/// Shared between the orchestrator and the reconciler so that at most one
/// actor works on a transaction at a time.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<TransactionId>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `tx_id`, or returns `None` if someone else holds it.
    ///
    /// The claim is released when the guard drops.
    pub fn try_claim(&self, tx_id: TransactionId) -> Option<InFlightGuard> {
        let inserted = self.with_ids(|ids| ids.insert(tx_id));
        inserted.then(|| InFlightGuard {
            registry: self.clone(),
            tx_id,
        })
    }

    pub fn contains(&self, tx_id: TransactionId) -> bool {
        self.with_ids(|ids| ids.contains(&tx_id))
    }

    pub fn len(&self) -> usize {
        self.with_ids(|ids| ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_ids<R>(&self, f: impl FnOnce(&mut HashSet<TransactionId>) -> R) -> R {
        let mut guard = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Releases an in-flight claim on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlight,
    tx_id: TransactionId,
}

impl InFlightGuard {
    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let tx_id = self.tx_id;
        self.registry.with_ids(|ids| ids.remove(&tx_id));
    }
}
