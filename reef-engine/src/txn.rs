use crate::object::MutationToken;
use crate::Errno;

use reef_types::{Oid, TxnId};

use std::collections::HashMap;

/// Transaction lifecycle.
///
/// ```text
/// Open --commit-->   Committing  --(all apply succeed)--> Committed
/// Open --rollback--> RollingBack --(all revert done)----> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations.
    Open,
    /// Commit in progress.
    Committing,
    /// All atoms applied.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// All atoms reverted.
    RolledBack,
}

/// One registered mutation: the object it touched and the opaque payload
/// its type asked to store.
#[derive(Debug, Clone, Copy)]
pub struct Atom {
    /// Object touched.
    pub oid: Oid,
    /// Type-opaque payload dispatched back on apply/revert.
    pub mutation: MutationToken,
}

/// A client-scoped transaction.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TxnState,
    atoms: Vec<Atom>,
}

impl Transaction {
    fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TxnState::Open,
            atoms: Vec::new(),
        }
    }

    /// Transaction id; always greater than zero.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Registered atoms in append order.
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Register an atom for an object touched for the first time.
    ///
    /// Types call this exactly once per object per transaction, guarded by
    /// their operation-lock check.
    pub fn add(&mut self, oid: Oid, mutation: MutationToken) -> Result<(), Errno> {
        debug_assert!(
            !self.atoms.iter().any(|a| a.oid == oid && a.mutation == mutation),
            "atom registered twice for the same operation lock"
        );
        self.atoms.push(Atom { oid, mutation });
        Ok(())
    }

    pub(crate) fn begin_commit(&mut self) -> Result<(), Errno> {
        match self.state {
            TxnState::Open => {
                self.state = TxnState::Committing;
                Ok(())
            }
            _ => Err(Errno::TxnNotFound),
        }
    }

    pub(crate) fn begin_rollback(&mut self) -> Result<(), Errno> {
        match self.state {
            TxnState::Open => {
                self.state = TxnState::RollingBack;
                Ok(())
            }
            _ => Err(Errno::TxnNotFound),
        }
    }

    pub(crate) fn finish(&mut self, state: TxnState) {
        self.state = state;
    }
}

/// Allocates transaction ids and tracks open transactions.
#[derive(Default)]
pub struct TxnManager {
    next_id: TxnId,
    active: HashMap<TxnId, Transaction>,
}

impl TxnManager {
    /// Empty manager; the first transaction gets id 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new transaction.
    pub fn begin(&mut self) -> TxnId {
        self.next_id += 1;
        let id = self.next_id;
        self.active.insert(id, Transaction::new(id));
        id
    }

    /// Borrow an open transaction.
    pub fn get(&self, id: TxnId) -> Option<&Transaction> {
        self.active.get(&id)
    }

    /// Mutably borrow an open transaction.
    pub fn get_mut(&mut self, id: TxnId) -> Option<&mut Transaction> {
        self.active.get_mut(&id)
    }

    /// Detach a transaction for commit/rollback processing.
    pub(crate) fn take(&mut self, id: TxnId) -> Option<Transaction> {
        self.active.remove(&id)
    }

    /// Open transaction count.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no transaction is open.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
