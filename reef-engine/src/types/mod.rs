//! Built-in object types.
//!
//! Each type module exposes its operations as free functions over an
//! [`crate::Object`] and an optional [`crate::Transaction`], plus the plug
//! wiring the type into commit/rollback. A `None` transaction means
//! auto-commit: the store promotes the write immediately after the call.

pub mod counter;
pub mod deque;
pub mod flow;
pub mod number;

use crate::{Errno, MutationToken, Transaction};

use reef_types::TxnId;

/// The operation-lock check shared by every write path.
///
/// Returns the effective transaction id (0 for auto-commit) or the
/// contention error when another transaction owns the lock.
pub(crate) fn check_lock(lock: TxnId, txn: Option<&Transaction>) -> Result<TxnId, Errno> {
    let txn_id = txn.map_or(0, Transaction::id);
    if lock > 0 && lock != txn_id {
        return Err(Errno::TxnLockedOperation);
    }
    Ok(txn_id)
}

/// Register an atom on first touch: only when a transaction is present
/// and the lock is not already ours.
pub(crate) fn register_atom(
    txn: Option<&mut Transaction>,
    lock: TxnId,
    oid: reef_types::Oid,
    mutation: MutationToken,
) -> Result<(), Errno> {
    if let Some(txn) = txn {
        if lock != txn.id() {
            txn.add(oid, mutation)?;
        }
    }
    Ok(())
}
