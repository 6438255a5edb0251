//! Double-ended queue with per-side transactional staging.
//!
//! Each side keeps a pending list of uncommitted pushes and a removed
//! cursor marking committed entries consumed but not yet dropped. Pop
//! prefers the same side's pending list, then committed data through the
//! cursor, then the opposite side's pending list from its far end.
//! Commit merges pending entries into the committed list (iterating in
//! reverse so push order survives) and drops everything behind the
//! cursors, but only for sides whose operation lock is clear.

use super::check_lock;
use crate::object::{Membuf, MutationToken, Object, ObjectPlug};
use crate::{Errno, Transaction};

use reef_buf::ByteRef;
use reef_types::TxnId;

use std::collections::VecDeque;

/// Queue side selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The head of the queue.
    Front,
    /// The tail of the queue.
    Back,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Self {
        match self {
            Side::Front => Side::Back,
            Side::Back => Side::Front,
        }
    }

    /// Atom payload identifying this side's lock.
    fn token(self) -> MutationToken {
        MutationToken(match self {
            Side::Front => 0,
            Side::Back => 1,
        })
    }

    fn from_token(token: MutationToken) -> Self {
        if token.0 == 0 {
            Side::Front
        } else {
            Side::Back
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DequeBuf {
    /// Committed entries, front at index zero.
    data: VecDeque<ByteRef>,
    /// Uncommitted pushes, newest first.
    pending_front: VecDeque<ByteRef>,
    pending_back: VecDeque<ByteRef>,
    /// Committed entries consumed from each end, dropped at commit.
    removed_front: usize,
    removed_back: usize,
    txn_id_front: TxnId,
    txn_id_back: TxnId,
}

impl DequeBuf {
    fn lock(&self, side: Side) -> TxnId {
        match side {
            Side::Front => self.txn_id_front,
            Side::Back => self.txn_id_back,
        }
    }

    fn set_lock(&mut self, side: Side, txn_id: TxnId) {
        match side {
            Side::Front => self.txn_id_front = txn_id,
            Side::Back => self.txn_id_back = txn_id,
        }
    }

    fn pending(&mut self, side: Side) -> &mut VecDeque<ByteRef> {
        match side {
            Side::Front => &mut self.pending_front,
            Side::Back => &mut self.pending_back,
        }
    }

    fn committed_len(&self) -> usize {
        self.data.len() - self.removed_front - self.removed_back
    }
}

/// Push an entry on one side.
pub fn push(
    object: &mut Object,
    txn: Option<&mut Transaction>,
    side: Side,
    data: ByteRef,
) -> Result<(), Errno> {
    let oid = object.oid();
    let deque = object.membuf_mut::<DequeBuf>()?;
    let txn_id = check_lock(deque.lock(side), txn.as_deref())?;

    // register at most one atom per side per transaction
    if let Some(txn) = txn {
        if deque.lock(side) != txn.id() {
            txn.add(oid, side.token())?;
        }
    }

    deque.set_lock(side, txn_id);
    deque.pending(side).push_front(data);
    Ok(())
}

/// Pop an entry from one side; [`Errno::DataNoItems`] when nothing is
/// visible to the caller.
///
/// Staged pushes belong to the transaction that made them: other callers
/// simply do not see them. Contention only surfaces when the pop would
/// have to move a removed cursor another transaction is holding.
pub fn pop(
    object: &mut Object,
    txn: Option<&mut Transaction>,
    side: Side,
) -> Result<ByteRef, Errno> {
    let oid = object.oid();
    let deque = object.membuf_mut::<DequeBuf>()?;
    let txn_id = txn.as_deref().map_or(0, Transaction::id);

    // own staged pushes first
    if deque.lock(side) == txn_id {
        if let Some(entry) = deque.pending(side).pop_front() {
            return Ok(entry);
        }
    }

    // then committed data through the removed cursor; consuming committed
    // entries takes the side lock, so the cursor can be dropped or reset
    // when the transaction resolves
    if deque.committed_len() > 0 {
        let txn_id = check_lock(deque.lock(side), txn.as_deref())?;
        if let Some(txn) = txn {
            if deque.lock(side) != txn.id() {
                txn.add(oid, side.token())?;
            }
        }
        let entry = match side {
            Side::Front => {
                let entry = deque.data[deque.removed_front].clone();
                deque.removed_front += 1;
                entry
            }
            Side::Back => {
                let entry = deque.data[deque.data.len() - 1 - deque.removed_back].clone();
                deque.removed_back += 1;
                entry
            }
        };
        deque.set_lock(side, txn_id);
        return Ok(entry);
    }

    // finally drain our own staging on the other side, from its far end
    let opposite = side.opposite();
    if deque.lock(opposite) == txn_id {
        if let Some(entry) = deque.pending(opposite).pop_back() {
            return Ok(entry);
        }
    }

    Err(Errno::DataNoItems)
}

/// Committed plus pending entry count.
pub fn len(object: &Object) -> Result<usize, Errno> {
    let deque = object.membuf::<DequeBuf>()?;
    Ok(deque.committed_len() + deque.pending_front.len() + deque.pending_back.len())
}

/// The deque type plug.
pub struct DequePlug;

impl DequePlug {
    fn commit_side(deque: &mut DequeBuf, side: Side) {
        if deque.lock(side) != 0 {
            return;
        }
        match side {
            Side::Front => {
                for _ in 0..deque.removed_front {
                    deque.data.pop_front();
                }
                deque.removed_front = 0;
                while let Some(entry) = deque.pending_front.pop_back() {
                    deque.data.push_front(entry);
                }
            }
            Side::Back => {
                for _ in 0..deque.removed_back {
                    deque.data.pop_back();
                }
                deque.removed_back = 0;
                while let Some(entry) = deque.pending_back.pop_back() {
                    deque.data.push_back(entry);
                }
            }
        }
    }

    fn rollback_side(deque: &mut DequeBuf, side: Side) {
        if deque.lock(side) != 0 {
            return;
        }
        deque.pending(side).clear();
        match side {
            Side::Front => deque.removed_front = 0,
            Side::Back => deque.removed_back = 0,
        }
    }
}

impl ObjectPlug for DequePlug {
    fn type_label(&self) -> &'static str {
        "deque"
    }

    fn create(&self) -> Result<Membuf, Errno> {
        Ok(Box::new(DequeBuf::default()))
    }

    fn commit(&self, object: &mut Object) -> Result<(), Errno> {
        let deque = object.membuf_mut::<DequeBuf>()?;
        Self::commit_side(deque, Side::Front);
        Self::commit_side(deque, Side::Back);
        Ok(())
    }

    fn rollback(&self, object: &mut Object) -> Result<(), Errno> {
        let deque = object.membuf_mut::<DequeBuf>()?;
        Self::rollback_side(deque, Side::Front);
        Self::rollback_side(deque, Side::Back);
        Ok(())
    }

    /// Clears the registered side's lock; the merge itself happens in
    /// `commit` once the lock is observed clear.
    fn apply(&self, object: &mut Object, mutation: MutationToken) {
        let deque = object.membuf_mut::<DequeBuf>().expect("deque membuf");
        deque.set_lock(Side::from_token(mutation), 0);
    }

    fn revert(&self, object: &mut Object, mutation: MutationToken) {
        let deque = object.membuf_mut::<DequeBuf>().expect("deque membuf");
        let side = Side::from_token(mutation);
        deque.pending(side).clear();
        match side {
            Side::Front => deque.removed_front = 0,
            Side::Back => deque.removed_back = 0,
        }
        deque.set_lock(side, 0);
    }
}
