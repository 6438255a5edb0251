use crate::object::{Object, Registry};
use crate::txn::{TxnManager, TxnState};
use crate::types::{counter, deque, flow, number};
use crate::{Errno, Transaction};

use reef_buf::ByteRef;
use reef_types::{Oid, TxnId};

use hashbrown::HashMap;

/// The storage engine: named objects, their types, and the transactions
/// spanning them.
///
/// The store is single-owner state; everything it holds is reachable from
/// exactly one engine thread at a time. Write operations with no
/// transaction auto-commit: the pending write is promoted before the call
/// returns.
pub struct Store {
    registry: Registry,
    objects: HashMap<Oid, Object>,
    labels: HashMap<String, Oid>,
    txns: TxnManager,
    next_oid: Oid,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Store with the built-in type registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::with_builtins())
    }

    /// Store over a caller-assembled registry.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            objects: HashMap::new(),
            labels: HashMap::new(),
            txns: TxnManager::new(),
            next_oid: 0,
        }
    }

    // ------------------------------------------------------------------
    //  Object lifecycle
    // ------------------------------------------------------------------

    /// Create an object of the given type under `label`.
    pub fn create(&mut self, label: &str, type_label: &str) -> Result<Oid, Errno> {
        if self.labels.contains_key(label) {
            return Err(Errno::ObjectExists);
        }
        let plug = self.registry.resolve(type_label).ok_or(Errno::ObjectNotFound)?;

        self.next_oid += 1;
        let oid = self.next_oid;
        let object = Object::new(oid, label.to_string(), plug)?;
        self.objects.insert(oid, object);
        self.labels.insert(label.to_string(), oid);
        tracing::debug!(oid, label, type_label, "object created");
        Ok(oid)
    }

    /// Resolve a label to its object id.
    pub fn open(&self, label: &str) -> Result<Oid, Errno> {
        self.labels.get(label).copied().ok_or(Errno::ObjectNotFound)
    }

    /// Borrow an object.
    pub fn object(&self, oid: Oid) -> Result<&Object, Errno> {
        self.objects.get(&oid).ok_or(Errno::ObjectNotFound)
    }

    /// Drop an object and free its state.
    pub fn close(&mut self, oid: Oid) -> Result<(), Errno> {
        let mut object = self.objects.remove(&oid).ok_or(Errno::ObjectNotFound)?;
        self.labels.remove(object.label());
        object.plug().close(&mut object)?;
        tracing::debug!(oid, "object closed");
        Ok(())
    }

    /// Flush an object's durable state, for types that keep any.
    pub fn sync(&mut self, oid: Oid) -> Result<(), Errno> {
        let object = self.objects.get_mut(&oid).ok_or(Errno::ObjectNotFound)?;
        object.plug().sync(object)
    }

    /// Destroy an object's durable state, then drop it.
    pub fn unlink(&mut self, oid: Oid) -> Result<(), Errno> {
        let mut object = self.objects.remove(&oid).ok_or(Errno::ObjectNotFound)?;
        self.labels.remove(object.label());
        object.plug().unlink(&mut object)?;
        object.plug().close(&mut object)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Transactions
    // ------------------------------------------------------------------

    /// Open a transaction.
    pub fn begin(&mut self) -> TxnId {
        let id = self.txns.begin();
        tracing::trace!(txn = id, "transaction open");
        id
    }

    /// Borrow an open transaction.
    pub fn txn(&self, id: TxnId) -> Option<&Transaction> {
        self.txns.get(id)
    }

    /// Commit: replay atoms front-to-back through each type's `apply`,
    /// then promote with `commit`.
    ///
    /// `apply` cannot fail by contract; a failing `commit` here means a
    /// type broke that contract.
    pub fn commit(&mut self, id: TxnId) -> Result<(), Errno> {
        let mut txn = self.txns.take(id).ok_or(Errno::TxnNotFound)?;
        txn.begin_commit()?;

        for atom in txn.atoms() {
            let Some(object) = self.objects.get_mut(&atom.oid) else {
                tracing::warn!(oid = atom.oid, "atom references a closed object");
                continue;
            };
            object.plug().apply(object, atom.mutation);
            object.plug().commit(object)?;
        }

        txn.finish(TxnState::Committed);
        tracing::trace!(txn = id, atoms = txn.atoms().len(), "transaction committed");
        Ok(())
    }

    /// Rollback: walk atoms back-to-front through each type's `revert`,
    /// then discard leftovers with `rollback`.
    pub fn rollback(&mut self, id: TxnId) -> Result<(), Errno> {
        let mut txn = self.txns.take(id).ok_or(Errno::TxnNotFound)?;
        txn.begin_rollback()?;

        for atom in txn.atoms().iter().rev() {
            let Some(object) = self.objects.get_mut(&atom.oid) else {
                continue;
            };
            object.plug().revert(object, atom.mutation);
            object.plug().rollback(object)?;
        }

        txn.finish(TxnState::RolledBack);
        tracing::trace!(txn = id, "transaction rolled back");
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Operation plumbing
    // ------------------------------------------------------------------

    /// Run a read operation against an object and an optional transaction.
    fn read_op<R>(
        &self,
        txn: Option<TxnId>,
        oid: Oid,
        op: impl FnOnce(&Object, Option<&Transaction>) -> Result<R, Errno>,
    ) -> Result<R, Errno> {
        let object = self.objects.get(&oid).ok_or(Errno::ObjectNotFound)?;
        let txn = match txn {
            Some(id) => Some(self.txns.get(id).ok_or(Errno::TxnNotFound)?),
            None => None,
        };
        op(object, txn)
    }

    /// Run a write operation; with no transaction the object's pending
    /// state is promoted immediately afterwards.
    fn write_op<R>(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        op: impl FnOnce(&mut Object, Option<&mut Transaction>) -> Result<R, Errno>,
    ) -> Result<R, Errno> {
        let object = self.objects.get_mut(&oid).ok_or(Errno::ObjectNotFound)?;
        let txn = match txn {
            Some(id) => Some(self.txns.get_mut(id).ok_or(Errno::TxnNotFound)?),
            None => None,
        };

        let auto_commit = txn.is_none();
        let result = op(&mut *object, txn)?;
        if auto_commit {
            object.plug().commit(object)?;
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    //  Number operations
    // ------------------------------------------------------------------

    /// Read a number.
    pub fn number_get(&self, txn: Option<TxnId>, oid: Oid) -> Result<i64, Errno> {
        self.read_op(txn, oid, number::get)
    }

    /// Set a number.
    pub fn number_set(&mut self, txn: Option<TxnId>, oid: Oid, value: i64) -> Result<(), Errno> {
        self.write_op(txn, oid, |object, txn| number::set(object, txn, value))
    }

    /// Compare-and-swap a number; reports the pre-swap value either way.
    pub fn number_cas(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        old_value: i64,
        new_value: i64,
        current_value: &mut i64,
    ) -> Result<(), Errno> {
        self.write_op(txn, oid, |object, txn| {
            number::cas(object, txn, old_value, new_value, current_value)
        })
    }

    /// Add to a number, returning the new value.
    pub fn number_add(&mut self, txn: Option<TxnId>, oid: Oid, value: i64) -> Result<i64, Errno> {
        self.write_op(txn, oid, |object, txn| number::add(object, txn, value))
    }

    /// Multiply a number, returning the new value.
    pub fn number_mul(&mut self, txn: Option<TxnId>, oid: Oid, value: i64) -> Result<i64, Errno> {
        self.write_op(txn, oid, |object, txn| number::mul(object, txn, value))
    }

    /// Divide a number, returning `(quotient, remainder)`.
    pub fn number_div(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        divisor: i64,
    ) -> Result<(i64, i64), Errno> {
        self.write_op(txn, oid, |object, txn| number::div(object, txn, divisor))
    }

    // ------------------------------------------------------------------
    //  Deque operations
    // ------------------------------------------------------------------

    /// Push on one side of a deque.
    pub fn deque_push(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        side: deque::Side,
        data: ByteRef,
    ) -> Result<(), Errno> {
        self.write_op(txn, oid, |object, txn| deque::push(object, txn, side, data))
    }

    /// Pop from one side of a deque.
    pub fn deque_pop(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        side: deque::Side,
    ) -> Result<ByteRef, Errno> {
        self.write_op(txn, oid, |object, txn| deque::pop(object, txn, side))
    }

    /// Entries currently reachable in a deque.
    pub fn deque_len(&self, oid: Oid) -> Result<usize, Errno> {
        self.read_op(None, oid, |object, _| deque::len(object))
    }

    // ------------------------------------------------------------------
    //  Flow operations
    // ------------------------------------------------------------------

    /// Append to a flow, returning the new stream size.
    pub fn flow_append(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        data: ByteRef,
    ) -> Result<u64, Errno> {
        self.write_op(txn, oid, |object, txn| flow::append(object, txn, data))
    }

    /// Flow stream size.
    pub fn flow_size(&self, oid: Oid) -> Result<u64, Errno> {
        self.read_op(None, oid, |object, _| flow::size(object))
    }

    /// Range read; final [`Errno::NotImplemented`] for now.
    pub fn flow_read(
        &self,
        txn: Option<TxnId>,
        oid: Oid,
        offset: u64,
        length: u64,
    ) -> Result<ByteRef, Errno> {
        self.read_op(txn, oid, |object, txn| flow::read(object, txn, offset, length))
    }

    /// Inject; final [`Errno::NotImplemented`] for now.
    pub fn flow_inject(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        offset: u64,
        data: ByteRef,
    ) -> Result<u64, Errno> {
        self.write_op(txn, oid, |object, txn| flow::inject(object, txn, offset, data))
    }

    /// Overwrite; final [`Errno::NotImplemented`] for now.
    pub fn flow_write(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        offset: u64,
        data: ByteRef,
    ) -> Result<u64, Errno> {
        self.write_op(txn, oid, |object, txn| flow::write(object, txn, offset, data))
    }

    /// Remove a range; final [`Errno::NotImplemented`] for now.
    pub fn flow_remove(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        offset: u64,
        length: u64,
    ) -> Result<u64, Errno> {
        self.write_op(txn, oid, |object, txn| flow::remove(object, txn, offset, length))
    }

    /// Truncate; final [`Errno::NotImplemented`] for now.
    pub fn flow_truncate(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        size: u64,
    ) -> Result<u64, Errno> {
        self.write_op(txn, oid, |object, txn| flow::truncate(object, txn, size))
    }

    // ------------------------------------------------------------------
    //  Counter operations
    // ------------------------------------------------------------------

    /// Read a counter.
    pub fn counter_get(&self, txn: Option<TxnId>, oid: Oid) -> Result<i64, Errno> {
        self.read_op(txn, oid, counter::get)
    }

    /// Set a counter.
    pub fn counter_set(&mut self, txn: Option<TxnId>, oid: Oid, value: i64) -> Result<(), Errno> {
        self.write_op(txn, oid, |object, txn| counter::set(object, txn, value))
    }

    /// Compare-and-swap a counter.
    pub fn counter_cas(
        &mut self,
        txn: Option<TxnId>,
        oid: Oid,
        old_value: i64,
        new_value: i64,
        current_value: &mut i64,
    ) -> Result<(), Errno> {
        self.write_op(txn, oid, |object, txn| {
            counter::cas(object, txn, old_value, new_value, current_value)
        })
    }

    /// Add to a counter, returning the new value.
    pub fn counter_add(&mut self, txn: Option<TxnId>, oid: Oid, value: i64) -> Result<i64, Errno> {
        self.write_op(txn, oid, |object, txn| counter::add(object, txn, value))
    }

    /// Multiply a counter, returning the new value.
    pub fn counter_mul(&mut self, txn: Option<TxnId>, oid: Oid, value: i64) -> Result<i64, Errno> {
        self.write_op(txn, oid, |object, txn| counter::mul(object, txn, value))
    }
}
