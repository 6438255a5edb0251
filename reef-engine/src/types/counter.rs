//! Counter: the pre-transactional sibling of the number type.
//!
//! Same read/write split and lock behavior, minus division, and its atoms
//! carry no payload at all.

use super::{check_lock, register_atom};
use crate::object::{Membuf, MutationToken, Object, ObjectPlug};
use crate::{Errno, Transaction};

use reef_types::TxnId;

#[derive(Debug, Default)]
pub(crate) struct CounterBuf {
    read_value: i64,
    write_value: i64,
    txn_id: TxnId,
}

/// Current value as seen by `txn` (or by everyone, when `None`).
pub fn get(object: &Object, txn: Option<&Transaction>) -> Result<i64, Errno> {
    let counter = object.membuf::<CounterBuf>()?;
    if let Some(txn) = txn {
        if counter.txn_id == txn.id() {
            return Ok(counter.write_value);
        }
    }
    Ok(counter.read_value)
}

/// Overwrite the value.
pub fn set(object: &mut Object, txn: Option<&mut Transaction>, value: i64) -> Result<(), Errno> {
    let oid = object.oid();
    let counter = object.membuf_mut::<CounterBuf>()?;
    let txn_id = check_lock(counter.txn_id, txn.as_deref())?;
    register_atom(txn, counter.txn_id, oid, MutationToken(0))?;

    let counter = object.membuf_mut::<CounterBuf>()?;
    counter.write_value = value;
    counter.txn_id = txn_id;
    Ok(())
}

/// Compare-and-swap; see the number type for the `current_value` contract.
pub fn cas(
    object: &mut Object,
    txn: Option<&mut Transaction>,
    old_value: i64,
    new_value: i64,
    current_value: &mut i64,
) -> Result<(), Errno> {
    let oid = object.oid();
    let counter = object.membuf_mut::<CounterBuf>()?;
    let txn_id = check_lock(counter.txn_id, txn.as_deref())?;

    *current_value = counter.write_value;
    if counter.write_value != old_value {
        return Err(Errno::DataCas);
    }
    register_atom(txn, counter.txn_id, oid, MutationToken(0))?;

    let counter = object.membuf_mut::<CounterBuf>()?;
    counter.write_value = new_value;
    counter.txn_id = txn_id;
    Ok(())
}

/// Add `value`, returning the new value.
pub fn add(object: &mut Object, txn: Option<&mut Transaction>, value: i64) -> Result<i64, Errno> {
    let oid = object.oid();
    let counter = object.membuf_mut::<CounterBuf>()?;
    let txn_id = check_lock(counter.txn_id, txn.as_deref())?;
    register_atom(txn, counter.txn_id, oid, MutationToken(0))?;

    let counter = object.membuf_mut::<CounterBuf>()?;
    counter.write_value = counter.write_value.wrapping_add(value);
    counter.txn_id = txn_id;
    Ok(counter.write_value)
}

/// Multiply by `value`, returning the new value.
pub fn mul(object: &mut Object, txn: Option<&mut Transaction>, value: i64) -> Result<i64, Errno> {
    let oid = object.oid();
    let counter = object.membuf_mut::<CounterBuf>()?;
    let txn_id = check_lock(counter.txn_id, txn.as_deref())?;
    register_atom(txn, counter.txn_id, oid, MutationToken(0))?;

    let counter = object.membuf_mut::<CounterBuf>()?;
    counter.write_value = counter.write_value.wrapping_mul(value);
    counter.txn_id = txn_id;
    Ok(counter.write_value)
}

/// The counter type plug.
pub struct CounterPlug;

impl ObjectPlug for CounterPlug {
    fn type_label(&self) -> &'static str {
        "counter"
    }

    fn create(&self) -> Result<Membuf, Errno> {
        Ok(Box::new(CounterBuf::default()))
    }

    fn commit(&self, object: &mut Object) -> Result<(), Errno> {
        let counter = object.membuf_mut::<CounterBuf>()?;
        if counter.txn_id == 0 {
            counter.read_value = counter.write_value;
        }
        Ok(())
    }

    fn rollback(&self, object: &mut Object) -> Result<(), Errno> {
        let counter = object.membuf_mut::<CounterBuf>()?;
        if counter.txn_id == 0 {
            counter.write_value = counter.read_value;
        }
        Ok(())
    }

    fn apply(&self, object: &mut Object, _mutation: MutationToken) {
        let counter = object.membuf_mut::<CounterBuf>().expect("counter membuf");
        counter.read_value = counter.write_value;
        counter.txn_id = 0;
    }

    fn revert(&self, object: &mut Object, _mutation: MutationToken) {
        let counter = object.membuf_mut::<CounterBuf>().expect("counter membuf");
        counter.write_value = counter.read_value;
        counter.txn_id = 0;
    }
}
