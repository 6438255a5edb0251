//! Signed 64-bit number with transactional read/write split.
//!
//! Reads see `read_value` unless they come from the transaction holding
//! the operation lock, which sees its own `write_value`. Apply promotes
//! the write side; revert restores it from the read side.

use super::{check_lock, register_atom};
use crate::object::{Membuf, MutationToken, Object, ObjectPlug};
use crate::{Errno, Transaction};

use reef_types::TxnId;

#[derive(Debug, Default)]
pub(crate) struct NumberBuf {
    read_value: i64,
    write_value: i64,
    txn_id: TxnId,
}

/// Current value as seen by `txn` (or by everyone, when `None`).
pub fn get(object: &Object, txn: Option<&Transaction>) -> Result<i64, Errno> {
    let number = object.membuf::<NumberBuf>()?;
    if let Some(txn) = txn {
        if number.txn_id == txn.id() {
            return Ok(number.write_value);
        }
    }
    Ok(number.read_value)
}

/// Overwrite the value.
pub fn set(object: &mut Object, txn: Option<&mut Transaction>, value: i64) -> Result<(), Errno> {
    let oid = object.oid();
    let number = object.membuf_mut::<NumberBuf>()?;
    let txn_id = check_lock(number.txn_id, txn.as_deref())?;
    register_atom(txn, number.txn_id, oid, MutationToken(0))?;

    let number = object.membuf_mut::<NumberBuf>()?;
    number.write_value = value;
    number.txn_id = txn_id;
    Ok(())
}

/// Compare-and-swap. `current_value` reports the pre-swap value whether
/// or not the swap happened; a mismatch changes no state.
pub fn cas(
    object: &mut Object,
    txn: Option<&mut Transaction>,
    old_value: i64,
    new_value: i64,
    current_value: &mut i64,
) -> Result<(), Errno> {
    let oid = object.oid();
    let number = object.membuf_mut::<NumberBuf>()?;
    let txn_id = check_lock(number.txn_id, txn.as_deref())?;

    *current_value = number.write_value;
    if number.write_value != old_value {
        return Err(Errno::DataCas);
    }
    register_atom(txn, number.txn_id, oid, MutationToken(0))?;

    let number = object.membuf_mut::<NumberBuf>()?;
    number.write_value = new_value;
    number.txn_id = txn_id;
    Ok(())
}

/// Add `value`, returning the new value.
pub fn add(object: &mut Object, txn: Option<&mut Transaction>, value: i64) -> Result<i64, Errno> {
    let oid = object.oid();
    let number = object.membuf_mut::<NumberBuf>()?;
    let txn_id = check_lock(number.txn_id, txn.as_deref())?;
    register_atom(txn, number.txn_id, oid, MutationToken(0))?;

    let number = object.membuf_mut::<NumberBuf>()?;
    number.write_value = number.write_value.wrapping_add(value);
    number.txn_id = txn_id;
    Ok(number.write_value)
}

/// Multiply by `value`, returning the new value.
pub fn mul(object: &mut Object, txn: Option<&mut Transaction>, value: i64) -> Result<i64, Errno> {
    let oid = object.oid();
    let number = object.membuf_mut::<NumberBuf>()?;
    let txn_id = check_lock(number.txn_id, txn.as_deref())?;
    register_atom(txn, number.txn_id, oid, MutationToken(0))?;

    let number = object.membuf_mut::<NumberBuf>()?;
    number.write_value = number.write_value.wrapping_mul(value);
    number.txn_id = txn_id;
    Ok(number.write_value)
}

/// Divide by `divisor`, returning `(quotient, remainder)`.
pub fn div(
    object: &mut Object,
    txn: Option<&mut Transaction>,
    divisor: i64,
) -> Result<(i64, i64), Errno> {
    if divisor == 0 {
        return Err(Errno::NumberDivmodByZero);
    }

    let oid = object.oid();
    let number = object.membuf_mut::<NumberBuf>()?;
    let txn_id = check_lock(number.txn_id, txn.as_deref())?;
    register_atom(txn, number.txn_id, oid, MutationToken(0))?;

    let number = object.membuf_mut::<NumberBuf>()?;
    let remainder = number.write_value.wrapping_rem(divisor);
    number.write_value = number.write_value.wrapping_div(divisor);
    number.txn_id = txn_id;
    Ok((number.write_value, remainder))
}

/// The number type plug.
pub struct NumberPlug;

impl ObjectPlug for NumberPlug {
    fn type_label(&self) -> &'static str {
        "number"
    }

    fn create(&self) -> Result<Membuf, Errno> {
        Ok(Box::new(NumberBuf::default()))
    }

    fn commit(&self, object: &mut Object) -> Result<(), Errno> {
        let number = object.membuf_mut::<NumberBuf>()?;
        if number.txn_id == 0 {
            number.read_value = number.write_value;
        }
        Ok(())
    }

    fn rollback(&self, object: &mut Object) -> Result<(), Errno> {
        let number = object.membuf_mut::<NumberBuf>()?;
        if number.txn_id == 0 {
            number.write_value = number.read_value;
        }
        Ok(())
    }

    fn apply(&self, object: &mut Object, _mutation: MutationToken) {
        let number = object.membuf_mut::<NumberBuf>().expect("number membuf");
        number.read_value = number.write_value;
        number.txn_id = 0;
    }

    fn revert(&self, object: &mut Object, _mutation: MutationToken) {
        let number = object.membuf_mut::<NumberBuf>().expect("number membuf");
        number.write_value = number.read_value;
        number.txn_id = 0;
    }
}
