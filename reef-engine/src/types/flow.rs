//! Append-only byte stream backed by an ordered tree of extents.
//!
//! Only `append` (and the size read) are wired up. Range reads, injection,
//! overwrite, removal and truncation all answer [`Errno::NotImplemented`];
//! callers must treat that as the contract, not as a placeholder to guess
//! around.

use crate::object::{Membuf, MutationToken, Object, ObjectPlug};
use crate::{Errno, Transaction};

use reef_buf::ByteRef;

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct FlowBuf {
    /// Extents keyed by stream offset.
    extents: BTreeMap<u64, ByteRef>,
    size: u64,
}

/// Append an extent at the current end of the stream; returns the new
/// stream size.
pub fn append(
    object: &mut Object,
    _txn: Option<&mut Transaction>,
    data: ByteRef,
) -> Result<u64, Errno> {
    let flow = object.membuf_mut::<FlowBuf>()?;
    let length = data.len() as u64;
    flow.extents.insert(flow.size, data);
    flow.size += length;
    Ok(flow.size)
}

/// Stream size in bytes.
pub fn size(object: &Object) -> Result<u64, Errno> {
    Ok(object.membuf::<FlowBuf>()?.size)
}

/// Range read; pending implementation.
pub fn read(
    object: &Object,
    _txn: Option<&Transaction>,
    _offset: u64,
    _length: u64,
) -> Result<ByteRef, Errno> {
    let _ = object.membuf::<FlowBuf>()?;
    Err(Errno::NotImplemented)
}

/// Insert bytes at an offset, shifting the tail; pending implementation.
pub fn inject(
    object: &mut Object,
    _txn: Option<&mut Transaction>,
    _offset: u64,
    _data: ByteRef,
) -> Result<u64, Errno> {
    let _ = object.membuf::<FlowBuf>()?;
    Err(Errno::NotImplemented)
}

/// Overwrite bytes at an offset; pending implementation.
pub fn write(
    object: &mut Object,
    _txn: Option<&mut Transaction>,
    _offset: u64,
    _data: ByteRef,
) -> Result<u64, Errno> {
    let _ = object.membuf::<FlowBuf>()?;
    Err(Errno::NotImplemented)
}

/// Remove a byte range; pending implementation.
pub fn remove(
    object: &mut Object,
    _txn: Option<&mut Transaction>,
    _offset: u64,
    _length: u64,
) -> Result<u64, Errno> {
    let _ = object.membuf::<FlowBuf>()?;
    Err(Errno::NotImplemented)
}

/// Cut the stream to `size` bytes; pending implementation.
pub fn truncate(
    object: &mut Object,
    _txn: Option<&mut Transaction>,
    _size: u64,
) -> Result<u64, Errno> {
    let _ = object.membuf::<FlowBuf>()?;
    Err(Errno::NotImplemented)
}

/// The flow type plug.
pub struct FlowPlug;

impl ObjectPlug for FlowPlug {
    fn type_label(&self) -> &'static str {
        "flow"
    }

    fn create(&self) -> Result<Membuf, Errno> {
        Ok(Box::new(FlowBuf::default()))
    }

    fn commit(&self, _object: &mut Object) -> Result<(), Errno> {
        Ok(())
    }

    fn rollback(&self, _object: &mut Object) -> Result<(), Errno> {
        Ok(())
    }

    fn apply(&self, _object: &mut Object, _mutation: MutationToken) {}

    fn revert(&self, _object: &mut Object, _mutation: MutationToken) {}
}
