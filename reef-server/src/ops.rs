//! Request codec and dispatch.
//!
//! The structured request lives in the frame body; bulk payloads (deque
//! entries, flow extents) travel in the frame data section. Body fields
//! are fixed-width little-endian:
//!
//! ```text
//! txn ops:      [txn: u64]
//! obj create:   [type_len: u8][type bytes][label bytes]
//! obj open:     [label bytes]
//! obj close:    [oid: u64]
//! number ops:   [txn: u64][oid: u64][operands: i64 ...]
//! deque ops:    [txn: u64][oid: u64][side: u8]
//! flow ops:     [txn: u64][oid: u64][offset/size operands: u64 ...]
//! counter ops:  [txn: u64][oid: u64][operands: i64 ...]
//! ```
//!
//! A response body always opens with the errno code byte; result fields
//! follow only on success, except compare-and-swap, which reports the
//! current value alongside both outcomes.

use reef_buf::{ByteRef, DbufReader};
use reef_engine::types::deque::Side;
use reef_engine::{Errno, Store};
use reef_wire::{FrameBuilder, MsgHead, PkgType, WireError};

/// Open a transaction.
pub const TXN_BEGIN: u32 = 0x01;
/// Commit a transaction.
pub const TXN_COMMIT: u32 = 0x02;
/// Roll a transaction back.
pub const TXN_ROLLBACK: u32 = 0x03;

/// Create an object.
pub const OBJ_CREATE: u32 = 0x10;
/// Resolve a label.
pub const OBJ_OPEN: u32 = 0x11;
/// Close an object.
pub const OBJ_CLOSE: u32 = 0x12;
/// Destroy an object.
pub const OBJ_UNLINK: u32 = 0x13;

/// Read a number.
pub const NUMBER_GET: u32 = 0x20;
/// Set a number.
pub const NUMBER_SET: u32 = 0x21;
/// Add to a number.
pub const NUMBER_ADD: u32 = 0x22;
/// Multiply a number.
pub const NUMBER_MUL: u32 = 0x23;
/// Divide a number.
pub const NUMBER_DIV: u32 = 0x24;
/// Compare-and-swap a number.
pub const NUMBER_CAS: u32 = 0x25;

/// Push a deque entry; the entry is the frame data payload.
pub const DEQUE_PUSH: u32 = 0x30;
/// Pop a deque entry into the response data payload.
pub const DEQUE_POP: u32 = 0x31;
/// Count reachable deque entries.
pub const DEQUE_LEN: u32 = 0x32;

/// Append the frame data payload to a flow.
pub const FLOW_APPEND: u32 = 0x40;
/// Range-read a flow.
pub const FLOW_READ: u32 = 0x41;
/// Inject into a flow.
pub const FLOW_INJECT: u32 = 0x42;
/// Overwrite a flow range.
pub const FLOW_WRITE: u32 = 0x43;
/// Remove a flow range.
pub const FLOW_REMOVE: u32 = 0x44;
/// Truncate a flow.
pub const FLOW_TRUNCATE: u32 = 0x45;
/// Read a flow's size.
pub const FLOW_SIZE: u32 = 0x46;

/// Read a counter.
pub const COUNTER_GET: u32 = 0x50;
/// Set a counter.
pub const COUNTER_SET: u32 = 0x51;
/// Add to a counter.
pub const COUNTER_ADD: u32 = 0x52;
/// Multiply a counter.
pub const COUNTER_MUL: u32 = 0x53;
/// Compare-and-swap a counter.
pub const COUNTER_CAS: u32 = 0x54;

/// Body cursor with fixed-width little-endian fields.
struct Body<'a> {
    buf: &'a [u8],
}

impl<'a> Body<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u8(&mut self) -> Result<u8, Errno> {
        let (first, rest) = self.buf.split_first().ok_or(Errno::NotImplemented)?;
        self.buf = rest;
        Ok(*first)
    }

    fn u64(&mut self) -> Result<u64, Errno> {
        if self.buf.len() < 8 {
            return Err(Errno::NotImplemented);
        }
        let (head, rest) = self.buf.split_at(8);
        self.buf = rest;
        Ok(u64::from_le_bytes(head.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> Result<i64, Errno> {
        Ok(self.u64()? as i64)
    }

    fn txn(&mut self) -> Result<Option<u64>, Errno> {
        let id = self.u64()?;
        Ok((id != 0).then_some(id))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Errno> {
        if self.buf.len() < len {
            return Err(Errno::NotImplemented);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

fn side_of(value: u8) -> Side {
    if value != 0 {
        Side::Front
    } else {
        Side::Back
    }
}

/// Successful response payload.
enum Reply {
    Empty,
    U64(u64),
    I64(i64),
    I64Pair(i64, i64),
    Data(ByteRef),
}

/// Execute one request, yielding the errno code and the reply payload.
///
/// Compare-and-swap arms carry the current value in the reply even on a
/// mismatch, which the response body then reports beside the error code.
fn execute(store: &mut Store, head: &MsgHead, body: &[u8], data: Vec<u8>) -> (Errno, Reply) {
    let mut body = Body::new(body);
    let outcome = match head.msg_type {
        TXN_BEGIN => Ok(Reply::U64(store.begin())),
        TXN_COMMIT => body
            .u64()
            .and_then(|txn| store.commit(txn))
            .map(|_| Reply::Empty),
        TXN_ROLLBACK => body
            .u64()
            .and_then(|txn| store.rollback(txn))
            .map(|_| Reply::Empty),

        OBJ_CREATE => (|| {
            let type_len = body.u8()? as usize;
            let type_label = label_str(body.bytes(type_len)?)?;
            let label = label_str(body.rest())?;
            store.create(label, type_label).map(Reply::U64)
        })(),
        OBJ_OPEN => label_str(body.rest()).and_then(|label| store.open(label).map(Reply::U64)),
        OBJ_CLOSE => body
            .u64()
            .and_then(|oid| store.close(oid))
            .map(|_| Reply::Empty),
        OBJ_UNLINK => body
            .u64()
            .and_then(|oid| store.unlink(oid))
            .map(|_| Reply::Empty),

        NUMBER_GET => (|| {
            let (txn, oid) = (body.txn()?, body.u64()?);
            store.number_get(txn, oid).map(Reply::I64)
        })(),
        NUMBER_SET => (|| {
            let (txn, oid, value) = (body.txn()?, body.u64()?, body.i64()?);
            store.number_set(txn, oid, value).map(|_| Reply::Empty)
        })(),
        NUMBER_ADD => (|| {
            let (txn, oid, value) = (body.txn()?, body.u64()?, body.i64()?);
            store.number_add(txn, oid, value).map(Reply::I64)
        })(),
        NUMBER_MUL => (|| {
            let (txn, oid, value) = (body.txn()?, body.u64()?, body.i64()?);
            store.number_mul(txn, oid, value).map(Reply::I64)
        })(),
        NUMBER_DIV => (|| {
            let (txn, oid, divisor) = (body.txn()?, body.u64()?, body.i64()?);
            store
                .number_div(txn, oid, divisor)
                .map(|(quotient, remainder)| Reply::I64Pair(quotient, remainder))
        })(),
        NUMBER_CAS => {
            return cas(&mut body, |txn, oid, old, new, current| {
                store.number_cas(txn, oid, old, new, current)
            });
        }

        DEQUE_PUSH => (|| {
            let (txn, oid, side) = (body.txn()?, body.u64()?, side_of(body.u8()?));
            store
                .deque_push(txn, oid, side, ByteRef::from_vec(data))
                .map(|_| Reply::Empty)
        })(),
        DEQUE_POP => (|| {
            let (txn, oid, side) = (body.txn()?, body.u64()?, side_of(body.u8()?));
            store.deque_pop(txn, oid, side).map(Reply::Data)
        })(),
        DEQUE_LEN => body
            .u64()
            .and_then(|oid| store.deque_len(oid))
            .map(|len| Reply::U64(len as u64)),

        FLOW_APPEND => (|| {
            let (txn, oid) = (body.txn()?, body.u64()?);
            store
                .flow_append(txn, oid, ByteRef::from_vec(data))
                .map(Reply::U64)
        })(),
        FLOW_READ => (|| {
            let (txn, oid) = (body.txn()?, body.u64()?);
            let (offset, length) = (body.u64()?, body.u64()?);
            store.flow_read(txn, oid, offset, length).map(Reply::Data)
        })(),
        FLOW_INJECT => (|| {
            let (txn, oid, offset) = (body.txn()?, body.u64()?, body.u64()?);
            store
                .flow_inject(txn, oid, offset, ByteRef::from_vec(data))
                .map(Reply::U64)
        })(),
        FLOW_WRITE => (|| {
            let (txn, oid, offset) = (body.txn()?, body.u64()?, body.u64()?);
            store
                .flow_write(txn, oid, offset, ByteRef::from_vec(data))
                .map(Reply::U64)
        })(),
        FLOW_REMOVE => (|| {
            let (txn, oid) = (body.txn()?, body.u64()?);
            let (offset, length) = (body.u64()?, body.u64()?);
            store.flow_remove(txn, oid, offset, length).map(Reply::U64)
        })(),
        FLOW_TRUNCATE => (|| {
            let (txn, oid, size) = (body.txn()?, body.u64()?, body.u64()?);
            store.flow_truncate(txn, oid, size).map(Reply::U64)
        })(),
        FLOW_SIZE => body
            .u64()
            .and_then(|oid| store.flow_size(oid))
            .map(Reply::U64),

        COUNTER_GET => (|| {
            let (txn, oid) = (body.txn()?, body.u64()?);
            store.counter_get(txn, oid).map(Reply::I64)
        })(),
        COUNTER_SET => (|| {
            let (txn, oid, value) = (body.txn()?, body.u64()?, body.i64()?);
            store.counter_set(txn, oid, value).map(|_| Reply::Empty)
        })(),
        COUNTER_ADD => (|| {
            let (txn, oid, value) = (body.txn()?, body.u64()?, body.i64()?);
            store.counter_add(txn, oid, value).map(Reply::I64)
        })(),
        COUNTER_MUL => (|| {
            let (txn, oid, value) = (body.txn()?, body.u64()?, body.i64()?);
            store.counter_mul(txn, oid, value).map(Reply::I64)
        })(),
        COUNTER_CAS => {
            return cas(&mut body, |txn, oid, old, new, current| {
                store.counter_cas(txn, oid, old, new, current)
            });
        }

        _ => Err(Errno::NotImplemented),
    };

    match outcome {
        Ok(reply) => (Errno::None, reply),
        Err(errno) => (errno, Reply::Empty),
    }
}

fn label_str(bytes: &[u8]) -> Result<&str, Errno> {
    core::str::from_utf8(bytes).map_err(|_| Errno::ObjectNotFound)
}

/// Shared compare-and-swap decoding: the current value rides in the reply
/// for both the success and the mismatch outcome.
fn cas(
    body: &mut Body<'_>,
    op: impl FnOnce(Option<u64>, u64, i64, i64, &mut i64) -> Result<(), Errno>,
) -> (Errno, Reply) {
    let parsed = (|| {
        let (txn, oid) = (body.txn()?, body.u64()?);
        let (old_value, new_value) = (body.i64()?, body.i64()?);
        Ok((txn, oid, old_value, new_value))
    })();
    let (txn, oid, old_value, new_value) = match parsed {
        Ok(fields) => fields,
        Err(errno) => return (errno, Reply::Empty),
    };

    let mut current = 0;
    match op(txn, oid, old_value, new_value, &mut current) {
        Ok(()) => (Errno::None, Reply::I64(current)),
        Err(Errno::DataCas) => (Errno::DataCas, Reply::I64(current)),
        Err(errno) => (errno, Reply::Empty),
    }
}

/// Dispatch a request and frame its response.
pub fn dispatch(
    store: &mut Store,
    head: &MsgHead,
    body: &[u8],
    data: Vec<u8>,
) -> Result<DbufReader, WireError> {
    let (errno, reply) = execute(store, head, body, data);

    let data_max = match &reply {
        Reply::Data(bytes) => bytes.len() as u32,
        _ => 0,
    };
    let mut response =
        FrameBuilder::begin(PkgType::Response, head.msg_type, head.msg_id, &[], 64, data_max)?;

    let mut body_length = 1u32;
    let mut data_length = 0u32;
    response.add(&[errno.code()]);
    match reply {
        Reply::Empty => {}
        Reply::U64(value) => {
            response.add(&value.to_le_bytes());
            body_length += 8;
        }
        Reply::I64(value) => {
            response.add(&value.to_le_bytes());
            body_length += 8;
        }
        Reply::I64Pair(a, b) => {
            response.add(&a.to_le_bytes());
            response.add(&b.to_le_bytes());
            body_length += 16;
        }
        Reply::Data(bytes) => {
            data_length = bytes.len() as u32;
            response.add_ref(bytes);
        }
    }

    Ok(response.finish(body_length, data_length))
}
