//! The object and transaction engine.
//!
//! A [`Store`] owns named objects whose type (number, deque, flow,
//! counter) decides the operations they accept. Write operations may join
//! a client-scoped transaction: the first touch of an object registers an
//! atom, commit replays atoms in order through each type's `apply`, and
//! rollback walks them backwards through `revert`. Contention is handled
//! without a lock manager: a second transaction touching a locked
//! operation gets a deterministic busy error instead of waiting.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod cache;
mod errno;
mod object;
mod store;
mod txn;
pub mod types;

pub use errno::Errno;
pub use object::{Membuf, MutationToken, Object, ObjectPlug, Registry};
pub use store::Store;
pub use txn::{Transaction, TxnState};
