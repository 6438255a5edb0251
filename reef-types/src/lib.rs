//! Atomic types of the reef store: explicit-width integer codecs,
//! delta-packed integer runs, bit twiddling and log-spaced histograms.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod bits;
pub mod histogram;
#[cfg(feature = "alloc")]
pub mod intpack;
pub mod varint;

/// Canonical word type carried by the store operations.
pub type Word = u64;

/// Object identifier type.
pub type Oid = u64;

/// Transaction identifier type; valid ids are always greater than zero.
pub type TxnId = u64;
