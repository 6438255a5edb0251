//! Sorted key/value block layouts.
//!
//! A block is a fixed-size byte buffer carrying one of three interchangeable
//! sorted-map layouts, tagged by its first byte: an append-only log, an
//! embedded AVL tree, or a log with a side AVL index. All three expose the
//! same [`dblock::BlockMap`] interface.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod avl16;
pub mod dblock;
