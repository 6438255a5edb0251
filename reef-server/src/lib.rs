//! Framed RPC service over the reef engine.
//!
//! A [`Server`] owns one poll engine, one [`reef_engine::Store`] and the
//! listeners feeding it. Every accepted connection becomes an engine
//! entity carrying its own frame reader and outbound queue; published
//! request frames route on `msg_type` to the store and the responses are
//! framed straight back into the connection's queue. Connections never
//! migrate off the engine that accepted them.
//!
//! The thin proxy binary, TLS termination and signal handling live
//! outside this crate; a front end hands file descriptors in and drives
//! [`Server::poll`].

#![warn(missing_docs)]
#![deny(unused_must_use)]

mod conn;
pub mod ops;
mod server;

pub use conn::{Connection, Datagram, Listener, SharedStore};
pub use server::{Server, ServerConfig};
