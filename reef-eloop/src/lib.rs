//! Event loop and scheduler.
//!
//! An [`iopoll::Engine`] multiplexes edge-triggered file-descriptor
//! readiness, timers and user events onto registered entities, one engine
//! per thread; entities are affinitized to the engine that accepted them
//! and never migrate. The [`sched::Scheduler`] runs a fixed pool of worker
//! threads pinned to cores, draining a shared virtual-time run queue.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod iopoll;
pub mod sched;
pub mod sock;
pub mod vtask;
