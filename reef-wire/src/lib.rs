//! RPC message framing.
//!
//! A frame is a variable-width head followed by three independent byte
//! payloads: `fwd` (routing metadata), `body` (structured request) and
//! `data` (opaque blob). Field widths self-describe in the two leading
//! bytes, so small messages cost a handful of bytes:
//!
//! ```text
//! +------------------+
//! | ---- |  11 |  11 | pkg-type, msg-type, fwd
//! |  111 |  11 | 111 | msg-id, body, data
//! +------------------+
//! |     msg type     | (1..4 bytes, little-endian)
//! |     msg id       | (1..8 bytes)
//! |    fwd length    | (0..3 bytes; zero width means empty)
//! |   body length    | (0..3 bytes)
//! |   data length    | (0..4 bytes)
//! +------------------+
//! /  fwd/body/data   /
//! +------------------+
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod head;
mod reader;
mod stats;
mod writer;

pub use head::{decode_head, encode_head, head_size, MsgHead, PkgType, MAX_HEAD_SIZE};
pub use reader::{ByteSource, Frame, FrameReader, Protocol, SliceSource};
pub use stats::MsgStats;
pub use writer::{encode_frame, ByteSink, FrameBuilder, FrameQueue};

/// Framing and transport errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The two head bytes or the following widths are malformed.
    #[error("malformed frame head")]
    BadHead,
    /// Reserved package type on the wire.
    #[error("reserved package type {0}")]
    BadPackageType(u8),
    /// A declared length exceeds the frame limits.
    #[error("declared length exceeds the frame limit")]
    Oversize,
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,
    /// The reader already entered the failure state.
    #[error("framing already failed")]
    Failed,
    /// The protocol refused the frame.
    #[error("protocol rejected the frame")]
    Rejected,
    /// Transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
