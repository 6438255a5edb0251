//! Frame head codec.

use crate::WireError;
use reef_types::varint;

/// Two width bytes plus the widest possible fields.
pub const MAX_HEAD_SIZE: usize = 2 + 4 + 8 + 3 + 3 + 7;

/// Frame classification carried in the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PkgType {
    /// Client request.
    Request = 1,
    /// Server response.
    Response = 2,
    /// Unsolicited server push.
    Push = 3,
}

impl TryFrom<u8> for PkgType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Push),
            other => Err(WireError::BadPackageType(other)),
        }
    }
}

/// Parsed frame head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHead {
    /// Operation selector routed on by the server.
    pub msg_type: u32,
    /// Caller-chosen correlation id echoed in the response.
    pub msg_id: u64,
    /// Length of the routing payload.
    pub fwd_length: u32,
    /// Length of the structured payload.
    pub body_length: u32,
    /// Length of the opaque payload.
    pub data_length: u32,
}

impl MsgHead {
    /// Total payload length following the head.
    pub fn payload_length(&self) -> u64 {
        self.fwd_length as u64 + self.body_length as u64 + self.data_length as u64
    }
}

/// Total head size implied by the two leading width bytes.
pub fn head_size(byte0: u8, byte1: u8) -> usize {
    let mt = 1 + ((byte0 >> 2) & 0x3) as usize;
    let fw = (byte0 & 0x3) as usize;
    let mi = 1 + ((byte1 >> 5) & 0x7) as usize;
    let b = ((byte1 >> 3) & 0x3) as usize;
    let d = (byte1 & 0x7) as usize;
    2 + mt + fw + mi + b + d
}

/// Encode the head into `out`, returning the encoded size.
///
/// The width nibbles are derived from the field values; zero-length
/// payload fields are elided entirely.
pub fn encode_head(out: &mut [u8; MAX_HEAD_SIZE], pkg: PkgType, head: &MsgHead) -> Result<usize, WireError> {
    let mt = varint::size_u32(head.msg_type);
    let fw = varint::zsize_u32(head.fwd_length);
    let mi = varint::size(head.msg_id);
    let b = varint::zsize_u32(head.body_length);
    let d = varint::zsize_u32(head.data_length);
    if fw > 3 || b > 3 {
        return Err(WireError::Oversize);
    }

    out[0] = ((pkg as u8) << 4) | (((mt - 1) as u8) << 2) | fw as u8;
    out[1] = (((mi - 1) as u8) << 5) | ((b as u8) << 3) | d as u8;

    let mut at = 2;
    varint::encode_into(&mut out[at..], mt, head.msg_type as u64);
    at += mt;
    varint::encode_into(&mut out[at..], mi, head.msg_id);
    at += mi;
    varint::encode_into(&mut out[at..], fw, head.fwd_length as u64);
    at += fw;
    varint::encode_into(&mut out[at..], b, head.body_length as u64);
    at += b;
    varint::encode_into(&mut out[at..], d, head.data_length as u64);
    at += d;
    Ok(at)
}

/// Decode a complete head from `buf`.
///
/// The caller has already checked `buf.len() >= head_size(..)`.
pub fn decode_head(buf: &[u8]) -> Result<(PkgType, MsgHead), WireError> {
    let pkg = PkgType::try_from((buf[0] >> 4) & 0xf)?;
    let mt = 1 + ((buf[0] >> 2) & 0x3) as usize;
    let fw = (buf[0] & 0x3) as usize;
    let mi = 1 + ((buf[1] >> 5) & 0x7) as usize;
    let b = ((buf[1] >> 3) & 0x3) as usize;
    let d = (buf[1] & 0x7) as usize;

    let mut at = 2;
    let msg_type = varint::decode_u32(&buf[at..], mt);
    at += mt;
    let msg_id = varint::decode(&buf[at..], mi);
    at += mi;
    let fwd_length = varint::decode_u32(&buf[at..], fw);
    at += fw;
    let body_length = varint::decode_u32(&buf[at..], b);
    at += b;
    let data_length = varint::decode(&buf[at..], d);
    if data_length > u32::MAX as u64 {
        return Err(WireError::Oversize);
    }

    Ok((
        pkg,
        MsgHead {
            msg_type,
            msg_id,
            fwd_length,
            body_length,
            data_length: data_length as u32,
        },
    ))
}
