//! gridmesh wire format — the datagram header and tag space.
//!
//! Every datagram gridmesh sends or receives starts with a 7-byte header:
//! a 4-byte request id, a 1-byte tag, and a 2-byte body length, all in
//! network (big-endian) byte order. The body follows, and an optional
//! 64-byte trailing ECDSA signature follows that.
//!
//! Multi-byte fields use zerocopy's byte-order-aware integer wrappers
//! (`U16<BigEndian>`, `U32<BigEndian>`) rather than hand-rolled
//! to/from_be_bytes calls, so a `Header` value cannot be constructed with
//! the wrong endianness baked in. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub type BU16 = U16<BigEndian>;
pub type BU32 = U32<BigEndian>;

/// The 7-byte header that precedes every gridmesh datagram body.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Header {
    pub request_id: BU32,
    pub tag: u8,
    pub body_len: BU16,
}

assert_eq_size!(Header, [u8; 7]);

pub const HEADER_LEN: usize = 7;
pub const SIGNATURE_LEN: usize = 64;
pub const HASH_LEN: usize = 32;
pub const PUBKEY_LEN: usize = 64;

/// Largest datagram gridmesh will send or accept (header + body + signature).
/// Keeps every message comfortably under a conservative Ethernet/UDP MTU.
pub const MAX_DATAGRAM_LEN: usize = 2048;
pub const MAX_BODY_LEN: usize = MAX_DATAGRAM_LEN - HEADER_LEN - SIGNATURE_LEN;

pub const MAX_CHUNK_BYTES: usize = 1024;
pub const MIN_INTERNAL_CHILDREN: usize = 2;
pub const MAX_INTERNAL_CHILDREN: usize = 32;
pub const MAX_DIRECTORY_ENTRIES: usize = 16;
pub const DIRECTORY_NAME_LEN: usize = 32;

/// Tag byte discriminating a message's role. Tags >= 0x80 are replies to a
/// request carrying the same request id; tags < 0x80 are requests/events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    NoOp = 0x00,
    Error = 0x01,
    Hello = 0x02,
    PublicKey = 0x03,
    Root = 0x04,
    GetDatum = 0x05,
    NatTraversalRequest = 0x06,
    NatTraversal = 0x07,
    ErrorReply = 0x80,
    HelloReply = 0x81,
    PublicKeyReply = 0x82,
    RootReply = 0x83,
    Datum = 0x84,
    NoDatum = 0x85,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Tag::NoOp,
            0x01 => Tag::Error,
            0x02 => Tag::Hello,
            0x03 => Tag::PublicKey,
            0x04 => Tag::Root,
            0x05 => Tag::GetDatum,
            0x06 => Tag::NatTraversalRequest,
            0x07 => Tag::NatTraversal,
            0x80 => Tag::ErrorReply,
            0x81 => Tag::HelloReply,
            0x82 => Tag::PublicKeyReply,
            0x83 => Tag::RootReply,
            0x84 => Tag::Datum,
            0x85 => Tag::NoDatum,
            _ => return None,
        })
    }

    pub fn is_reply(self) -> bool {
        (self as u8) & 0x80 != 0
    }
}

/// The kind byte prefixing a decoded Datum reply's body — identifies which
/// of the three Merkle node shapes the remaining bytes encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatumKind {
    Chunk = 0,
    InternalNode = 1,
    Directory = 2,
}

impl DatumKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => DatumKind::Chunk,
            1 => DatumKind::InternalNode,
            2 => DatumKind::Directory,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram shorter than the {HEADER_LEN}-byte header")]
    Truncated,
    #[error("declared body length {declared} does not fit the {actual}-byte datagram")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("trailing bytes after the body are not a valid 64-byte signature (got {0})")]
    BadTrailer(usize),
    #[error("unknown datum kind byte {0}")]
    UnknownDatumKind(u8),
    #[error("unrecognized tag {0:#04x} in strict mode")]
    UnknownTag(u8),
    #[error("body for tag {tag:?} has wrong shape: {reason}")]
    Malformed { tag: Tag, reason: &'static str },
    #[error("body exceeds {MAX_BODY_LEN} bytes")]
    BodyTooLarge,
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
}
