//! The gridmesh message set — one variant per tag, plus encode/decode
//! between `Message` and the raw header+body(+signature) datagram.
//!
//! Datum bodies are carried as opaque bytes (`kind` + payload) rather than
//! decoded into a `merkle::Node` here: interpreting a Datum reply requires
//! knowing which hash was asked for, and recursing into children requires
//! the network layer, so that decoding happens one level at a time in the
//! downloader (gridmesh-session) using `merkle::decode_datum_body`.

use std::net::SocketAddr;

use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{
    self, DatumKind, Header, Tag, WireError, DIRECTORY_NAME_LEN, HASH_LEN, HEADER_LEN,
    MAX_BODY_LEN, MAX_DIRECTORY_ENTRIES, PUBKEY_LEN, SIGNATURE_LEN,
};

/// A decoded gridmesh message. The request id correlates requests with
/// their replies; it is carried on every variant, including `NoOp`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NoOp {
        request_id: u32,
    },
    Error {
        request_id: u32,
        reason: String,
    },
    Hello {
        request_id: u32,
        extensions: u32,
        name: String,
    },
    /// `key == None` is the "I have no key" form of PublicKey/PublicKeyReply.
    PublicKey {
        request_id: u32,
        key: Option<[u8; PUBKEY_LEN]>,
    },
    Root {
        request_id: u32,
        hash: [u8; HASH_LEN],
    },
    GetDatum {
        request_id: u32,
        hash: [u8; HASH_LEN],
    },
    NatTraversalRequest {
        request_id: u32,
        addr: SocketAddr,
    },
    NatTraversal {
        request_id: u32,
        addr: SocketAddr,
    },
    ErrorReply {
        request_id: u32,
        reason: String,
    },
    HelloReply {
        request_id: u32,
        extensions: u32,
        name: String,
    },
    PublicKeyReply {
        request_id: u32,
        key: Option<[u8; PUBKEY_LEN]>,
    },
    RootReply {
        request_id: u32,
        hash: [u8; HASH_LEN],
    },
    Datum {
        request_id: u32,
        hash: [u8; HASH_LEN],
        kind: DatumKind,
        body: Vec<u8>,
    },
    NoDatum {
        request_id: u32,
        hash: [u8; HASH_LEN],
    },
    /// A syntactically valid header with a tag this build doesn't recognize.
    /// Non-strict decoding surfaces these instead of failing outright, so
    /// the session dispatcher can apply its own "say hello first" policy.
    Unknown {
        request_id: u32,
        tag: u8,
        body: Vec<u8>,
    },
}

impl Message {
    pub fn request_id(&self) -> u32 {
        match self {
            Message::NoOp { request_id }
            | Message::Error { request_id, .. }
            | Message::Hello { request_id, .. }
            | Message::PublicKey { request_id, .. }
            | Message::Root { request_id, .. }
            | Message::GetDatum { request_id, .. }
            | Message::NatTraversalRequest { request_id, .. }
            | Message::NatTraversal { request_id, .. }
            | Message::ErrorReply { request_id, .. }
            | Message::HelloReply { request_id, .. }
            | Message::PublicKeyReply { request_id, .. }
            | Message::RootReply { request_id, .. }
            | Message::Datum { request_id, .. }
            | Message::NoDatum { request_id, .. }
            | Message::Unknown { request_id, .. } => *request_id,
        }
    }

    pub fn tag(&self) -> Option<Tag> {
        Some(match self {
            Message::NoOp { .. } => Tag::NoOp,
            Message::Error { .. } => Tag::Error,
            Message::Hello { .. } => Tag::Hello,
            Message::PublicKey { .. } => Tag::PublicKey,
            Message::Root { .. } => Tag::Root,
            Message::GetDatum { .. } => Tag::GetDatum,
            Message::NatTraversalRequest { .. } => Tag::NatTraversalRequest,
            Message::NatTraversal { .. } => Tag::NatTraversal,
            Message::ErrorReply { .. } => Tag::ErrorReply,
            Message::HelloReply { .. } => Tag::HelloReply,
            Message::PublicKeyReply { .. } => Tag::PublicKeyReply,
            Message::RootReply { .. } => Tag::RootReply,
            Message::Datum { .. } => Tag::Datum,
            Message::NoDatum { .. } => Tag::NoDatum,
            Message::Unknown { .. } => return None,
        })
    }

    /// Encodes the header and body. Does not append a trailing signature —
    /// callers that need one append it themselves via [`append_signature`].
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let request_id = self.request_id();
        let body = self.encode_body()?;
        if body.len() > MAX_BODY_LEN {
            return Err(WireError::BodyTooLarge);
        }
        let tag = match self {
            Message::Unknown { tag, .. } => *tag,
            other => other.tag().expect("non-Unknown variant always has a tag") as u8,
        };
        let header = Header {
            request_id: U32::<BigEndian>::new(request_id),
            tag,
            body_len: wire::BU16::new(body.len() as u16),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn encode_body(&self) -> Result<Vec<u8>, WireError> {
        let mut body = Vec::new();
        match self {
            Message::NoOp { .. } => {}
            Message::Error { reason, .. } | Message::ErrorReply { reason, .. } => {
                body.extend_from_slice(reason.as_bytes());
            }
            Message::Hello { extensions, name, .. }
            | Message::HelloReply { extensions, name, .. } => {
                body.extend_from_slice(&extensions.to_be_bytes());
                body.extend_from_slice(name.as_bytes());
            }
            Message::PublicKey { key, .. } | Message::PublicKeyReply { key, .. } => {
                if let Some(k) = key {
                    body.extend_from_slice(k);
                }
            }
            Message::Root { hash, .. } | Message::RootReply { hash, .. } => {
                body.extend_from_slice(hash);
            }
            Message::GetDatum { hash, .. } => body.extend_from_slice(hash),
            Message::NatTraversalRequest { addr, .. } | Message::NatTraversal { addr, .. } => {
                encode_socket_addr(*addr, &mut body);
            }
            Message::Datum { hash, kind, body: datum_body, .. } => {
                body.extend_from_slice(hash);
                body.push(*kind as u8);
                body.extend_from_slice(datum_body);
            }
            Message::NoDatum { hash, .. } => body.extend_from_slice(hash),
            Message::Unknown { body: raw, .. } => body.extend_from_slice(raw),
        }
        Ok(body)
    }

    /// Decodes a single datagram into a message and an optional trailing
    /// signature. `strict` controls whether an unrecognized tag is an error
    /// (`Err(WireError::UnknownTag)`) or surfaced as `Message::Unknown`.
    pub fn decode(datagram: &[u8], strict: bool) -> Result<(Message, Option<[u8; SIGNATURE_LEN]>), WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let header = Header::read_from_prefix(datagram).ok_or(WireError::Truncated)?;
        let body_len = header.body_len.get() as usize;
        let request_id = header.request_id.get();
        let body_start = HEADER_LEN;
        let body_end = body_start
            .checked_add(body_len)
            .filter(|&end| end <= datagram.len())
            .ok_or(WireError::LengthMismatch {
                declared: body_len,
                actual: datagram.len().saturating_sub(HEADER_LEN),
            })?;
        let body = &datagram[body_start..body_end];
        let trailer = &datagram[body_end..];
        let signature = match trailer.len() {
            0 => None,
            SIGNATURE_LEN => {
                let mut sig = [0u8; SIGNATURE_LEN];
                sig.copy_from_slice(trailer);
                Some(sig)
            }
            other => return Err(WireError::BadTrailer(other)),
        };

        let tag = match Tag::from_u8(header.tag) {
            Some(t) => t,
            None => {
                if strict {
                    return Err(WireError::UnknownTag(header.tag));
                }
                return Ok((
                    Message::Unknown {
                        request_id,
                        tag: header.tag,
                        body: body.to_vec(),
                    },
                    signature,
                ));
            }
        };

        let message = decode_body(tag, request_id, body)?;
        Ok((message, signature))
    }
}

fn decode_body(tag: Tag, request_id: u32, body: &[u8]) -> Result<Message, WireError> {
    Ok(match tag {
        Tag::NoOp => Message::NoOp { request_id },
        Tag::Error => Message::Error { request_id, reason: utf8(tag, body)? },
        Tag::ErrorReply => Message::ErrorReply { request_id, reason: utf8(tag, body)? },
        Tag::Hello => {
            let (extensions, name) = decode_hello_body(tag, body)?;
            Message::Hello { request_id, extensions, name }
        }
        Tag::HelloReply => {
            let (extensions, name) = decode_hello_body(tag, body)?;
            Message::HelloReply { request_id, extensions, name }
        }
        Tag::PublicKey => Message::PublicKey { request_id, key: decode_pubkey_body(tag, body)? },
        Tag::PublicKeyReply => {
            Message::PublicKeyReply { request_id, key: decode_pubkey_body(tag, body)? }
        }
        Tag::Root => Message::Root { request_id, hash: fixed_hash(tag, body)? },
        Tag::RootReply => Message::RootReply { request_id, hash: fixed_hash(tag, body)? },
        Tag::GetDatum => Message::GetDatum { request_id, hash: fixed_hash(tag, body)? },
        Tag::NoDatum => Message::NoDatum { request_id, hash: fixed_hash(tag, body)? },
        Tag::NatTraversalRequest => Message::NatTraversalRequest {
            request_id,
            addr: decode_socket_addr(tag, body)?,
        },
        Tag::NatTraversal => {
            Message::NatTraversal { request_id, addr: decode_socket_addr(tag, body)? }
        }
        Tag::Datum => {
            if body.len() < HASH_LEN + 1 {
                return Err(WireError::Malformed { tag, reason: "shorter than hash + kind byte" });
            }
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(&body[..HASH_LEN]);
            let kind = DatumKind::from_u8(body[HASH_LEN]).ok_or(WireError::UnknownDatumKind(body[HASH_LEN]))?;
            let datum_body = body[HASH_LEN + 1..].to_vec();
            validate_datum_shape(tag, kind, &datum_body)?;
            Message::Datum { request_id, hash, kind, body: datum_body }
        }
    })
}

fn validate_datum_shape(tag: Tag, kind: DatumKind, body: &[u8]) -> Result<(), WireError> {
    match kind {
        DatumKind::Chunk => {
            if body.len() > wire::MAX_CHUNK_BYTES {
                return Err(WireError::Malformed { tag, reason: "chunk body exceeds 1024 bytes" });
            }
        }
        DatumKind::InternalNode => {
            if body.len() % HASH_LEN != 0 {
                return Err(WireError::Malformed { tag, reason: "internal node body is not a multiple of 32 bytes" });
            }
            let count = body.len() / HASH_LEN;
            if !(wire::MIN_INTERNAL_CHILDREN..=wire::MAX_INTERNAL_CHILDREN).contains(&count) {
                return Err(WireError::Malformed { tag, reason: "internal node child count out of range" });
            }
        }
        DatumKind::Directory => {
            let entry_len = DIRECTORY_NAME_LEN + HASH_LEN;
            if body.len() % entry_len != 0 {
                return Err(WireError::Malformed { tag, reason: "directory body is not a multiple of the entry size" });
            }
            let count = body.len() / entry_len;
            if count > MAX_DIRECTORY_ENTRIES {
                return Err(WireError::Malformed { tag, reason: "directory entry count exceeds 16" });
            }
        }
    }
    Ok(())
}

fn utf8(tag: Tag, body: &[u8]) -> Result<String, WireError> {
    String::from_utf8(body.to_vec()).map_err(|_| WireError::Malformed { tag, reason: "not valid UTF-8" })
}

fn decode_hello_body(tag: Tag, body: &[u8]) -> Result<(u32, String), WireError> {
    if body.len() < 4 {
        return Err(WireError::Malformed { tag, reason: "shorter than the 4-byte extensions field" });
    }
    let extensions = u32::from_be_bytes(body[..4].try_into().unwrap());
    let name = utf8(tag, &body[4..])?;
    Ok((extensions, name))
}

fn decode_pubkey_body(tag: Tag, body: &[u8]) -> Result<Option<[u8; PUBKEY_LEN]>, WireError> {
    match body.len() {
        0 => Ok(None),
        PUBKEY_LEN => {
            let mut key = [0u8; PUBKEY_LEN];
            key.copy_from_slice(body);
            Ok(Some(key))
        }
        _ => Err(WireError::Malformed { tag, reason: "public key body must be empty or 64 bytes" }),
    }
}

fn fixed_hash(tag: Tag, body: &[u8]) -> Result<[u8; HASH_LEN], WireError> {
    if body.len() != HASH_LEN {
        return Err(WireError::Malformed { tag, reason: "body must be exactly 32 bytes" });
    }
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(body);
    Ok(hash)
}

fn encode_socket_addr(addr: SocketAddr, out: &mut Vec<u8>) {
    match addr {
        SocketAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

fn decode_socket_addr(tag: Tag, body: &[u8]) -> Result<SocketAddr, WireError> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    match body.first() {
        Some(4) if body.len() == 1 + 4 + 2 => {
            let ip = Ipv4Addr::new(body[1], body[2], body[3], body[4]);
            let port = u16::from_be_bytes([body[5], body[6]]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        Some(6) if body.len() == 1 + 16 + 2 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[1..17]);
            let port = u16::from_be_bytes([body[17], body[18]]);
            Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
        }
        _ => Err(WireError::Malformed { tag, reason: "unrecognized address family byte or wrong length" }),
    }
}

/// Appends a 64-byte signature to an already-encoded frame.
pub fn append_signature(frame: &mut Vec<u8>, signature: &[u8; SIGNATURE_LEN]) {
    frame.extend_from_slice(signature);
}
