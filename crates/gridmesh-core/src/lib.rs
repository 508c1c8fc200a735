//! gridmesh-core — wire format, cryptography, and the Merkle content model.
//!
//! Every other gridmesh crate depends on this one. Nothing here touches a
//! socket; `merkle::build_from_path`/`write_to_path` are the only functions
//! that touch the filesystem.

pub mod config;
pub mod crypto;
pub mod merkle;
pub mod message;
pub mod wire;

pub use message::Message;
pub use wire::{Tag, WireError};
