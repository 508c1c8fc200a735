//! The Merkle content model: chunks, internal nodes, and directories.
//!
//! A node's hash is `SHA256(kind_byte || body)`, where `body` is the node's
//! canonical on-wire encoding (see [`encode_datum_body`]). Building a node
//! from raw bytes always re-derives and stores this hash; there is no way
//! to construct a `Node` with a hash that doesn't match its content.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::wire::{
    DatumKind, DIRECTORY_NAME_LEN, HASH_LEN, MAX_CHUNK_BYTES, MAX_DIRECTORY_ENTRIES,
    MAX_INTERNAL_CHILDREN, MIN_INTERNAL_CHILDREN,
};

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("chunk exceeds {MAX_CHUNK_BYTES} bytes (got {0})")]
    ChunkTooLarge(usize),
    #[error("internal node must have between {MIN_INTERNAL_CHILDREN} and {MAX_INTERNAL_CHILDREN} children (got {0})")]
    InternalChildCount(usize),
    #[error("directory must have at most {MAX_DIRECTORY_ENTRIES} entries (got {0})")]
    DirectoryTooManyEntries(usize),
    #[error("directory entry name {0:?} is longer than {DIRECTORY_NAME_LEN} bytes once UTF-8 encoded")]
    NameTooLong(String),
    #[error("directory entry names must be unique, {0:?} is repeated")]
    DuplicateName(String),
    #[error("downloaded node's content hash does not match the requested hash")]
    HashMismatch,
    #[error("io error reading {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
}

/// The shape-specific payload of a node. Matches [`crate::wire::DatumKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Chunk(Vec<u8>),
    Internal(Vec<Node>),
    Directory(Vec<DirEntry>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub child: Node,
}

/// A fully-resolved Merkle node: its content together with the hash that
/// content hashes to. `hash` is always `SHA256(kind_byte || body)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub hash: [u8; HASH_LEN],
    pub kind: NodeKind,
}

impl Node {
    pub fn chunk(data: Vec<u8>) -> Result<Node, MerkleError> {
        if data.len() > MAX_CHUNK_BYTES {
            return Err(MerkleError::ChunkTooLarge(data.len()));
        }
        let hash = hash_datum(DatumKind::Chunk, &data);
        Ok(Node { hash, kind: NodeKind::Chunk(data) })
    }

    pub fn internal(children: Vec<Node>) -> Result<Node, MerkleError> {
        if !(MIN_INTERNAL_CHILDREN..=MAX_INTERNAL_CHILDREN).contains(&children.len()) {
            return Err(MerkleError::InternalChildCount(children.len()));
        }
        let mut body = Vec::with_capacity(children.len() * HASH_LEN);
        for child in &children {
            body.extend_from_slice(&child.hash);
        }
        let hash = hash_datum(DatumKind::InternalNode, &body);
        Ok(Node { hash, kind: NodeKind::Internal(children) })
    }

    pub fn directory(mut entries: Vec<DirEntry>) -> Result<Node, MerkleError> {
        if entries.len() > MAX_DIRECTORY_ENTRIES {
            return Err(MerkleError::DirectoryTooManyEntries(entries.len()));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(MerkleError::DuplicateName(pair[0].name.clone()));
            }
        }
        let body = encode_directory_body(&entries)?;
        let hash = hash_datum(DatumKind::Directory, &body);
        Ok(Node { hash, kind: NodeKind::Directory(entries) })
    }

    pub fn datum_kind(&self) -> DatumKind {
        match &self.kind {
            NodeKind::Chunk(_) => DatumKind::Chunk,
            NodeKind::Internal(_) => DatumKind::InternalNode,
            NodeKind::Directory(_) => DatumKind::Directory,
        }
    }
}

fn hash_datum(kind: DatumKind, body: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([kind as u8]);
    hasher.update(body);
    hasher.finalize().into()
}

fn pad_name(name: &str) -> Result<[u8; DIRECTORY_NAME_LEN], MerkleError> {
    let bytes = name.as_bytes();
    if bytes.len() > DIRECTORY_NAME_LEN {
        return Err(MerkleError::NameTooLong(name.to_string()));
    }
    let mut padded = [0u8; DIRECTORY_NAME_LEN];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

fn encode_directory_body(entries: &[DirEntry]) -> Result<Vec<u8>, MerkleError> {
    let mut body = Vec::with_capacity(entries.len() * (DIRECTORY_NAME_LEN + HASH_LEN));
    for entry in entries {
        body.extend_from_slice(&pad_name(&entry.name)?);
        body.extend_from_slice(&entry.child.hash);
    }
    Ok(body)
}

/// Encodes a node's own body, the exact bytes carried as a Datum reply's
/// payload (after the hash and kind byte). For `Internal`/`Directory` this
/// is the list of child hashes only — children are fetched independently.
pub fn encode_datum_body(node: &Node) -> Vec<u8> {
    match &node.kind {
        NodeKind::Chunk(data) => data.clone(),
        NodeKind::Internal(children) => {
            children.iter().flat_map(|c| c.hash).collect()
        }
        NodeKind::Directory(entries) => {
            encode_directory_body(entries).expect("node was built through Node::directory")
        }
    }
}

/// The child hashes a single internal-node body names, in order.
pub fn parse_internal_children(body: &[u8]) -> Result<Vec<[u8; HASH_LEN]>, MerkleError> {
    let count = body.len() / HASH_LEN;
    if body.len() % HASH_LEN != 0 || !(MIN_INTERNAL_CHILDREN..=MAX_INTERNAL_CHILDREN).contains(&count) {
        return Err(MerkleError::InternalChildCount(count));
    }
    Ok(body.chunks_exact(HASH_LEN).map(|c| c.try_into().unwrap()).collect())
}

/// The (name, hash) pairs a directory body names, in declaration order.
pub fn parse_directory_entries(body: &[u8]) -> Result<Vec<(String, [u8; HASH_LEN])>, MerkleError> {
    let entry_len = DIRECTORY_NAME_LEN + HASH_LEN;
    if body.len() % entry_len != 0 {
        return Err(MerkleError::DirectoryTooManyEntries(body.len() / entry_len));
    }
    let count = body.len() / entry_len;
    if count > MAX_DIRECTORY_ENTRIES {
        return Err(MerkleError::DirectoryTooManyEntries(count));
    }
    body.chunks_exact(entry_len)
        .map(|entry| {
            let name_bytes = &entry[..DIRECTORY_NAME_LEN];
            let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(DIRECTORY_NAME_LEN);
            let name = std::str::from_utf8(&name_bytes[..nul])
                .map_err(|_| MerkleError::NameTooLong(hex::encode(name_bytes)))?
                .to_string();
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(&entry[DIRECTORY_NAME_LEN..]);
            Ok((name, hash))
        })
        .collect()
}

/// Verifies that `body` (with the given kind) actually hashes to `hash`.
/// This is the check every downloaded Datum must pass before it is trusted.
pub fn verify_datum(hash: &[u8; HASH_LEN], kind: DatumKind, body: &[u8]) -> bool {
    hash_datum(kind, body) == *hash
}

const SHARD_PREFIX: &str = "_shard-";

/// Builds a Merkle tree from a file or directory on disk.
///
/// Files larger than one chunk are split into [`MAX_CHUNK_BYTES`]-byte
/// chunks and assembled into a pyramid of internal nodes, each with at
/// most [`MAX_INTERNAL_CHILDREN`] children. Directories with more than
/// [`MAX_DIRECTORY_ENTRIES`] entries are sharded the same way: entries are
/// grouped under synthetic `_shard-NNN` directories, recursively, until
/// every directory node fits the 16-entry limit.
pub fn build_from_path(path: &Path) -> Result<Node, MerkleError> {
    let metadata = fs::metadata(path).map_err(|e| io_err(path, e))?;
    if metadata.is_dir() {
        build_dir(path)
    } else {
        build_file(path)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> MerkleError {
    MerkleError::Io { path: path.display().to_string(), source }
}

fn build_file(path: &Path) -> Result<Node, MerkleError> {
    let data = fs::read(path).map_err(|e| io_err(path, e))?;
    if data.is_empty() {
        return Node::chunk(Vec::new());
    }
    let chunks: Vec<Node> = data
        .chunks(MAX_CHUNK_BYTES)
        .map(|c| Node::chunk(c.to_vec()))
        .collect::<Result<_, _>>()?;
    build_pyramid(chunks)
}

/// Folds a flat list of nodes into a single node, grouping at most
/// [`MAX_INTERNAL_CHILDREN`] siblings per internal node and recursing
/// until one root remains.
fn build_pyramid(mut level: Vec<Node>) -> Result<Node, MerkleError> {
    if level.len() == 1 {
        return Ok(level.pop().unwrap());
    }
    let mut next = Vec::with_capacity(level.len().div_ceil(MAX_INTERNAL_CHILDREN));
    for group in level.chunks(MAX_INTERNAL_CHILDREN) {
        next.push(if group.len() >= MIN_INTERNAL_CHILDREN {
            Node::internal(group.to_vec())?
        } else {
            // A single leftover leaf carries forward unwrapped; it will be
            // grouped with siblings on the next pass, or become the root.
            group[0].clone()
        });
    }
    build_pyramid(next)
}

fn build_dir(path: &Path) -> Result<Node, MerkleError> {
    let mut entries: Vec<(String, Node)> = Vec::new();
    let mut read_entries: Vec<_> = fs::read_dir(path)
        .map_err(|e| io_err(path, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| io_err(path, e))?;
    read_entries.sort_by_key(|e| e.file_name());
    for entry in read_entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child = build_from_path(&entry.path())?;
        entries.push((name, child));
    }
    build_directory_sharded(entries)
}

/// Builds a directory node from (name, child) pairs, introducing
/// `_shard-NNN` sub-directories when there are more than
/// [`MAX_DIRECTORY_ENTRIES`] entries to hold directly.
fn build_directory_sharded(entries: Vec<(String, Node)>) -> Result<Node, MerkleError> {
    if entries.len() <= MAX_DIRECTORY_ENTRIES {
        let entries = entries.into_iter().map(|(name, child)| DirEntry { name, child }).collect();
        return Node::directory(entries);
    }
    let mut shards = Vec::new();
    for (i, group) in entries.chunks(MAX_DIRECTORY_ENTRIES).enumerate() {
        let shard_entries = group.iter().cloned().map(|(name, child)| DirEntry { name, child }).collect();
        let shard_node = Node::directory(shard_entries)?;
        shards.push((format!("{SHARD_PREFIX}{i:03}"), shard_node));
    }
    build_directory_sharded(shards)
}

/// Writes a node back out to the filesystem at `path`. Directories are
/// created as directories (including any synthetic `_shard-NNN` levels
/// introduced by sharding); chunk/internal-node subtrees are concatenated
/// in traversal order into a single file.
pub fn write_to_path(node: &Node, path: &Path) -> Result<(), MerkleError> {
    match &node.kind {
        NodeKind::Directory(entries) => {
            fs::create_dir_all(path).map_err(|e| io_err(path, e))?;
            for entry in entries {
                write_to_path(&entry.child, &path.join(&entry.name))?;
            }
            Ok(())
        }
        NodeKind::Chunk(_) | NodeKind::Internal(_) => {
            let mut buf = Vec::new();
            collect_leaf_bytes(node, &mut buf);
            fs::write(path, buf).map_err(|e| io_err(path, e))
        }
    }
}

fn collect_leaf_bytes(node: &Node, out: &mut Vec<u8>) {
    match &node.kind {
        NodeKind::Chunk(data) => out.extend_from_slice(data),
        NodeKind::Internal(children) => {
            for child in children {
                collect_leaf_bytes(child, out);
            }
        }
        NodeKind::Directory(_) => unreachable!("directories are not flattened into file bytes"),
    }
}
