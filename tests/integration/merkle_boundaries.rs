//! Boundary behaviors and scenario 3 from the testable-properties list.

use gridmesh_core::merkle::{DirEntry, MerkleError, Node, NodeKind};
use gridmesh_core::wire::{MAX_CHUNK_BYTES, MAX_DIRECTORY_ENTRIES, MAX_INTERNAL_CHILDREN};
use sha2::{Digest, Sha256};

#[test]
fn chunk_hash_matches_the_literal_sha256_of_kind_byte_plus_data() {
    let node = Node::chunk(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
    let mut hasher = Sha256::new();
    hasher.update([0x00, 0xde, 0xad, 0xbe, 0xef]);
    let expected: [u8; 32] = hasher.finalize().into();
    assert_eq!(node.hash, expected);
}

#[test]
fn a_directory_with_exactly_sixteen_entries_is_constructible() {
    let entries: Vec<DirEntry> = (0..MAX_DIRECTORY_ENTRIES)
        .map(|i| DirEntry { name: format!("f{i:02}"), child: Node::chunk(vec![i as u8]).unwrap() })
        .collect();
    assert!(Node::directory(entries).is_ok());
}

#[test]
fn a_directory_with_seventeen_entries_is_rejected_at_construction() {
    let entries: Vec<DirEntry> = (0..MAX_DIRECTORY_ENTRIES + 1)
        .map(|i| DirEntry { name: format!("f{i:02}"), child: Node::chunk(vec![i as u8]).unwrap() })
        .collect();
    assert!(matches!(Node::directory(entries), Err(MerkleError::DirectoryTooManyEntries(17))));
}

#[test]
fn a_chunk_of_exactly_1024_bytes_is_one_node() {
    let node = Node::chunk(vec![0u8; MAX_CHUNK_BYTES]).unwrap();
    assert!(matches!(node.kind, NodeKind::Chunk(_)));
}

#[test]
fn bytes_1025_split_into_an_internal_node_of_two_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, vec![0xAAu8; MAX_CHUNK_BYTES + 1]).unwrap();
    let node = gridmesh_core::merkle::build_from_path(&path).unwrap();
    match node.kind {
        NodeKind::Internal(children) => {
            assert_eq!(children.len(), 2);
            assert!(matches!(children[0].kind, NodeKind::Chunk(ref d) if d.len() == MAX_CHUNK_BYTES));
            assert!(matches!(children[1].kind, NodeKind::Chunk(ref d) if d.len() == 1));
        }
        other => panic!("expected an internal node of two chunks, got {other:?}"),
    }
}

#[test]
fn a_file_over_32_chunks_produces_an_internal_node_of_internal_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big");
    let data = vec![0x5Au8; MAX_CHUNK_BYTES * (MAX_INTERNAL_CHILDREN + 1)];
    std::fs::write(&path, &data).unwrap();
    let node = gridmesh_core::merkle::build_from_path(&path).unwrap();
    match &node.kind {
        NodeKind::Internal(children) => {
            assert!(children.len() <= MAX_INTERNAL_CHILDREN);
            assert!(
                children.iter().any(|c| matches!(c.kind, NodeKind::Internal(_))),
                "expected at least one grandchild level to itself be an internal node"
            );
        }
        other => panic!("expected a pyramid root, got {other:?}"),
    }
    let out = dir.path().join("big.out");
    gridmesh_core::merkle::write_to_path(&node, &out).unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), data);
}
