//! Verified download scenarios: a `SessionEngine` downloading against a
//! `FakeUdpPeer` that scripts exactly the replies a test wants, including
//! protocol violations the real engine would never produce itself.

use gridmesh_core::merkle::{encode_datum_body, DirEntry, Node};
use gridmesh_core::wire::{DatumKind, HASH_LEN};
use gridmesh_core::Message;
use gridmesh_session::{download_node, SessionEngine, SessionError, SessionTiming};

use crate::support::FakeUdpPeer;

async fn established_pair() -> (std::sync::Arc<SessionEngine>, FakeUdpPeer) {
    let peer = FakeUdpPeer::bind().await;
    let engine =
        SessionEngine::connect(peer.addr(), None, "alice".into(), None, None, None, SessionTiming::default())
            .await
            .unwrap();
    std::sync::Arc::clone(&engine).spawn_read_loop();

    // Drive the handshake with the fake peer answering by hand so the test
    // controls every byte without a second real SessionEngine in the loop.
    let hello = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { engine.hello().await }
    });
    let (msg, _, from) = peer.recv().await;
    let id = msg.request_id();
    peer.send(from, &Message::HelloReply { request_id: id, extensions: 0, name: "bob".into() }).await;
    hello.await.unwrap().unwrap();

    (engine, peer)
}

#[tokio::test]
async fn downloads_and_verifies_a_single_chunk() {
    let (engine, peer) = established_pair().await;
    let data = b"hello, gridmesh".to_vec();
    let node = Node::chunk(data.clone()).unwrap();
    let hash = node.hash;

    let fetch = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { download_node(&engine, hash).await }
    });
    let (msg, _, from) = peer.recv().await;
    assert!(matches!(msg, Message::GetDatum { hash: h, .. } if h == hash));
    peer.send(
        from,
        &Message::Datum { request_id: msg.request_id(), hash, kind: DatumKind::Chunk, body: data },
    )
    .await;

    let downloaded = fetch.await.unwrap().unwrap();
    assert_eq!(downloaded.hash, hash);
}

#[tokio::test]
async fn downloads_a_two_level_tree_recursively() {
    let (engine, peer) = established_pair().await;
    let leaf_a = Node::chunk(vec![1, 2, 3]).unwrap();
    let leaf_b = Node::chunk(vec![4, 5, 6]).unwrap();
    let root = Node::internal(vec![leaf_a.clone(), leaf_b.clone()]).unwrap();
    let root_hash = root.hash;

    let fetch = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { download_node(&engine, root_hash).await }
    });

    let (msg, _, from) = peer.recv().await;
    assert!(matches!(msg, Message::GetDatum { hash, .. } if hash == root_hash));
    peer.send(
        from,
        &Message::Datum {
            request_id: msg.request_id(),
            hash: root_hash,
            kind: DatumKind::InternalNode,
            body: encode_datum_body(&root),
        },
    )
    .await;

    for leaf in [&leaf_a, &leaf_b] {
        let (child_msg, _, from) = peer.recv().await;
        assert!(matches!(child_msg, Message::GetDatum { hash, .. } if hash == leaf.hash));
        peer.send(
            from,
            &Message::Datum {
                request_id: child_msg.request_id(),
                hash: leaf.hash,
                kind: DatumKind::Chunk,
                body: encode_datum_body(leaf),
            },
        )
        .await;
    }

    let downloaded = fetch.await.unwrap().unwrap();
    assert_eq!(downloaded.hash, root_hash);
}

#[tokio::test]
async fn downloads_a_directory_with_named_children() {
    let (engine, peer) = established_pair().await;
    let file = Node::chunk(b"contents".to_vec()).unwrap();
    let dir = Node::directory(vec![DirEntry { name: "readme.txt".into(), child: file.clone() }]).unwrap();
    let dir_hash = dir.hash;

    let fetch = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { download_node(&engine, dir_hash).await }
    });

    let (msg, _, from) = peer.recv().await;
    peer.send(
        from,
        &Message::Datum {
            request_id: msg.request_id(),
            hash: dir_hash,
            kind: DatumKind::Directory,
            body: encode_datum_body(&dir),
        },
    )
    .await;
    let (child_msg, _, from) = peer.recv().await;
    assert!(matches!(child_msg, Message::GetDatum { hash, .. } if hash == file.hash));
    peer.send(
        from,
        &Message::Datum {
            request_id: child_msg.request_id(),
            hash: file.hash,
            kind: DatumKind::Chunk,
            body: encode_datum_body(&file),
        },
    )
    .await;

    let downloaded = fetch.await.unwrap().unwrap();
    assert_eq!(downloaded.hash, dir_hash);
}

#[tokio::test]
async fn no_datum_surfaces_as_not_found() {
    let (engine, peer) = established_pair().await;
    let hash = [0x42u8; HASH_LEN];

    let fetch = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { download_node(&engine, hash).await }
    });
    let (msg, _, from) = peer.recv().await;
    peer.send(from, &Message::NoDatum { request_id: msg.request_id(), hash }).await;

    assert!(matches!(fetch.await.unwrap(), Err(SessionError::NotFound)));
}

/// Scenario 4 from the testable-properties list: a Datum whose embedded
/// hash field does not match the hash that was requested is a protocol
/// violation, not a content-integrity failure — the downloader sends an
/// ErrorReply and fails with `ReplyHashMismatch`, independent of whatever
/// bytes happen to follow.
#[tokio::test]
async fn reply_with_wrong_embedded_hash_field_is_a_protocol_violation() {
    let (engine, peer) = established_pair().await;
    let requested_hash = [0x11u8; HASH_LEN];
    let wrong_hash = [0x22u8; HASH_LEN];

    let fetch = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { download_node(&engine, requested_hash).await }
    });
    let (msg, _, from) = peer.recv().await;
    peer.send(
        from,
        &Message::Datum {
            request_id: msg.request_id(),
            hash: wrong_hash,
            kind: DatumKind::Chunk,
            body: vec![9, 9, 9],
        },
    )
    .await;

    assert!(matches!(fetch.await.unwrap(), Err(SessionError::ReplyHashMismatch)));

    // The engine is still usable afterwards — the session stays Established,
    // protocol errors don't tear down the socket.
    let (error_reply, _, _) = peer.recv().await;
    assert!(matches!(error_reply, Message::ErrorReply { .. }));
}

#[tokio::test]
async fn chunk_body_not_matching_its_own_hash_is_a_content_integrity_failure() {
    let (engine, peer) = established_pair().await;
    let hash = Node::chunk(b"original".to_vec()).unwrap().hash;

    let fetch = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { download_node(&engine, hash).await }
    });
    let (msg, _, from) = peer.recv().await;
    // Embedded hash field matches what was asked for, but the body doesn't
    // actually hash to it — a tampered or buggy peer.
    peer.send(
        from,
        &Message::Datum {
            request_id: msg.request_id(),
            hash,
            kind: DatumKind::Chunk,
            body: b"tampered".to_vec(),
        },
    )
    .await;

    assert!(matches!(fetch.await.unwrap(), Err(SessionError::ChunkHashMismatch)));
}
