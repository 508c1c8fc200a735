//! Scenario 1 from the testable-properties list: empty-root registration
//! against a directory stub that drives the Hello/PublicKey/Root exchange
//! as *requests*, exercising the session engine's server role rather than
//! its client role (the directory is the one asking).

use gridmesh_core::wire::HASH_LEN;
use gridmesh_session::{HandshakeState, SessionEngine, SessionTiming};

use crate::support::FakeUdpPeer;

#[tokio::test]
async fn empty_root_registration_answers_pubkey_and_root_with_empty_and_zero() {
    let directory = FakeUdpPeer::bind().await;
    let engine = SessionEngine::connect(
        directory.addr(),
        None,
        "alice".into(),
        None,
        None,
        None,
        SessionTiming::default(),
    )
    .await
    .unwrap();
    std::sync::Arc::clone(&engine).spawn_read_loop();

    // Our Hello, answered by the directory's HelloReply.
    let hello = tokio::spawn({
        let engine = std::sync::Arc::clone(&engine);
        async move { engine.hello().await }
    });
    let (msg, _, from) = directory.recv().await;
    let hello_id = msg.request_id();
    directory
        .send(
            from,
            &gridmesh_core::Message::HelloReply { request_id: hello_id, extensions: 0, name: "directory".into() },
        )
        .await;
    hello.await.unwrap().unwrap();
    assert_eq!(engine.state().await, HandshakeState::HelloDone);

    // The directory now asks for our public key; we have none configured.
    directory
        .send(from, &gridmesh_core::Message::PublicKey { request_id: 100, key: None })
        .await;
    let (reply, _, _) = directory.recv().await;
    assert!(
        matches!(reply, gridmesh_core::Message::PublicKeyReply { request_id: 100, key: None }),
        "expected an empty PublicKeyReply body, got {reply:?}"
    );

    // The directory asks for our root hash; we export nothing, so the
    // all-zero hash is the correct answer.
    directory.send(from, &gridmesh_core::Message::Root { request_id: 101, hash: [0u8; HASH_LEN] }).await;
    let (reply, _, _) = directory.recv().await;
    assert!(
        matches!(reply, gridmesh_core::Message::RootReply { request_id: 101, hash } if hash == [0u8; HASH_LEN]),
        "expected a RootReply carrying the all-zero hash, got {reply:?}"
    );
}

#[tokio::test]
async fn get_datum_served_from_local_tree_and_not_found_otherwise() {
    use gridmesh_core::merkle::Node;

    let local = std::sync::Arc::new(Node::chunk(b"exported".to_vec()).unwrap());
    let present_hash = local.hash;
    let absent_hash = [0xAAu8; HASH_LEN];

    let peer = FakeUdpPeer::bind().await;
    let engine = SessionEngine::connect(
        peer.addr(),
        None,
        "alice".into(),
        None,
        Some(std::sync::Arc::clone(&local)),
        None,
        SessionTiming::default(),
    )
    .await
    .unwrap();
    std::sync::Arc::clone(&engine).spawn_read_loop();

    peer.send(
        engine.local_addr(),
        &gridmesh_core::Message::GetDatum { request_id: 1, hash: present_hash },
    )
    .await;
    let (reply, _, _) = peer.recv().await;
    match reply {
        gridmesh_core::Message::Datum { hash, .. } => assert_eq!(hash, present_hash),
        other => panic!("expected a Datum reply for a hash we export, got {other:?}"),
    }

    peer.send(
        engine.local_addr(),
        &gridmesh_core::Message::GetDatum { request_id: 2, hash: absent_hash },
    )
    .await;
    let (reply, _, _) = peer.recv().await;
    assert!(matches!(
        reply,
        gridmesh_core::Message::NoDatum { request_id: 2, hash } if hash == absent_hash
    ));
}

/// Same scenario, but driven through `Orchestrator::register` rather than a
/// bare `SessionEngine` — exercises the keypair-on-disk bootstrap
/// (`gridmeshd::keyfile::load_or_generate`) and the config-driven UDP
/// address resolution alongside the handshake itself.
#[tokio::test]
async fn orchestrator_register_completes_the_directory_handshake() {
    use gridmesh_core::config::GridmeshConfig;
    use gridmeshd::Orchestrator;

    let directory = FakeUdpPeer::bind().await;
    let keypair_dir = tempfile::tempdir().unwrap();

    let mut config = GridmeshConfig::default();
    config.identity.name = "alice".into();
    config.identity.keypair_path = keypair_dir.path().join("keypair.pem");
    config.directory.udp_addr = directory.addr().to_string();

    let orchestrator = std::sync::Arc::new(Orchestrator::new(config).unwrap());
    let register = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        async move { orchestrator.register().await }
    });

    let (msg, _, from) = directory.recv().await;
    assert!(matches!(msg, gridmesh_core::Message::Hello { ref name, .. } if name == "alice"));
    directory
        .send(
            from,
            &gridmesh_core::Message::HelloReply {
                request_id: msg.request_id(),
                extensions: 0,
                name: "directory".into(),
            },
        )
        .await;

    register.await.unwrap().unwrap();
    assert!(keypair_dir.path().join("keypair.pem").exists(), "a keypair should have been generated on disk");
}
