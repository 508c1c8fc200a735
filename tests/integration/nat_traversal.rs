//! Scenario 5 from the testable-properties list: a peer that never answers
//! Hello drives the session into `NatFallback`, the orchestrator asks the
//! directory to relay a working address, and a *fresh* session is opened
//! toward that address rather than retrying on the permanently-connected,
//! unreachable socket.

use gridmesh_core::config::GridmeshConfig;
use gridmesh_core::wire::HASH_LEN;
use gridmesh_core::Message;
use gridmeshd::Orchestrator;

use crate::support::{spawn_http_stub, FakeUdpPeer, StubRoute};

#[tokio::test]
async fn connect_recovers_via_a_fresh_session_after_nat_fallback() {
    let directory = FakeUdpPeer::bind().await;
    let unreachable = FakeUdpPeer::bind().await;
    let relayed = FakeUdpPeer::bind().await;

    let http_addr = spawn_http_stub(vec![
        StubRoute::ok("/peers/bob/addresses", format!("{}\n", unreachable.addr())),
        StubRoute::not_found("/peers/bob/key"),
    ])
    .await;

    let keypair_dir = tempfile::tempdir().unwrap();
    let mut config = GridmeshConfig::default();
    config.identity.name = "alice".into();
    config.identity.keypair_path = keypair_dir.path().join("keypair.pem");
    config.directory.udp_addr = directory.addr().to_string();
    config.directory.base_url = format!("http://{http_addr}");
    // A single Hello timeout is enough to trip NAT fallback, and a short
    // fetch timeout keeps the unreachable peer's wasted round-trip brief.
    config.session.fetch_timeout_secs = 1;
    config.session.nat_fallback_after_misses = 1;

    let orchestrator = std::sync::Arc::new(Orchestrator::new(config).unwrap());

    let register = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        async move { orchestrator.register().await }
    });
    let (msg, _, from) = directory.recv().await;
    directory
        .send(
            from,
            &Message::HelloReply { request_id: msg.request_id(), extensions: 0, name: "directory".into() },
        )
        .await;
    register.await.unwrap().unwrap();

    let connect = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        async move { orchestrator.connect("bob").await }
    });

    // The directory's session engine forwards the stuck address; answer with
    // the working one.
    let (nat_request, _, nat_from) = directory.recv().await;
    directory
        .send(
            nat_from,
            &Message::NatTraversal { request_id: nat_request.request_id(), addr: relayed.addr() },
        )
        .await;

    // The fresh session says Hello to `relayed`, not `unreachable`.
    let (hello, _, relayed_from) = relayed.recv().await;
    assert!(matches!(hello, Message::Hello { .. }));
    relayed
        .send(
            relayed_from,
            &Message::HelloReply { request_id: hello.request_id(), extensions: 0, name: "bob".into() },
        )
        .await;

    let (pubkey, _, _) = relayed.recv().await;
    relayed
        .send(relayed_from, &Message::PublicKeyReply { request_id: pubkey.request_id(), key: None })
        .await;

    let (root, _, _) = relayed.recv().await;
    relayed
        .send(
            relayed_from,
            &Message::RootReply { request_id: root.request_id(), hash: [0u8; HASH_LEN] },
        )
        .await;

    connect.await.unwrap().unwrap();

    // A download issued after connect() lands on the relayed peer: the
    // stale, disconnected session toward `unreachable` was not kept around.
    let download = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        async move { orchestrator.download(Some("bob"), [0xABu8; HASH_LEN], std::path::Path::new("/tmp/nope")).await }
    });
    let (get_datum, _, get_from) = relayed.recv().await;
    assert!(matches!(get_datum, Message::GetDatum { hash, .. } if hash == [0xABu8; HASH_LEN]));
    relayed
        .send(get_from, &Message::NoDatum { request_id: get_datum.request_id(), hash: [0xABu8; HASH_LEN] })
        .await;
    assert!(download.await.unwrap().is_err(), "NoDatum should surface as an error, but via the relayed session");
}
