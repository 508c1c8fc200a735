//! The Hello/PublicKey/Root handshake driven over real loopback UDP
//! sockets between two `SessionEngine`s, plus the "say hello first"
//! precondition.

use std::sync::Arc;

use gridmesh_core::wire::HASH_LEN;
use gridmesh_session::{HandshakeState, SessionEngine, SessionError, SessionTiming};

#[tokio::test]
async fn two_engines_complete_the_handshake_and_reach_established() {
    let a_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a_socket.local_addr().unwrap();
    let b_addr = b_socket.local_addr().unwrap();
    drop(a_socket);
    drop(b_socket);

    let a = SessionEngine::connect(b_addr, None, "alice".into(), None, None, None, SessionTiming::default())
        .await
        .unwrap();
    let b = SessionEngine::connect(a_addr, None, "bob".into(), None, None, None, SessionTiming::default())
        .await
        .unwrap();
    Arc::clone(&a).spawn_read_loop();
    Arc::clone(&b).spawn_read_loop();

    a.hello().await.unwrap();
    assert_eq!(a.state().await, HandshakeState::HelloDone);

    a.exchange_public_key().await.unwrap();
    assert_eq!(a.state().await, HandshakeState::PubkeyDone);
    assert!(a.peer_public_key().await.is_none(), "bob has no identity key configured");

    a.exchange_root([0u8; HASH_LEN]).await.unwrap();
    assert_eq!(a.state().await, HandshakeState::Established);
    assert_eq!(a.peer_root().await, Some([0u8; HASH_LEN]));
}

#[tokio::test]
async fn get_datum_before_hello_is_rejected_with_please_say_hello_first() {
    let a_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a_socket.local_addr().unwrap();
    let b_addr = b_socket.local_addr().unwrap();
    drop(a_socket);
    drop(b_socket);

    let a = SessionEngine::connect(b_addr, None, "alice".into(), None, None, None, SessionTiming::default())
        .await
        .unwrap();
    let b = SessionEngine::connect(a_addr, None, "bob".into(), None, None, None, SessionTiming::default())
        .await
        .unwrap();
    Arc::clone(&a).spawn_read_loop();
    Arc::clone(&b).spawn_read_loop();

    let err = a.get_datum([0u8; HASH_LEN]).await.unwrap_err();
    match err {
        SessionError::PeerError(reason) => assert_eq!(reason, "Please say hello first"),
        other => panic!("expected a peer-rejected precondition error, got {other:?}"),
    }
}
