//! `DirectoryClient` against a hand-rolled HTTP/1.1 stub (§4.5's four
//! lookups): plain-text peer lists, raw-binary key/root blobs, and the
//! 404/204-means-absent convention.

use gridmesh_directory::DirectoryClient;

use crate::support::{spawn_http_stub, StubRoute};

#[tokio::test]
async fn list_peers_splits_newline_separated_names() {
    let addr = spawn_http_stub(vec![StubRoute::ok("/peers", "alice\nbob\ncarol\n")]).await;
    let client = DirectoryClient::new(format!("http://{addr}"));
    let peers = client.list_peers().await.unwrap();
    assert_eq!(peers, vec!["alice", "bob", "carol"]);
}

#[tokio::test]
async fn peer_addresses_splits_host_port_lines() {
    let addr =
        spawn_http_stub(vec![StubRoute::ok("/peers/alice/addresses", "10.0.0.1:9000\n10.0.0.2:9000\n")])
            .await;
    let client = DirectoryClient::new(format!("http://{addr}"));
    let addrs = client.peer_addresses("alice").await.unwrap().unwrap();
    assert_eq!(addrs, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
}

#[tokio::test]
async fn peer_addresses_is_none_for_unknown_peer() {
    let addr = spawn_http_stub(vec![StubRoute::not_found("/peers/ghost/addresses")]).await;
    let client = DirectoryClient::new(format!("http://{addr}"));
    assert!(client.peer_addresses("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn peer_key_returns_the_raw_64_bytes() {
    let key = vec![0x07u8; 64];
    let addr = spawn_http_stub(vec![StubRoute::ok("/peers/alice/key", key.clone())]).await;
    let client = DirectoryClient::new(format!("http://{addr}"));
    assert_eq!(client.peer_key("alice").await.unwrap(), Some(key));
}

#[tokio::test]
async fn peer_key_is_none_when_peer_has_not_published_one() {
    let no_content = StubRoute { path: "/peers/alice/key", status: 204, body: Vec::new() };
    let addr = spawn_http_stub(vec![no_content]).await;
    let client = DirectoryClient::new(format!("http://{addr}"));
    assert!(client.peer_key("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn peer_root_returns_the_raw_32_bytes() {
    let root = vec![0x09u8; 32];
    let addr = spawn_http_stub(vec![StubRoute::ok("/peers/alice/root", root.clone())]).await;
    let client = DirectoryClient::new(format!("http://{addr}"));
    assert_eq!(client.peer_root("alice").await.unwrap(), Some(root));
}
