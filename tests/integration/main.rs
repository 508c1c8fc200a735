//! Integration test entry point. One binary, one module per concern —
//! `support` holds the fake-peer/fake-directory harness every other module
//! drives against real loopback UDP sockets (there is no mock-HTTP crate
//! anywhere in this stack, so the directory lookups are exercised against a
//! hand-rolled TCP stub instead).


mod directory_client;
mod download;
mod merkle_boundaries;
mod nat_traversal;
mod registration;
mod session_handshake;
