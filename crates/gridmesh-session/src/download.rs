//! Recursive verified download of a subtree by root hash, driving a
//! [`SessionEngine`] in Established state. Sequential per session: one
//! outstanding `GetDatum` at a time, matching the engine's single-waiter
//! correlation table.

use std::future::Future;
use std::pin::Pin;

use gridmesh_core::merkle::{self, DirEntry, Node};
use gridmesh_core::wire::{DatumKind, HASH_LEN};
use gridmesh_core::Message;

use crate::engine::SessionEngine;
use crate::errors::SessionError;

type BoxedDownload<'a> = Pin<Box<dyn Future<Output = Result<Node, SessionError>> + Send + 'a>>;

/// Fetches and fully verifies the subtree rooted at `hash`.
///
/// Every level is checked twice: the reply's embedded hash field must
/// match the hash that was requested (a protocol violation otherwise, per
/// spec §4.4 step 5), and the node reconstructed from the reply body must
/// recompute to that same hash (the content-integrity check, §8 scenario
/// 4). Either failure sends an `ErrorReply` back to the peer and aborts
/// the whole download with the first error encountered.
///
/// Async fns can't recurse directly, so this wraps its body in a boxed
/// future rather than pulling in a recursion-helper crate for one call
/// site.
pub fn download_node(engine: &SessionEngine, hash: [u8; HASH_LEN]) -> BoxedDownload<'_> {
    Box::pin(async move {
        let (reply, _signature) = engine.get_datum(hash).await?;
        let request_id = reply.request_id();

        let (reply_hash, kind, body) = match reply {
            Message::NoDatum { hash: reply_hash, .. } => {
                if reply_hash != hash {
                    engine.send_error_reply(request_id, "GetDatum reply hash field mismatch").await;
                    return Err(SessionError::ReplyHashMismatch);
                }
                return Err(SessionError::NotFound);
            }
            Message::Datum { hash: reply_hash, kind, body, .. } => (reply_hash, kind, body),
            Message::ErrorReply { reason, .. } => return Err(SessionError::PeerError(reason)),
            other => {
                return Err(SessionError::PeerError(format!(
                    "unexpected reply to GetDatum: {other:?}"
                )))
            }
        };

        if reply_hash != hash {
            engine.send_error_reply(request_id, "GetDatum reply hash field mismatch").await;
            return Err(SessionError::ReplyHashMismatch);
        }

        let node = match kind {
            DatumKind::Chunk => {
                let node = Node::chunk(body)?;
                if node.hash != hash {
                    return Err(SessionError::ChunkHashMismatch);
                }
                node
            }
            DatumKind::InternalNode => {
                let child_hashes = merkle::parse_internal_children(&body)?;
                let mut children = Vec::with_capacity(child_hashes.len());
                for child_hash in child_hashes {
                    children.push(download_node(engine, child_hash).await?);
                }
                let node = Node::internal(children)?;
                if node.hash != hash {
                    return Err(SessionError::TreeHashMismatch);
                }
                node
            }
            DatumKind::Directory => {
                let named_hashes = merkle::parse_directory_entries(&body)?;
                let mut entries = Vec::with_capacity(named_hashes.len());
                for (name, child_hash) in named_hashes {
                    let child = download_node(engine, child_hash).await?;
                    entries.push(DirEntry { name, child });
                }
                let node = Node::directory(entries)?;
                if node.hash != hash {
                    return Err(SessionError::DirectoryHashMismatch);
                }
                node
            }
        };

        Ok(node)
    })
}
