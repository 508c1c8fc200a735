//! Line-oriented command dispatcher — produces the CLI contract spec §6
//! requires (`register`, `list`, `getAddresses`, `getKey`, `getRootHash`,
//! `generateKey`, `importKey`, `exportKey`, `connect <name>`, `disconnect`,
//! `download <hash-hex>`, `signature on/off`, `debug on/off`, `exit`), but
//! as a stdin read loop rather than `summit-ctl`'s one-shot-per-process
//! argv dispatch — gridmesh is a single long-lived process, not a
//! daemon+API-client split, so the "foreground driver" from §5 is an async
//! command loop instead.
//!
//! Not a full REPL: no history, no completion, no interactive prompts for
//! missing arguments. Those are explicitly out of core scope (§1).

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::reload;

use crate::Orchestrator;

pub type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

enum Control {
    Continue,
    Exit,
}

pub async fn run(orchestrator: Arc<Orchestrator>, filter_handle: FilterHandle) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            prompt();
            continue;
        }
        match dispatch(&orchestrator, &filter_handle, &words).await {
            Ok(Control::Continue) => {}
            Ok(Control::Exit) => break,
            Err(e) => println!("error: {e:#}"),
        }
        prompt();
    }
    orchestrator.disconnect_all().await;
    Ok(())
}

fn prompt() {
    use std::io::Write;
    print!("gridmesh> ");
    let _ = std::io::stdout().flush();
}

async fn dispatch(o: &Orchestrator, filter_handle: &FilterHandle, words: &[&str]) -> Result<Control> {
    match words {
        ["register"] => {
            o.register().await?;
            println!("registered as {}", o.name());
        }
        ["list"] => {
            for peer in o.list_peers().await? {
                println!("{peer}");
            }
        }
        ["getAddresses", name] => match o.get_addresses(name).await? {
            Some(addrs) => addrs.iter().for_each(|a| println!("{a}")),
            None => println!("(no addresses on file for {name})"),
        },
        ["getKey", name] => match o.get_key(name).await? {
            Some(key) => println!("{}", hex::encode(key)),
            None => println!("(no key on file for {name})"),
        },
        ["getRootHash", name] => match o.get_root_hash(name).await? {
            Some(root) => println!("{}", hex::encode(root)),
            None => println!("(no root hash on file for {name})"),
        },
        ["generateKey"] => {
            o.generate_key().await?;
            println!("generated a new keypair");
        }
        ["importKey", path] => {
            o.import_key(Path::new(path)).await?;
            println!("imported keypair from {path}");
        }
        ["exportKey", path] => {
            o.export_key(Path::new(path)).await?;
            println!("exported keypair to {path}");
        }
        ["connect", name] => {
            o.connect(name).await?;
            println!("connected to {name}");
        }
        ["disconnect"] => {
            o.disconnect_current().await?;
            println!("disconnected");
        }
        ["disconnect", name] => {
            o.disconnect(name).await?;
            println!("disconnected from {name}");
        }
        ["download", hash_hex] => download(o, None, hash_hex).await?,
        ["download", hash_hex, "from", name] => download(o, Some(*name), hash_hex).await?,
        ["signature", "on"] => {
            o.set_signing_enabled(true).await;
            println!("outbound signing enabled");
        }
        ["signature", "off"] => {
            o.set_signing_enabled(false).await;
            println!("outbound signing disabled");
        }
        ["debug", "on"] => {
            set_filter(filter_handle, "debug")?;
            println!("debug logging on");
        }
        ["debug", "off"] => {
            set_filter(filter_handle, "info")?;
            println!("debug logging off");
        }
        ["exit"] => return Ok(Control::Exit),
        other => println!("unknown command: {}", other.join(" ")),
    }
    Ok(Control::Continue)
}

async fn download(o: &Orchestrator, peer: Option<&str>, hash_hex: &str) -> Result<()> {
    let bytes = hex::decode(hash_hex).map_err(|_| anyhow!("{hash_hex:?} is not valid hex"))?;
    let hash: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("hash must be exactly 32 bytes (64 hex characters)"))?;
    let dest = Path::new(hash_hex);
    o.download(peer, hash, dest).await?;
    println!("wrote {}", dest.display());
    Ok(())
}

fn set_filter(handle: &FilterHandle, directive: &str) -> Result<()> {
    handle
        .reload(EnvFilter::new(directive))
        .map_err(|e| anyhow!("failed to reload log filter: {e}"))
}
