//! On-disk PEM key file I/O.
//!
//! The file *shape* (PEM-wrapped PKCS8, one path for the private key) is an
//! external-collaborator concern per spec §1 — the core only needs to
//! produce/consume the PEM bytes, which `gridmesh_core::crypto::Keypair`
//! already does. This module is the thin glue the binary needs to turn that
//! into `generateKey`/`importKey`/`exportKey`.

use std::path::Path;

use anyhow::{Context, Result};
use gridmesh_core::crypto::Keypair;

pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    if path.exists() {
        load(path)
    } else {
        generate_and_save(path)
    }
}

pub fn load(path: &Path) -> Result<Keypair> {
    let pem = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Keypair::from_pkcs8_pem(&pem)?)
}

pub fn generate_and_save(path: &Path) -> Result<Keypair> {
    let kp = Keypair::generate();
    save(&kp, path)?;
    Ok(kp)
}

pub fn save(kp: &Keypair, path: &Path) -> Result<()> {
    let pem = kp.to_pkcs8_pem()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, pem.as_bytes()).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
