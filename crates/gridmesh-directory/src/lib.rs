//! HTTP(S) client for the gridmesh peer directory.
//!
//! Four read-only lookups, each a thin wrapper around one GET request —
//! shaped after `summit-ctl`'s "one function per endpoint, `anyhow::Context`
//! on failure" helpers, but returning raw bytes/text rather than JSON: the
//! directory's responses are plain newline-separated lists and raw binary
//! blobs, not a JSON API.
//!
//! TLS certificate verification is disabled: the directory is an untrusted
//! discovery service, and peer authenticity is established by ECDSA
//! signatures over the P2P protocol, not by the transport's certificate
//! chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, #[source] source: reqwest::Error },
    #[error("response body from {url} was not valid UTF-8")]
    NotUtf8 { url: String },
    #[error("{url} returned an unexpected status {status}")]
    UnexpectedStatus { url: String, status: reqwest::StatusCode },
}

/// A client bound to one directory server's base URL.
pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .expect("reqwest::Client::builder with no exotic options never fails to build");
        DirectoryClient { http, base_url: base_url.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// `GET /peers` — every peer name currently registered, one per line.
    pub async fn list_peers(&self) -> Result<Vec<String>, DirectoryError> {
        let url = self.url("/peers");
        let text = self.get_text(&url).await?;
        Ok(split_nonempty_lines(&text))
    }

    /// `GET /peers/{name}/addresses` — the peer's known socket addresses,
    /// one per line. `None` if the peer is unknown (404).
    pub async fn peer_addresses(&self, name: &str) -> Result<Option<Vec<String>>, DirectoryError> {
        let url = self.url(&format!("/peers/{name}/addresses"));
        match self.get_bytes_optional(&url).await? {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| DirectoryError::NotUtf8 { url })?;
                Ok(Some(split_nonempty_lines(&text)))
            }
        }
    }

    /// `GET /peers/{name}/key` — the peer's raw 64-byte public key.
    /// `None` if the peer is unknown (404) or has not published a key (204).
    pub async fn peer_key(&self, name: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        let url = self.url(&format!("/peers/{name}/key"));
        self.get_bytes_optional(&url).await
    }

    /// `GET /peers/{name}/root` — the peer's raw 32-byte Merkle root hash.
    /// `None` if the peer is unknown (404) or has not published a root (204).
    pub async fn peer_root(&self, name: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        let url = self.url(&format!("/peers/{name}/root"));
        self.get_bytes_optional(&url).await
    }

    async fn get_text(&self, url: &str) -> Result<String, DirectoryError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| DirectoryError::Request { url: url.to_string(), source })?;
        resp.text()
            .await
            .map_err(|source| DirectoryError::Request { url: url.to_string(), source })
    }

    /// GETs `url`, treating 404 and 204 as "absent" rather than errors —
    /// the shape every peer/{name}/* lookup shares.
    async fn get_bytes_optional(&self, url: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| DirectoryError::Request { url: url.to_string(), source })?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|source| DirectoryError::Request { url: url.to_string(), source })?;
                Ok(Some(bytes.to_vec()))
            }
            status => Err(DirectoryError::UnexpectedStatus { url: url.to_string(), status }),
        }
    }
}

fn split_nonempty_lines(text: &str) -> Vec<String> {
    text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
}
