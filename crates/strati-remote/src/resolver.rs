//! Resolving image references into blob fetchers.
//!
//! The resolver turns `(registry hosts, refspec, descriptor)` into a working
//! [`HttpFetcher`] plus the blob size: candidate blob URLs are derived from
//! the host list, each is probed with a zero-length range request, and the
//! first reachable one wins. Mirrors are listed before the reference's own
//! registry and are tried in order.

use crate::blob::{Blob, BlobConfig};
use crate::cache::BlobCache;
use crate::error::{RemoteError, Result};
use crate::fetcher::{
    build_client, redact_url, required_content_range, whole_body_len, HttpFetcher, HttpsClient,
};
use hyper::header::RANGE;
use hyper::{Body, Method, Request, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// A parsed image reference, e.g. `ghcr.io/org/app:v1` or
/// `registry.test/org/app@sha256:…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refspec {
    /// Registry hostname, with port if any.
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag or digest the reference points at.
    pub reference: String,
}

impl Refspec {
    /// Parse a raw image reference.
    ///
    /// Single-component names resolve to Docker Hub official images
    /// (`alpine` means `registry-1.docker.io/library/alpine:latest`); a first
    /// component containing a dot, a colon or `localhost` names a registry.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RemoteError::Resolve("empty image reference".to_string()));
        }

        let (name, reference) = if let Some(at) = raw.find('@') {
            (&raw[..at], raw[at + 1..].to_string())
        } else if let Some(colon) = raw.rfind(':') {
            // A tag colon always comes after the last '/'; otherwise the
            // colon belongs to a registry port.
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon > after_last_slash {
                (&raw[..colon], raw[colon + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        let (registry, repository) = match name.find('/') {
            Some(slash) => {
                let first = &name[..slash];
                if first.contains('.') || first.contains(':') || first == "localhost" {
                    (first.to_string(), name[slash + 1..].to_string())
                } else {
                    (DOCKER_HUB_REGISTRY.to_string(), name.to_string())
                }
            }
            None => (DOCKER_HUB_REGISTRY.to_string(), format!("library/{name}")),
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(RemoteError::Resolve(format!(
                "invalid image reference {raw:?}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

/// An OCI content descriptor, as found in image manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    /// Blob size in bytes; zero means unknown and the size is taken from the
    /// registry instead.
    #[serde(default)]
    pub size: u64,
}

impl Descriptor {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| RemoteError::Resolve(format!("invalid descriptor: {err}")))
    }
}

/// One registry endpoint blobs may be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryHost {
    /// Hostname, with port if any.
    pub host: String,
    /// Force plain HTTP. Loopback hosts get HTTP regardless.
    pub insecure: bool,
}

impl RegistryHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            insecure: false,
        }
    }

    pub fn insecure(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            insecure: true,
        }
    }

    fn scheme(&self) -> &'static str {
        let name = self.host.split(':').next().unwrap_or(&self.host);
        if self.insecure || name == "localhost" || name == "127.0.0.1" || name == "::1" {
            "http"
        } else {
            "https"
        }
    }
}

/// Builds blob fetchers and blobs. One resolver outlives every blob it
/// creates; blobs keep a handle for refreshes.
#[derive(Clone)]
pub struct Resolver {
    client: HttpsClient,
    config: BlobConfig,
}

impl Resolver {
    pub fn new(config: BlobConfig) -> Self {
        Self::with_client(build_client(), config)
    }

    /// Share an existing HTTP client, e.g. with the manifest-fetching layer.
    pub fn with_client(client: HttpsClient, config: BlobConfig) -> Self {
        Self { client, config }
    }

    /// Resolve a blob and wrap it with a cache into a ready [`Blob`].
    pub async fn resolve_blob(
        &self,
        hosts: &[RegistryHost],
        refspec: &Refspec,
        desc: &Descriptor,
        cache: Arc<dyn BlobCache>,
    ) -> Result<Blob> {
        let (fetcher, size) = self.resolve_fetcher(hosts, refspec, desc).await?;
        Blob::new(fetcher, size, cache, self.clone(), self.config.clone())
    }

    /// Probe candidate hosts in order and build a fetcher over the first one
    /// that answers range requests for this blob.
    pub async fn resolve_fetcher(
        &self,
        hosts: &[RegistryHost],
        refspec: &Refspec,
        desc: &Descriptor,
    ) -> Result<(HttpFetcher, u64)> {
        validate_digest(&desc.digest)?;

        let own_registry = [RegistryHost::new(&refspec.registry)];
        let hosts: &[RegistryHost] = if hosts.is_empty() { &own_registry } else { hosts };

        let mut candidates = Vec::with_capacity(hosts.len());
        for host in hosts {
            candidates.push(blob_url(host, refspec, &desc.digest)?);
        }

        let mut last_err = RemoteError::Resolve("no registry hosts".to_string());
        for url in &candidates {
            match self.probe(url).await {
                Ok(probed) => {
                    if desc.size > 0 && probed != desc.size {
                        return Err(RemoteError::Resolve(format!(
                            "blob size mismatch: registry reports {probed}, descriptor says {}",
                            desc.size
                        )));
                    }
                    let size = if desc.size > 0 { desc.size } else { probed };
                    debug!(url = %redact_url(url), size, "resolved blob fetcher");
                    let fetcher = HttpFetcher::with_candidates(
                        self.client.clone(),
                        url.clone(),
                        candidates.clone(),
                        desc.digest.clone(),
                    );
                    return Ok((fetcher, size));
                }
                Err(err) => {
                    debug!(
                        url = %redact_url(url),
                        error = %err,
                        "blob probe failed; trying next host"
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Zero-length range probe; returns the blob size the server reports.
    async fn probe(&self, url: &Url) -> Result<u64> {
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|_| RemoteError::Transport(format!("invalid URI: {}", redact_url(url))))?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(RANGE, "bytes=0-0")
            .body(Body::empty())
            .expect("valid request");
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                let cr = required_content_range(resp.headers())?;
                cr.total.ok_or_else(|| {
                    RemoteError::MalformedResponse(
                        "server did not report a complete length".to_string(),
                    )
                })
            }
            // Range not honored; the response is the whole blob.
            StatusCode::OK => whole_body_len(resp.headers()),
            status => Err(RemoteError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }
}

fn blob_url(host: &RegistryHost, refspec: &Refspec, digest: &str) -> Result<Url> {
    let url = format!(
        "{}://{}/v2/{}/blobs/{}",
        host.scheme(),
        host.host,
        refspec.repository,
        digest
    );
    Url::parse(&url).map_err(|err| RemoteError::Resolve(format!("invalid blob URL {url:?}: {err}")))
}

fn validate_digest(digest: &str) -> Result<()> {
    let invalid = || RemoteError::Resolve(format!("invalid digest {digest:?}"));
    let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
    if algorithm.is_empty()
        || !algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return Err(invalid());
    }
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    if algorithm == "sha256" && hex.len() != 64 {
        return Err(invalid());
    }
    Ok(())
}
