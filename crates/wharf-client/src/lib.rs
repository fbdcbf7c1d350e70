//! # Wharf Client
//!
//! An implementation of the wharf registry interface that speaks the OCI
//! distribution protocol to a remote registry over HTTP: wire requests are
//! constructed from the typed taxonomy in [`wharf_core::wire`], authorized
//! by [`wharf_auth::Authenticator`], and responses are verified against
//! their descriptors on the way back.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, EXPECT};
use reqwest::{Response, Url};

use wharf_auth::config::{Anonymous, CredentialSource};
use wharf_auth::scope::{ResourceScope, Scope};
use wharf_auth::Authenticator;
use wharf_core::model::media_type;
use wharf_core::registry::{
    Blob, BlobWriter, ByteStream, EntryStream, RegistryDeleter, RegistryLister, RegistryReader,
    RegistryWriter,
};
use wharf_core::reference::is_valid_host;
use wharf_core::wire;
use wharf_core::{Descriptor, DistributionErrorCode, Error, OciDigest, Result};

mod blobs;
mod errors;
mod list;
mod manifests;
mod upload;

pub(crate) use errors::{error_from_response, transport};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Configuration for [`RemoteRegistry`].
pub struct ClientConfig {
    /// Where per-host credentials come from. Defaults to anonymous access;
    /// use [`wharf_auth::DockerConfig::load`] for docker-style lookup.
    pub credentials: Arc<dyn CredentialSource>,
    /// Speak plain HTTP instead of HTTPS. For registries on localhost and
    /// tests only.
    pub insecure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: Arc::new(Anonymous),
            insecure: false,
        }
    }
}

/// A remote OCI registry reached over the distribution protocol.
#[derive(Clone)]
pub struct RemoteRegistry {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) base: Url,
    pub(crate) http: reqwest::Client,
    pub(crate) auth: Authenticator,
}

impl RemoteRegistry {
    /// Connect to the registry at `host` (`registry.example.com`,
    /// `localhost:5000`, ...). No request is issued until an operation runs.
    pub fn new(host: &str, config: ClientConfig) -> Result<Self> {
        if !is_valid_host(host) {
            return Err(Error::InvalidReference(format!(
                "invalid registry host: {host:?}"
            )));
        }
        let scheme = if config.insecure { "http" } else { "https" };
        let base = Url::parse(&format!("{scheme}://{host}/"))
            .map_err(|e| Error::InvalidReference(format!("invalid registry host {host:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(transport)?;
        let auth = Authenticator::new(http.clone(), config.credentials);
        Ok(Self {
            inner: Arc::new(ClientInner { base, http, auth }),
        })
    }

    /// `GET /v2/` — check that the remote side speaks the distribution API.
    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .inner
            .send(&wire::Request::Ping, &Scope::empty(), None, &[])
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(resp, DistributionErrorCode::Unknown).await)
        }
    }
}

impl ClientInner {
    pub(crate) async fn send(
        &self,
        req: &wire::Request,
        scope: &Scope,
        body: Option<Bytes>,
        headers: &[(HeaderName, String)],
    ) -> Result<Response> {
        let url = self
            .base
            .join(&req.target())
            .map_err(|e| Error::InvalidReference(e.to_string()))?;
        self.send_url(req.method(), url, scope, body, headers).await
    }

    pub(crate) async fn send_url(
        &self,
        method: http::Method,
        url: Url,
        scope: &Scope,
        body: Option<Bytes>,
        headers: &[(HeaderName, String)],
    ) -> Result<Response> {
        let mut builder = self.http.request(method, url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            // bodies go out with Expect so an auth retry never consumes an
            // unrepeatable stream mid-flight
            builder = builder.header(EXPECT, "100-continue").body(body);
        }
        let request = builder.build().map_err(transport)?;
        tracing::trace!(method = %request.method(), url = %request.url(), "registry request");
        self.auth
            .execute(request, scope)
            .await
            .map_err(wharf_core::Error::from)
    }

    /// Resolve a `Location` header against the URL that produced it.
    pub(crate) fn location_of(&self, resp: &Response) -> Result<String> {
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::coded_message(
                    DistributionErrorCode::Unknown,
                    format!("{} response is missing a Location header", resp.url()),
                )
            })?;
        let resolved = resp
            .url()
            .join(location)
            .map_err(|e| Error::InvalidReference(format!("bad Location {location:?}: {e}")))?;
        Ok(resolved.to_string())
    }
}

/// Append a digest query parameter without touching existing parameters.
pub(crate) fn location_with_digest(location: &str, digest: &OciDigest) -> String {
    if location.contains('?') {
        format!("{location}&digest={digest}")
    } else {
        format!("{location}?digest={digest}")
    }
}

pub(crate) fn pull_scope(repo: &str) -> Scope {
    Scope::from_scopes([ResourceScope::repository(repo, "pull")])
}

pub(crate) fn push_scope(repo: &str) -> Scope {
    Scope::from_scopes([
        ResourceScope::repository(repo, "pull"),
        ResourceScope::repository(repo, "push"),
    ])
}

pub(crate) fn delete_scope(repo: &str) -> Scope {
    Scope::from_scopes([ResourceScope::repository(repo, "delete")])
}

pub(crate) fn catalog_scope() -> Scope {
    Scope::from_scopes([ResourceScope::new("registry", "catalog", "*")])
}

/// Digest reported by the server, when present and well-formed enough to
/// trust. A malformed value is an error, not a silent fallback.
pub(crate) fn header_digest(resp: &Response) -> Result<Option<OciDigest>> {
    match resp.headers().get(DOCKER_CONTENT_DIGEST) {
        None => Ok(None),
        Some(v) => {
            let s = v.to_str().map_err(|_| {
                Error::InvalidDigest("unreadable Docker-Content-Digest header".to_string())
            })?;
            Ok(Some(OciDigest::try_from(s)?))
        }
    }
}

pub(crate) fn header_content_length(resp: &Response) -> Result<u64> {
    resp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            Error::coded_message(
                DistributionErrorCode::SizeInvalid,
                format!("{} response is missing a usable Content-Length", resp.url()),
            )
        })
}

pub(crate) fn header_content_type(resp: &Response) -> String {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(media_type::OCTET_STREAM)
        .to_string()
}

/// Build the descriptor carried by read responses from
/// `Docker-Content-Digest`, `Content-Type`, and `Content-Length`, falling
/// back to the digest the caller asked for.
pub(crate) fn descriptor_from_response(
    resp: &Response,
    requested: Option<&OciDigest>,
) -> Result<Descriptor> {
    let digest = match header_digest(resp)? {
        Some(d) => d,
        None => requested
            .cloned()
            .ok_or_else(|| {
                Error::coded_message(
                    DistributionErrorCode::DigestInvalid,
                    format!("{} response carries no content digest", resp.url()),
                )
            })?,
    };
    Ok(Descriptor::new(
        header_content_type(resp),
        header_content_length(resp)?,
        digest,
    ))
}

/// The response body as a [`ByteStream`].
pub(crate) fn body_stream(resp: Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(transport)))
}

#[async_trait]
impl RegistryReader for RemoteRegistry {
    async fn get_blob(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.get_blob_impl(repo, digest).await
    }

    async fn get_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.get_manifest_impl(repo, digest).await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<Blob> {
        self.get_tag_impl(repo, tag).await
    }

    async fn resolve_blob(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.resolve_blob_impl(repo, digest).await
    }

    async fn resolve_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.resolve_manifest_impl(repo, digest).await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        self.resolve_tag_impl(repo, tag).await
    }
}

#[async_trait]
impl RegistryWriter for RemoteRegistry {
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        content: ByteStream,
    ) -> Result<Descriptor> {
        self.push_blob_impl(repo, descriptor, content).await
    }

    async fn push_blob_chunked(
        &self,
        repo: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        self.push_blob_chunked_impl(repo, chunk_size).await
    }

    async fn resume_blob_chunked(
        &self,
        repo: &str,
        session_id: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        self.resume_blob_chunked_impl(repo, session_id, chunk_size)
            .await
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        self.mount_blob_impl(from_repo, to_repo, digest).await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        self.push_manifest_impl(repo, tag, contents, media_type).await
    }
}

#[async_trait]
impl RegistryDeleter for RemoteRegistry {
    async fn delete_blob(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        self.delete_blob_impl(repo, digest).await
    }

    async fn delete_manifest(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        self.delete_manifest_impl(repo, digest).await
    }

    async fn delete_tag(&self, _repo: &str, _tag: &str) -> Result<()> {
        // the distribution protocol has no tag-only delete; manifest
        // deletion via digest is the closest operation
        Err(Error::unsupported("delete tag"))
    }
}

impl RegistryLister for RemoteRegistry {
    fn repositories(&self, start_after: Option<String>) -> EntryStream<String> {
        self.repositories_impl(start_after)
    }

    fn tags(&self, repo: &str, start_after: Option<String>) -> EntryStream<String> {
        self.tags_impl(repo, start_after)
    }

    fn referrers(
        &self,
        repo: &str,
        digest: &OciDigest,
        artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        self.referrers_impl(repo, digest, artifact_type)
    }
}
