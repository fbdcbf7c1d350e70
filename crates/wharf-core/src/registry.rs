//! # Registry Abstractions
//!
//! The interoperability layer between registry implementations and their
//! consumers. A registry is anything that stores blobs, manifests, and tags
//! for a set of repositories; implementations in this workspace include the
//! remote HTTP client, the in-memory store, and the composing adapters, and
//! the HTTP server exposes any of them over the distribution API.
//!
//! Capabilities are split across four traits — [`RegistryReader`],
//! [`RegistryWriter`], [`RegistryDeleter`], [`RegistryLister`] — each method
//! of which carries a default body returning an `UNSUPPORTED` registry
//! error. A partial implementation overrides only the methods it supports;
//! [`Registry`] is blanket-implemented for anything implementing all four.

use core::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use futures_core::Stream;

use crate::model::Descriptor;
use crate::{Error, OciDigest, Result};

/// A streaming byte payload. The terminal state of the stream is either
/// exhaustion (success) or a final `Err` item.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>;

/// A single-pass listing. Errors surface as a terminal `Err` item; the
/// stream must not be polled further after yielding one.
pub type EntryStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'static>>;

/// A blob or manifest read: the descriptor plus the streamed content.
pub struct Blob {
    pub descriptor: Descriptor,
    pub content: ByteStream,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("descriptor", &self.descriptor)
            .field("content", &"<stream>")
            .finish()
    }
}

impl Blob {
    pub fn from_bytes(descriptor: Descriptor, content: Bytes) -> Self {
        Self {
            descriptor,
            content: Box::pin(stream::once(async move { Ok(content) })),
        }
    }

    /// Drain the content stream into memory.
    pub async fn collect(self) -> Result<Bytes> {
        collect_stream(self.content).await
    }
}

/// Drain a byte stream into a single buffer.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// A byte stream over an in-memory buffer.
pub fn byte_stream(content: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(content) }))
}

/// A listing over an already-materialized set of entries.
pub fn entry_stream<T: Send + 'static>(entries: Vec<T>) -> EntryStream<T> {
    Box::pin(stream::iter(entries.into_iter().map(Ok)))
}

/// A listing that yields a single terminal error.
pub fn error_stream<T: Send + 'static>(err: Error) -> EntryStream<T> {
    Box::pin(stream::once(async move { Err(err) }))
}

/// Drain a listing into memory, surfacing its terminal error.
pub async fn collect_entries<T>(mut entries: EntryStream<T>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(entry) = entries.next().await {
        out.push(entry?);
    }
    Ok(out)
}

/// Read access to blobs, manifests, and tags.
#[async_trait]
pub trait RegistryReader: Send + Sync {
    async fn get_blob(&self, _repo: &str, _digest: &OciDigest) -> Result<Blob> {
        Err(Error::unsupported("get blob"))
    }

    async fn get_manifest(&self, _repo: &str, _digest: &OciDigest) -> Result<Blob> {
        Err(Error::unsupported("get manifest"))
    }

    async fn get_tag(&self, _repo: &str, _tag: &str) -> Result<Blob> {
        Err(Error::unsupported("get tag"))
    }

    async fn resolve_blob(&self, _repo: &str, _digest: &OciDigest) -> Result<Descriptor> {
        Err(Error::unsupported("resolve blob"))
    }

    async fn resolve_manifest(&self, _repo: &str, _digest: &OciDigest) -> Result<Descriptor> {
        Err(Error::unsupported("resolve manifest"))
    }

    async fn resolve_tag(&self, _repo: &str, _tag: &str) -> Result<Descriptor> {
        Err(Error::unsupported("resolve tag"))
    }
}

/// Write access to blobs and manifests.
#[async_trait]
pub trait RegistryWriter: Send + Sync {
    /// Push a blob monolithically. The descriptor's digest and size must
    /// match the content; the returned descriptor is canonical.
    async fn push_blob(
        &self,
        _repo: &str,
        _descriptor: &Descriptor,
        _content: ByteStream,
    ) -> Result<Descriptor> {
        Err(Error::unsupported("push blob"))
    }

    /// Begin a chunked blob upload. `chunk_size` is a lower bound the
    /// implementation may raise.
    async fn push_blob_chunked(
        &self,
        _repo: &str,
        _chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        Err(Error::unsupported("push blob chunked"))
    }

    /// Resume a chunked upload from the opaque id of a closed
    /// [`BlobWriter`].
    async fn resume_blob_chunked(
        &self,
        _repo: &str,
        _session_id: &str,
        _chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        Err(Error::unsupported("resume blob chunked"))
    }

    /// Reuse a blob that already exists in `from_repo` without re-uploading
    /// its content.
    async fn mount_blob(
        &self,
        _from_repo: &str,
        _to_repo: &str,
        _digest: &OciDigest,
    ) -> Result<Descriptor> {
        Err(Error::unsupported("mount blob"))
    }

    /// Push manifest content, optionally binding a tag to it.
    async fn push_manifest(
        &self,
        _repo: &str,
        _tag: Option<&str>,
        _contents: Bytes,
        _media_type: &str,
    ) -> Result<Descriptor> {
        Err(Error::unsupported("push manifest"))
    }
}

/// Deletion of blobs, manifests, and tags. Optional on most registries.
#[async_trait]
pub trait RegistryDeleter: Send + Sync {
    async fn delete_blob(&self, _repo: &str, _digest: &OciDigest) -> Result<()> {
        Err(Error::unsupported("delete blob"))
    }

    async fn delete_manifest(&self, _repo: &str, _digest: &OciDigest) -> Result<()> {
        Err(Error::unsupported("delete manifest"))
    }

    async fn delete_tag(&self, _repo: &str, _tag: &str) -> Result<()> {
        Err(Error::unsupported("delete tag"))
    }
}

/// Enumeration of repositories, tags, and referrers.
pub trait RegistryLister: Send + Sync {
    /// All repositories, ordered lexically, starting after `start_after`
    /// when given.
    fn repositories(&self, _start_after: Option<String>) -> EntryStream<String> {
        error_stream(Error::unsupported("list repositories"))
    }

    /// Tags of a repository, ordered lexically, starting after
    /// `start_after` when given.
    fn tags(&self, _repo: &str, _start_after: Option<String>) -> EntryStream<String> {
        error_stream(Error::unsupported("list tags"))
    }

    /// Manifests whose subject is `digest`, ordered by digest, optionally
    /// filtered by artifact type.
    fn referrers(
        &self,
        _repo: &str,
        _digest: &OciDigest,
        _artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        error_stream(Error::unsupported("list referrers"))
    }
}

/// The full registry interface.
pub trait Registry:
    RegistryReader + RegistryWriter + RegistryDeleter + RegistryLister + 'static
{
}

impl<T> Registry for T where
    T: RegistryReader + RegistryWriter + RegistryDeleter + RegistryLister + 'static
{
}

/// A streaming blob upload produced by
/// [`RegistryWriter::push_blob_chunked`].
///
/// Writes are buffered internally; errors encountered by background
/// flushing are deferred to the next `write`, `commit`, or `close` call.
/// Dropping a writer without calling any terminal method leaves the
/// server-side session as-is.
#[async_trait]
pub trait BlobWriter: Send {
    /// Opaque resumption id, valid for
    /// [`RegistryWriter::resume_blob_chunked`] after `close`.
    fn id(&self) -> String;

    /// Bytes accepted so far.
    fn size(&self) -> u64;

    /// Append content. The writer may buffer arbitrarily; acceptance does
    /// not imply the bytes reached the registry.
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Flush pending content and complete the upload. Returns the canonical
    /// digest, which servers may rewrite.
    async fn commit(self: Box<Self>, digest: &OciDigest) -> Result<OciDigest>;

    /// Abandon the upload, tearing down the server-side session. Idempotent.
    async fn cancel(self: Box<Self>) -> Result<()>;

    /// End the writer without committing or aborting. The upload remains
    /// resumable via the returned id.
    async fn close(self: Box<Self>) -> Result<String>;
}

impl std::fmt::Debug for dyn BlobWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobWriter")
            .field("id", &self.id())
            .field("size", &self.size())
            .finish()
    }
}

/// The empty registry value: supports nothing, suitable as a base for
/// partial test doubles.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unsupported;

impl RegistryReader for Unsupported {}
impl RegistryWriter for Unsupported {}
impl RegistryDeleter for Unsupported {}
impl RegistryLister for Unsupported {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::DistributionErrorCode;

    #[tokio::test]
    async fn unsupported_default_bodies() {
        let r = Unsupported;
        let digest = OciDigest::from("x".as_bytes());
        let err = r.get_blob("repo", &digest).await.unwrap_err();
        assert!(err.is_code(DistributionErrorCode::Unsupported));

        let err = collect_entries(r.repositories(None)).await.unwrap_err();
        assert!(err.is_code(DistributionErrorCode::Unsupported));
    }

    #[tokio::test]
    async fn blob_collects_to_bytes() {
        let desc = Descriptor::from_content("application/octet-stream", b"hi");
        let blob = Blob::from_bytes(desc.clone(), Bytes::from_static(b"hi"));
        assert_eq!(blob.descriptor, desc);
        assert_eq!(blob.collect().await.unwrap().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn dyn_registry_object() {
        let r: std::sync::Arc<dyn Registry> = std::sync::Arc::new(Unsupported);
        let err = r.resolve_tag("repo", "latest").await.unwrap_err();
        assert!(err.is_code(DistributionErrorCode::Unsupported));
    }
}
