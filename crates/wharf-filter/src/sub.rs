use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use pin_project::pin_project;

use wharf_auth::context::{ambient_scope, with_ambient_scope, with_ambient_scope_sync};
use wharf_auth::scope::{ResourceScope, Scope};
use wharf_core::registry::{
    Blob, BlobWriter, ByteStream, EntryStream, Registry, RegistryDeleter, RegistryLister,
    RegistryReader, RegistryWriter,
};
use wharf_core::reference::is_valid_repository;
use wharf_core::{Descriptor, Error, OciDigest, Result};

/// A view of a registry restricted to repositories under a prefix.
///
/// `Sub::new(r, "a/b")` exposes `r`'s repository `a/b/foo` as `foo`.
/// Repository listings filter to the prefix and strip it. The ambient
/// authorization scope is rewritten on the way down, so a caller-provided
/// `repository:foo:pull` reaches the underlying registry as
/// `repository:a/b/foo:pull`.
pub struct Sub {
    inner: Arc<dyn Registry>,
    prefix: String,
}

impl Sub {
    pub fn new(inner: Arc<dyn Registry>, prefix: &str) -> Result<Self> {
        if !is_valid_repository(prefix) {
            return Err(Error::InvalidReference(format!(
                "invalid repository prefix: {prefix:?}"
            )));
        }
        Ok(Self {
            inner,
            prefix: prefix.to_string(),
        })
    }

    fn qualify(&self, repo: &str) -> String {
        format!("{}/{}", self.prefix, repo)
    }

    fn rewritten_scope(&self) -> Scope {
        rewrite_scope(&ambient_scope(), &self.prefix)
    }

    async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        with_ambient_scope(self.rewritten_scope(), fut).await
    }

    fn scoped_stream<T: Send + 'static>(&self, make: impl FnOnce() -> EntryStream<T>) -> EntryStream<T> {
        let scope = self.rewritten_scope();
        let inner = with_ambient_scope_sync(scope.clone(), make);
        Box::pin(ScopedStream { scope, inner })
    }
}

fn rewrite_scope(scope: &Scope, prefix: &str) -> Scope {
    if scope.is_unlimited() {
        return Scope::unlimited();
    }
    Scope::from_scopes(scope.iter().map(|rs| {
        if rs.resource_type == "repository" && !rs.resource.is_empty() {
            ResourceScope::repository(format!("{prefix}/{}", rs.resource), rs.action.clone())
        } else {
            rs.clone()
        }
    }))
}

/// Keeps a rewritten ambient scope installed for every poll of the wrapped
/// stream, so lazily-issued list requests see it too.
#[pin_project]
struct ScopedStream<T> {
    scope: Scope,
    #[pin]
    inner: EntryStream<T>,
}

impl<T> Stream for ScopedStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let inner = this.inner;
        with_ambient_scope_sync(this.scope.clone(), || inner.poll_next(cx))
    }
}

#[async_trait]
impl RegistryReader for Sub {
    async fn get_blob(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.scoped(self.inner.get_blob(&self.qualify(repo), digest))
            .await
    }

    async fn get_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.scoped(self.inner.get_manifest(&self.qualify(repo), digest))
            .await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<Blob> {
        self.scoped(self.inner.get_tag(&self.qualify(repo), tag)).await
    }

    async fn resolve_blob(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.scoped(self.inner.resolve_blob(&self.qualify(repo), digest))
            .await
    }

    async fn resolve_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.scoped(self.inner.resolve_manifest(&self.qualify(repo), digest))
            .await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        self.scoped(self.inner.resolve_tag(&self.qualify(repo), tag))
            .await
    }
}

#[async_trait]
impl RegistryWriter for Sub {
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        content: ByteStream,
    ) -> Result<Descriptor> {
        self.scoped(self.inner.push_blob(&self.qualify(repo), descriptor, content))
            .await
    }

    async fn push_blob_chunked(
        &self,
        repo: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        self.scoped(self.inner.push_blob_chunked(&self.qualify(repo), chunk_size))
            .await
    }

    async fn resume_blob_chunked(
        &self,
        repo: &str,
        session_id: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        self.scoped(
            self.inner
                .resume_blob_chunked(&self.qualify(repo), session_id, chunk_size),
        )
        .await
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        self.scoped(self.inner.mount_blob(
            &self.qualify(from_repo),
            &self.qualify(to_repo),
            digest,
        ))
        .await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        self.scoped(
            self.inner
                .push_manifest(&self.qualify(repo), tag, contents, media_type),
        )
        .await
    }
}

#[async_trait]
impl RegistryDeleter for Sub {
    async fn delete_blob(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        self.scoped(self.inner.delete_blob(&self.qualify(repo), digest))
            .await
    }

    async fn delete_manifest(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        self.scoped(self.inner.delete_manifest(&self.qualify(repo), digest))
            .await
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        self.scoped(self.inner.delete_tag(&self.qualify(repo), tag))
            .await
    }
}

impl RegistryLister for Sub {
    fn repositories(&self, start_after: Option<String>) -> EntryStream<String> {
        use futures::StreamExt;
        let prefix = format!("{}/", self.prefix);
        let start_after = start_after.map(|s| format!("{prefix}{s}"));
        let scope = self.rewritten_scope();
        let inner =
            with_ambient_scope_sync(scope.clone(), || self.inner.repositories(start_after));
        let stripped: EntryStream<String> = Box::pin(inner.filter_map(move |item| {
            let prefix = prefix.clone();
            async move {
                match item {
                    Ok(repo) => repo
                        .strip_prefix(&prefix)
                        .map(|stripped| Ok(stripped.to_string())),
                    Err(e) => Some(Err(e)),
                }
            }
        }));
        Box::pin(ScopedStream {
            scope,
            inner: stripped,
        })
    }

    fn tags(&self, repo: &str, start_after: Option<String>) -> EntryStream<String> {
        let repo = self.qualify(repo);
        self.scoped_stream(move || self.inner.tags(&repo, start_after))
    }

    fn referrers(
        &self,
        repo: &str,
        digest: &OciDigest,
        artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        let repo = self.qualify(repo);
        self.scoped_stream(move || self.inner.referrers(&repo, digest, artifact_type))
    }
}
