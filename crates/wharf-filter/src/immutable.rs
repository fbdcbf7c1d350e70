use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use wharf_core::registry::{
    Blob, BlobWriter, ByteStream, EntryStream, Registry, RegistryDeleter, RegistryLister,
    RegistryReader, RegistryWriter,
};
use wharf_core::{Descriptor, DistributionErrorCode, Error, OciDigest, Result};

/// A registry overlay that refuses to change existing content.
///
/// Pushing a manifest under a tag is allowed only when the tag does not
/// exist yet or already resolves to the identical content, so repeated
/// pushes of the same bytes stay idempotent. Deletes are always denied.
/// Blob and untagged manifest pushes delegate unchanged; content-addressed
/// stores cannot be mutated by them.
pub struct Immutable {
    inner: Arc<dyn Registry>,
}

impl Immutable {
    pub fn new(inner: Arc<dyn Registry>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RegistryReader for Immutable {
    async fn get_blob(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.inner.get_blob(repo, digest).await
    }

    async fn get_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.inner.get_manifest(repo, digest).await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<Blob> {
        self.inner.get_tag(repo, tag).await
    }

    async fn resolve_blob(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.inner.resolve_blob(repo, digest).await
    }

    async fn resolve_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.inner.resolve_manifest(repo, digest).await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        self.inner.resolve_tag(repo, tag).await
    }
}

#[async_trait]
impl RegistryWriter for Immutable {
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        content: ByteStream,
    ) -> Result<Descriptor> {
        self.inner.push_blob(repo, descriptor, content).await
    }

    async fn push_blob_chunked(
        &self,
        repo: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        self.inner.push_blob_chunked(repo, chunk_size).await
    }

    async fn resume_blob_chunked(
        &self,
        repo: &str,
        session_id: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        self.inner
            .resume_blob_chunked(repo, session_id, chunk_size)
            .await
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        self.inner.mount_blob(from_repo, to_repo, digest).await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        if let Some(tag) = tag {
            match self.inner.resolve_tag(repo, tag).await {
                Ok(existing) => {
                    let incoming = OciDigest::from(contents.as_ref());
                    if existing.digest != incoming {
                        return Err(Error::denied(format!(
                            "tag {tag:?} in {repo:?} is immutable and already bound to {}",
                            existing.digest
                        )));
                    }
                }
                Err(e)
                    if matches!(
                        e.code(),
                        DistributionErrorCode::ManifestUnknown
                            | DistributionErrorCode::NameUnknown
                    ) => {}
                Err(e) => return Err(e),
            }
        }
        self.inner.push_manifest(repo, tag, contents, media_type).await
    }
}

#[async_trait]
impl RegistryDeleter for Immutable {
    async fn delete_blob(&self, _repo: &str, _digest: &OciDigest) -> Result<()> {
        Err(Error::denied("registry is immutable"))
    }

    async fn delete_manifest(&self, _repo: &str, _digest: &OciDigest) -> Result<()> {
        Err(Error::denied("registry is immutable"))
    }

    async fn delete_tag(&self, _repo: &str, _tag: &str) -> Result<()> {
        Err(Error::denied("registry is immutable"))
    }
}

impl RegistryLister for Immutable {
    fn repositories(&self, start_after: Option<String>) -> EntryStream<String> {
        self.inner.repositories(start_after)
    }

    fn tags(&self, repo: &str, start_after: Option<String>) -> EntryStream<String> {
        self.inner.tags(repo, start_after)
    }

    fn referrers(
        &self,
        repo: &str,
        digest: &OciDigest,
        artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        self.inner.referrers(repo, digest, artifact_type)
    }
}

#[cfg(test)]
mod test {
    use wharf_core::model::media_type;
    use wharf_core::registry::byte_stream;
    use wharf_mem::MemRegistry;

    use super::*;

    async fn setup() -> (Immutable, Bytes, Bytes) {
        let mem = MemRegistry::new();
        let config = Descriptor::from_content(media_type::OCTET_STREAM, b"{}");
        mem.push_blob("r", &config, byte_stream(Bytes::from_static(b"{}")))
            .await
            .unwrap();
        let m1 = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "mediaType": media_type::IMAGE_MANIFEST,
                "config": config,
                "layers": [],
            }))
            .unwrap(),
        );
        let m2 = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "mediaType": media_type::IMAGE_MANIFEST,
                "config": config,
                "layers": [],
                "annotations": {"v": "2"},
            }))
            .unwrap(),
        );
        (Immutable::new(Arc::new(mem)), m1, m2)
    }

    #[tokio::test]
    async fn same_content_push_is_idempotent() {
        let (reg, m1, m2) = setup().await;
        reg.push_manifest("r", Some("t"), m1.clone(), media_type::IMAGE_MANIFEST)
            .await
            .unwrap();
        // pushing identical bytes to the same tag succeeds again
        reg.push_manifest("r", Some("t"), m1, media_type::IMAGE_MANIFEST)
            .await
            .unwrap();
        // different content is denied
        let err = reg
            .push_manifest("r", Some("t"), m2, media_type::IMAGE_MANIFEST)
            .await
            .unwrap_err();
        assert!(err.is_code(DistributionErrorCode::Denied));
    }

    #[tokio::test]
    async fn new_tags_and_untagged_pushes_pass() {
        let (reg, m1, m2) = setup().await;
        reg.push_manifest("r", Some("a"), m1, media_type::IMAGE_MANIFEST)
            .await
            .unwrap();
        reg.push_manifest("r", Some("b"), m2.clone(), media_type::IMAGE_MANIFEST)
            .await
            .unwrap();
        reg.push_manifest("r", None, m2, media_type::IMAGE_MANIFEST)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deletes_are_denied() {
        let (reg, m1, _) = setup().await;
        let desc = reg
            .push_manifest("r", Some("t"), m1, media_type::IMAGE_MANIFEST)
            .await
            .unwrap();

        assert!(reg
            .delete_tag("r", "t")
            .await
            .unwrap_err()
            .is_code(DistributionErrorCode::Denied));
        assert!(reg
            .delete_manifest("r", &desc.digest)
            .await
            .unwrap_err()
            .is_code(DistributionErrorCode::Denied));
    }
}
