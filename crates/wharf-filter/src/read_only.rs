use std::sync::Arc;

use async_trait::async_trait;

use wharf_core::registry::{
    Blob, EntryStream, Registry, RegistryDeleter, RegistryLister, RegistryReader, RegistryWriter,
};
use wharf_core::{Descriptor, OciDigest, Result};

/// A view of a registry with all write and delete operations removed.
pub struct ReadOnly {
    inner: Arc<dyn Registry>,
}

impl ReadOnly {
    pub fn new(inner: Arc<dyn Registry>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RegistryReader for ReadOnly {
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

// writes and deletes fall through to the unsupported defaults
impl RegistryWriter for ReadOnly {}
impl RegistryDeleter for ReadOnly {}

impl RegistryLister for ReadOnly {
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
    use bytes::Bytes;

    use wharf_core::model::media_type;
    use wharf_core::registry::{byte_stream, RegistryWriter as _};
    use wharf_core::DistributionErrorCode;
    use wharf_mem::MemRegistry;

    use super::*;

    #[tokio::test]
    async fn reads_pass_writes_fail() {
        let mem = MemRegistry::new();
        let desc = Descriptor::from_content(media_type::OCTET_STREAM, b"hi");
        mem.push_blob("r", &desc, byte_stream(Bytes::from_static(b"hi")))
            .await
            .unwrap();

        let ro = ReadOnly::new(Arc::new(mem));
        let blob = ro.get_blob("r", &desc.digest).await.unwrap();
        assert_eq!(blob.collect().await.unwrap().as_ref(), b"hi");

        let err = ro
            .push_blob("r", &desc, byte_stream(Bytes::from_static(b"hi")))
            .await
            .unwrap_err();
        assert!(err.is_code(DistributionErrorCode::Unsupported));

        let err = ro.delete_blob("r", &desc.digest).await.unwrap_err();
        assert!(err.is_code(DistributionErrorCode::Unsupported));
    }
}
