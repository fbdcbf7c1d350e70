use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use wharf_core::registry::BlobWriter;
use wharf_core::{OciDigest, Result};

use crate::{MemRegistry, UploadSession};

/// Chunked upload writer for the in-memory registry. Content accumulates
/// locally; `close` parks it in the session store so a later
/// `resume_blob_chunked` can pick it back up.
pub(crate) struct MemBlobWriter {
    registry: MemRegistry,
    repo: String,
    id: String,
    buf: BytesMut,
}

impl MemBlobWriter {
    pub(crate) fn new(registry: MemRegistry, repo: String, id: String, buf: BytesMut) -> Self {
        Self {
            registry,
            repo,
            id,
            buf,
        }
    }
}

#[async_trait]
impl BlobWriter for MemBlobWriter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn commit(self: Box<Self>, digest: &OciDigest) -> Result<OciDigest> {
        let content = self.buf.freeze();
        let descriptor = self.registry.insert_blob(&self.repo, digest, content)?;
        self.registry.lock().sessions.remove(&self.id);
        tracing::debug!(repo = %self.repo, digest = %descriptor.digest, size = descriptor.size, "committed chunked upload");
        Ok(descriptor.digest)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        self.registry.lock().sessions.remove(&self.id);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<String> {
        let mut state = self.registry.lock();
        state.sessions.insert(
            self.id.clone(),
            UploadSession {
                repo: self.repo.clone(),
                buf: self.buf,
            },
        );
        Ok(self.id)
    }
}
