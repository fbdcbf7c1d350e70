use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use reqwest::StatusCode;

use wharf_core::model::media_type;
use wharf_core::registry::{collect_stream, Blob, BlobWriter, ByteStream};
use wharf_core::wire;
use wharf_core::{Descriptor, DistributionErrorCode, Error, OciDigest, Result};

use crate::upload::ChunkedUploader;
use crate::{
    body_stream, error_from_response, header_content_length, location_with_digest, pull_scope,
    push_scope, delete_scope, RemoteRegistry,
};

impl RemoteRegistry {
    pub(crate) async fn get_blob_impl(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        let req = wire::Request::BlobGet {
            repo: repo.to_string(),
            digest: digest.clone(),
        };
        let resp = self
            .inner
            .send(&req, &pull_scope(repo), None, &[])
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp, DistributionErrorCode::BlobUnknown).await);
        }
        let descriptor = Descriptor::new(
            media_type::OCTET_STREAM,
            header_content_length(&resp)?,
            digest.clone(),
        );
        let content = wharf_core::verify_stream(body_stream(resp), &descriptor);
        Ok(Blob {
            descriptor,
            content,
        })
    }

    pub(crate) async fn resolve_blob_impl(
        &self,
        repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        let req = wire::Request::BlobHead {
            repo: repo.to_string(),
            digest: digest.clone(),
        };
        let resp = self.inner.send(&req, &pull_scope(repo), None, &[]).await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp, DistributionErrorCode::BlobUnknown).await);
        }
        crate::descriptor_from_response(&resp, Some(digest))
    }

    pub(crate) async fn push_blob_impl(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        content: ByteStream,
    ) -> Result<Descriptor> {
        let content = collect_stream(content).await?;
        if content.len() as u64 != descriptor.size {
            return Err(Error::SizeMismatch {
                expected: descriptor.size,
                actual: content.len() as u64,
            });
        }
        let req = wire::Request::UploadMonolithic {
            repo: repo.to_string(),
            digest: descriptor.digest.clone(),
        };
        let scope = push_scope(repo);
        let resp = self
            .inner
            .send(
                &req,
                &scope,
                Some(content.clone()),
                &[(CONTENT_TYPE, media_type::OCTET_STREAM.to_string())],
            )
            .await?;
        match resp.status() {
            StatusCode::CREATED => Ok(descriptor.clone()),
            // the server declined the monolithic shortcut and opened an
            // upload session instead; finish it with a single PUT
            StatusCode::ACCEPTED => {
                let location = self.inner.location_of(&resp)?;
                self.put_whole_body(repo, &location, descriptor, content).await?;
                Ok(descriptor.clone())
            }
            _ => Err(error_from_response(resp, DistributionErrorCode::NameUnknown).await),
        }
    }

    async fn put_whole_body(
        &self,
        repo: &str,
        location: &str,
        descriptor: &Descriptor,
        content: Bytes,
    ) -> Result<()> {
        let url = reqwest::Url::parse(&location_with_digest(location, &descriptor.digest))
            .map_err(|e| Error::InvalidReference(format!("bad upload location: {e}")))?;
        let mut headers = vec![(CONTENT_TYPE, media_type::OCTET_STREAM.to_string())];
        if !content.is_empty() {
            headers.push((CONTENT_RANGE, format!("0-{}", content.len() - 1)));
        }
        let resp = self
            .inner
            .send_url(http::Method::PUT, url, &push_scope(repo), Some(content), &headers)
            .await?;
        if resp.status() != StatusCode::CREATED {
            return Err(error_from_response(resp, DistributionErrorCode::BlobUploadUnknown).await);
        }
        Ok(())
    }

    pub(crate) async fn push_blob_chunked_impl(
        &self,
        repo: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        let uploader =
            ChunkedUploader::start(self.inner.clone(), repo.to_string(), chunk_size).await?;
        Ok(Box::new(uploader))
    }

    pub(crate) async fn resume_blob_chunked_impl(
        &self,
        repo: &str,
        session_id: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        let uploader = ChunkedUploader::resume(
            self.inner.clone(),
            repo.to_string(),
            session_id.to_string(),
            chunk_size,
        )
        .await?;
        Ok(Box::new(uploader))
    }

    pub(crate) async fn mount_blob_impl(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        let req = wire::Request::UploadMount {
            repo: to_repo.to_string(),
            from_repo: from_repo.to_string(),
            digest: digest.clone(),
        };
        let scope = push_scope(to_repo).union(&pull_scope(from_repo));
        let resp = self.inner.send(&req, &scope, None, &[]).await?;
        match resp.status() {
            StatusCode::CREATED => self.resolve_blob_impl(to_repo, digest).await,
            // mount declined: the server opened a plain upload session, so
            // copy the content across ourselves
            StatusCode::ACCEPTED => {
                let location = self.inner.location_of(&resp)?;
                let blob = self.get_blob_impl(from_repo, digest).await?;
                let descriptor = blob.descriptor.clone();
                let content = blob.collect().await?;
                self.put_whole_body(to_repo, &location, &descriptor, content).await?;
                Ok(descriptor)
            }
            _ => Err(error_from_response(resp, DistributionErrorCode::BlobUnknown).await),
        }
    }

    pub(crate) async fn delete_blob_impl(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        let req = wire::Request::BlobDelete {
            repo: repo.to_string(),
            digest: digest.clone(),
        };
        let resp = self.inner.send(&req, &delete_scope(repo), None, &[]).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, DistributionErrorCode::BlobUnknown).await);
        }
        Ok(())
    }
}
