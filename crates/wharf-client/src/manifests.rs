use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;

use wharf_core::registry::{collect_stream, Blob};
use wharf_core::wire;
use wharf_core::{Descriptor, DistributionErrorCode, ManifestRef, OciDigest, Result};

use crate::{
    body_stream, descriptor_from_response, error_from_response, header_content_length,
    header_content_type, header_digest, pull_scope, push_scope, delete_scope, RemoteRegistry,
};

const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

impl RemoteRegistry {
    pub(crate) async fn get_manifest_impl(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        let req = wire::Request::ManifestGet {
            repo: repo.to_string(),
            reference: ManifestRef::Digest(digest.clone()),
        };
        let resp = self
            .inner
            .send(
                &req,
                &pull_scope(repo),
                None,
                &[(ACCEPT, ACCEPT_MANIFEST.to_string())],
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp, DistributionErrorCode::ManifestUnknown).await);
        }
        let descriptor = Descriptor::new(
            header_content_type(&resp),
            header_content_length(&resp)?,
            digest.clone(),
        );
        let content = wharf_core::verify_stream(body_stream(resp), &descriptor);
        Ok(Blob {
            descriptor,
            content,
        })
    }

    pub(crate) async fn get_tag_impl(&self, repo: &str, tag: &str) -> Result<Blob> {
        let req = wire::Request::ManifestGet {
            repo: repo.to_string(),
            reference: ManifestRef::Tag(tag.to_string()),
        };
        let resp = self
            .inner
            .send(
                &req,
                &pull_scope(repo),
                None,
                &[(ACCEPT, ACCEPT_MANIFEST.to_string())],
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp, DistributionErrorCode::ManifestUnknown).await);
        }
        let media_type = header_content_type(&resp);
        match header_digest(&resp)? {
            Some(digest) => {
                let descriptor =
                    Descriptor::new(media_type, header_content_length(&resp)?, digest);
                let content = wharf_core::verify_stream(body_stream(resp), &descriptor);
                Ok(Blob {
                    descriptor,
                    content,
                })
            }
            None => {
                // no Docker-Content-Digest: buffer the body and digest it
                // ourselves so the descriptor is still trustworthy
                let content = collect_stream(body_stream(resp)).await?;
                let digest = OciDigest::from(content.as_ref());
                let descriptor = Descriptor::new(media_type, content.len() as u64, digest);
                Ok(Blob::from_bytes(descriptor, content))
            }
        }
    }

    pub(crate) async fn resolve_manifest_impl(
        &self,
        repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        let req = wire::Request::ManifestHead {
            repo: repo.to_string(),
            reference: ManifestRef::Digest(digest.clone()),
        };
        let resp = self
            .inner
            .send(
                &req,
                &pull_scope(repo),
                None,
                &[(ACCEPT, ACCEPT_MANIFEST.to_string())],
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp, DistributionErrorCode::ManifestUnknown).await);
        }
        descriptor_from_response(&resp, Some(digest))
    }

    pub(crate) async fn resolve_tag_impl(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        let req = wire::Request::ManifestHead {
            repo: repo.to_string(),
            reference: ManifestRef::Tag(tag.to_string()),
        };
        let resp = self
            .inner
            .send(
                &req,
                &pull_scope(repo),
                None,
                &[(ACCEPT, ACCEPT_MANIFEST.to_string())],
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp, DistributionErrorCode::ManifestUnknown).await);
        }
        descriptor_from_response(&resp, None)
    }

    pub(crate) async fn push_manifest_impl(
        &self,
        repo: &str,
        tag: Option<&str>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        let computed = OciDigest::from(contents.as_ref());
        let reference = match tag {
            Some(tag) => ManifestRef::Tag(tag.to_string()),
            None => ManifestRef::Digest(computed.clone()),
        };
        let req = wire::Request::ManifestPut {
            repo: repo.to_string(),
            reference,
        };
        let resp = self
            .inner
            .send(
                &req,
                &push_scope(repo),
                Some(contents.clone()),
                &[(CONTENT_TYPE, media_type.to_string())],
            )
            .await?;
        if resp.status() != StatusCode::CREATED {
            return Err(error_from_response(resp, DistributionErrorCode::NameUnknown).await);
        }
        // servers may canonicalize the digest
        let digest = header_digest(&resp)?.unwrap_or(computed);
        Ok(Descriptor::new(media_type, contents.len() as u64, digest))
    }

    pub(crate) async fn delete_manifest_impl(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        let req = wire::Request::ManifestDelete {
            repo: repo.to_string(),
            reference: ManifestRef::Digest(digest.clone()),
        };
        let resp = self.inner.send(&req, &delete_scope(repo), None, &[]).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, DistributionErrorCode::ManifestUnknown).await);
        }
        Ok(())
    }
}
