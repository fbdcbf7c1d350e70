//! Client side of chunked blob uploads.
//!
//! The uploader buffers caller writes into fixed-size chunks and sends each
//! full chunk as a `PATCH` on a background task, so the caller can keep
//! filling the next chunk while the previous one is on the wire. At most
//! one `PATCH` is outstanding per uploader; its outcome is collected before
//! the next chunk goes out, and failures are deferred to the next caller
//! operation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::task::JoinHandle;

use wharf_auth::scope::Scope;
use wharf_core::model::media_type;
use wharf_core::registry::BlobWriter;
use wharf_core::wire;
use wharf_core::{DistributionErrorCode, Error, OciDigest, Result};

use crate::{
    error_from_response, header_digest, location_with_digest, push_scope, ClientInner,
};

// https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pushing-a-blob-in-chunks
const CHUNK_MIN_LENGTH_HEADER: &str = "oci-chunk-min-length";
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) struct ChunkedUploader {
    client: Arc<ClientInner>,
    repo: String,
    /// Current upload URL; doubles as the resumption id.
    location: String,
    chunk_size: usize,
    buf: BytesMut,
    /// Bytes handed to completed or in-flight PATCHes.
    flushed: u64,
    /// Bytes accepted from the caller.
    accepted: u64,
    inflight: Option<JoinHandle<Result<String>>>,
}

impl ChunkedUploader {
    pub(crate) async fn start(
        client: Arc<ClientInner>,
        repo: String,
        chunk_size: Option<usize>,
    ) -> Result<Self> {
        let req = wire::Request::UploadStart { repo: repo.clone() };
        let resp = client.send(&req, &push_scope(&repo), None, &[]).await?;
        if resp.status() != StatusCode::ACCEPTED {
            return Err(error_from_response(resp, DistributionErrorCode::NameUnknown).await);
        }
        let server_min = resp
            .headers()
            .get(CHUNK_MIN_LENGTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let location = client.location_of(&resp)?;
        Ok(Self {
            client,
            repo,
            location,
            chunk_size: chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(server_min),
            buf: BytesMut::new(),
            flushed: 0,
            accepted: 0,
            inflight: None,
        })
    }

    /// Reattach to an upload session left behind by `close`. The server's
    /// `Range` header tells us how much it already holds.
    pub(crate) async fn resume(
        client: Arc<ClientInner>,
        repo: String,
        location: String,
        chunk_size: Option<usize>,
    ) -> Result<Self> {
        let url = resolve_location(&client, &location)?;
        let resp = client
            .send_url(http::Method::GET, url, &push_scope(&repo), None, &[])
            .await?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(
                error_from_response(resp, DistributionErrorCode::BlobUploadUnknown).await,
            );
        }
        // `Range: 0-<end>` with an inclusive end; absent means nothing has
        // been flushed yet
        let flushed = resp
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split_once('-'))
            .and_then(|(_, end)| end.parse::<u64>().ok())
            .map(|end| end + 1)
            .unwrap_or(0);
        let location = match resp.headers().get(reqwest::header::LOCATION) {
            Some(_) => client.location_of(&resp)?,
            None => location,
        };
        Ok(Self {
            client,
            repo,
            location,
            chunk_size: chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            buf: BytesMut::new(),
            flushed,
            accepted: flushed,
            inflight: None,
        })
    }

    /// Collect the outcome of the outstanding PATCH, adopting its returned
    /// location.
    async fn join_inflight(&mut self) -> Result<()> {
        if let Some(handle) = self.inflight.take() {
            let location = handle.await.map_err(Error::transport)??;
            self.location = location;
        }
        Ok(())
    }

    /// Ship the buffered chunk. Waits for the previous PATCH first, so there
    /// is only ever one outstanding send per uploader.
    async fn flush_chunk(&mut self) -> Result<()> {
        self.join_inflight().await?;
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        let start = self.flushed;
        self.flushed += chunk.len() as u64;
        let client = self.client.clone();
        let location = self.location.clone();
        let scope = push_scope(&self.repo);
        self.inflight = Some(tokio::spawn(async move {
            patch_chunk(client, location, scope, start, chunk).await
        }));
        Ok(())
    }
}

async fn patch_chunk(
    client: Arc<ClientInner>,
    location: String,
    scope: Scope,
    start: u64,
    chunk: Bytes,
) -> Result<String> {
    let end = start + chunk.len() as u64 - 1;
    let url = resolve_location(&client, &location)?;
    let resp = client
        .send_url(
            http::Method::PATCH,
            url,
            &scope,
            Some(chunk),
            &[
                (CONTENT_RANGE, format!("{start}-{end}")),
                (CONTENT_TYPE, media_type::OCTET_STREAM.to_string()),
            ],
        )
        .await?;
    if resp.status() != StatusCode::ACCEPTED {
        return Err(error_from_response(resp, DistributionErrorCode::BlobUploadUnknown).await);
    }
    // the response location is where the next chunk goes
    Ok(client.location_of(&resp).unwrap_or(location))
}

fn resolve_location(client: &ClientInner, location: &str) -> Result<reqwest::Url> {
    client
        .base
        .join(location)
        .map_err(|e| Error::InvalidReference(format!("bad upload location {location:?}: {e}")))
}

#[async_trait]
impl BlobWriter for ChunkedUploader {
    fn id(&self) -> String {
        self.location.clone()
    }

    fn size(&self) -> u64 {
        self.accepted
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        let mut data = data;
        while !data.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data.split_to(take));
            self.accepted += take as u64;
            if self.buf.len() == self.chunk_size {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>, digest: &OciDigest) -> Result<OciDigest> {
        self.flush_chunk().await?;
        self.join_inflight().await?;
        let target = location_with_digest(&self.location, digest);
        let url = resolve_location(&self.client, &target)?;
        let resp = self
            .client
            .send_url(http::Method::PUT, url, &push_scope(&self.repo), None, &[])
            .await?;
        if resp.status() != StatusCode::CREATED {
            return Err(error_from_response(resp, DistributionErrorCode::BlobUploadUnknown).await);
        }
        // the server may canonicalize the digest it stored under
        Ok(header_digest(&resp)?.unwrap_or_else(|| digest.clone()))
    }

    async fn cancel(mut self: Box<Self>) -> Result<()> {
        // collect the outstanding PATCH but don't let its failure mask the
        // cancellation; the session is being torn down either way
        let _ = self.join_inflight().await;
        let url = resolve_location(&self.client, &self.location)?;
        let resp = self
            .client
            .send_url(http::Method::DELETE, url, &push_scope(&self.repo), None, &[])
            .await?;
        // 404: already gone; 405: the server has no session delete at all.
        // both leave nothing for us to tear down
        if resp.status().is_success()
            || resp.status() == StatusCode::NOT_FOUND
            || resp.status() == StatusCode::METHOD_NOT_ALLOWED
        {
            return Ok(());
        }
        Err(error_from_response(resp, DistributionErrorCode::BlobUploadUnknown).await)
    }

    async fn close(mut self: Box<Self>) -> Result<String> {
        // flush buffered bytes so the server-side offset matches size()
        self.flush_chunk().await?;
        self.join_inflight().await?;
        Ok(self.location.clone())
    }
}
