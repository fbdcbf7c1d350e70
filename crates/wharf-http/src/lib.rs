//! # Wharf HTTP
//!
//! Serves any [`wharf_core::Registry`] implementation over the [OCI
//! distribution API](https://github.com/opencontainers/distribution-spec).
//! Every incoming request is parsed by the wire taxonomy in
//! [`wharf_core::wire`] and dispatched to the backing registry; errors map
//! to distribution error bodies with the canonical status codes.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use wharf_http::RegistryServer;
//! use wharf_mem::MemRegistry;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RegistryServer::new(Arc::new(MemRegistry::new()));
//! axum::Server::bind(&"0.0.0.0:13030".parse()?)
//!     .serve(server.router().into_make_service())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::sync::Arc;

use axum::body::StreamBody;
use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine as _};
use bytes::Bytes;
use http::{Method, StatusCode};
use hyper::body::Body;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{self, TraceLayer};

use wharf_core::model::media_type;
use wharf_core::registry::{byte_stream, collect_entries, BlobWriter, Registry};
use wharf_core::wire::Request as WireRequest;
use wharf_core::{
    Descriptor, DistributionErrorCode, Index, ManifestRef, OciDigest, RepositoryList, TagList,
};

mod errors;
use errors::{Error, Result};

const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;
// the bundled backends buffer chunks in memory and impose no real floor;
// advertise the smallest value so clients keep their own chunk sizing
const CHUNK_MIN_LENGTH: u64 = 1;

static DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
static DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
static OCI_CHUNK_MIN_LENGTH: HeaderName = HeaderName::from_static("oci-chunk-min-length");
static OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");
static RANGE: HeaderName = HeaderName::from_static("range");

/// Maps a repository and blob descriptor to alternative download URLs.
/// When it yields any, blob GETs answer with a 307 redirect to the first
/// instead of streaming through this server.
pub type BlobLocator = Arc<dyn Fn(&str, &Descriptor) -> Vec<String> + Send + Sync>;

/// An OCI distribution endpoint over an arbitrary registry backend.
#[derive(Clone)]
pub struct RegistryServer {
    backend: Arc<dyn Registry>,
    blob_locator: Option<BlobLocator>,
}

impl RegistryServer {
    pub fn new(backend: Arc<dyn Registry>) -> Self {
        Self {
            backend,
            blob_locator: None,
        }
    }

    pub fn with_blob_locator(mut self, locator: BlobLocator) -> Self {
        self.blob_locator = Some(locator);
        self
    }

    /// Return an [`axum::Router`] serving the distribution API.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.clone())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new())
                    .on_response(trace::DefaultOnResponse::new())
                    .on_request(trace::DefaultOnRequest::new()),
            )
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static("docker-distribution-api-version"),
                HeaderValue::from_static("registry/2.0"),
            ))
    }
}

async fn dispatch(State(server): State<RegistryServer>, req: Request<Body>) -> Response {
    match handle(&server, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn handle(server: &RegistryServer, req: Request<Body>) -> Result<Response> {
    let method = req.method().clone();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let parsed = WireRequest::parse(&method, &target)?;
    let (parts, body) = req.into_parts();

    match parsed {
        WireRequest::Ping => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Ok((StatusCode::OK, headers, "{}").into_response())
        }

        WireRequest::BlobGet { repo, digest } => server.get_blob(&repo, &digest).await,
        WireRequest::BlobHead { repo, digest } => {
            let descriptor = server.backend.resolve_blob(&repo, &digest).await?;
            Ok((StatusCode::OK, descriptor_headers(&descriptor)?, "").into_response())
        }
        WireRequest::BlobDelete { repo, digest } => {
            server.backend.delete_blob(&repo, &digest).await?;
            Ok((StatusCode::ACCEPTED, "").into_response())
        }

        WireRequest::UploadStart { repo } => server.start_upload(&repo).await,
        WireRequest::UploadMonolithic { repo, digest } => {
            let content = read_body(body).await?;
            let descriptor =
                Descriptor::new(media_type::OCTET_STREAM, content.len() as u64, digest);
            let descriptor = server
                .backend
                .push_blob(&repo, &descriptor, byte_stream(content))
                .await?;
            let mut headers = HeaderMap::new();
            headers.insert(
                header::LOCATION,
                location_value(&format!("/v2/{repo}/blobs/{}", descriptor.digest))?,
            );
            headers.insert(
                &DOCKER_CONTENT_DIGEST,
                HeaderValue::from_str(&descriptor.digest.to_string())?,
            );
            Ok((StatusCode::CREATED, headers, "").into_response())
        }
        WireRequest::UploadMount {
            repo,
            from_repo,
            digest,
        } => match server.backend.mount_blob(&from_repo, &repo, &digest).await {
            Ok(descriptor) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::LOCATION,
                    location_value(&format!("/v2/{repo}/blobs/{}", descriptor.digest))?,
                );
                headers.insert(
                    &DOCKER_CONTENT_DIGEST,
                    HeaderValue::from_str(&descriptor.digest.to_string())?,
                );
                Ok((StatusCode::CREATED, headers, "").into_response())
            }
            // mount not available: degrade to a plain upload session
            Err(e) if e.is_code(DistributionErrorCode::Unsupported) => {
                server.start_upload(&repo).await
            }
            Err(e) => Err(e.into()),
        },
        WireRequest::UploadInfo { repo, id } => {
            let writer = server.resume(&repo, &id).await?;
            let size = writer.size();
            let id = writer.close().await?;
            let headers = upload_headers(&repo, &id, size)?;
            Ok((StatusCode::NO_CONTENT, headers, "").into_response())
        }
        WireRequest::UploadChunk { repo, id } => {
            let mut writer = server.resume(&repo, &id).await?;
            if let Some(range) = content_range(&parts.headers)? {
                if range.0 != writer.size() {
                    // park the session before failing so the client can
                    // re-query the offset and continue
                    let offset = writer.size();
                    let _ = writer.close().await;
                    return Err(wharf_core::Error::coded_message(
                        DistributionErrorCode::RangeInvalid,
                        format!("chunk starts at {} but upload is at {offset}", range.0),
                    )
                    .into());
                }
            }
            let content = read_body(body).await?;
            writer.write(content).await?;
            let size = writer.size();
            let id = writer.close().await?;
            let headers = upload_headers(&repo, &id, size)?;
            Ok((StatusCode::ACCEPTED, headers, "").into_response())
        }
        WireRequest::UploadComplete { repo, id, digest } => {
            let mut writer = server.resume(&repo, &id).await?;
            let content = read_body(body).await?;
            if !content.is_empty() {
                writer.write(content).await?;
            }
            let digest = writer.commit(&digest).await?;
            let mut headers = HeaderMap::new();
            headers.insert(
                header::LOCATION,
                location_value(&format!("/v2/{repo}/blobs/{digest}"))?,
            );
            headers.insert(
                &DOCKER_CONTENT_DIGEST,
                HeaderValue::from_str(&digest.to_string())?,
            );
            Ok((StatusCode::CREATED, headers, "").into_response())
        }

        WireRequest::ManifestGet { repo, reference } => {
            let blob = match &reference {
                ManifestRef::Digest(digest) => server.backend.get_manifest(&repo, digest).await?,
                ManifestRef::Tag(tag) => server.backend.get_tag(&repo, tag).await?,
            };
            let headers = descriptor_headers(&blob.descriptor)?;
            Ok((StatusCode::OK, headers, StreamBody::new(blob.content)).into_response())
        }
        WireRequest::ManifestHead { repo, reference } => {
            let descriptor = match &reference {
                ManifestRef::Digest(digest) => {
                    server.backend.resolve_manifest(&repo, digest).await?
                }
                ManifestRef::Tag(tag) => server.backend.resolve_tag(&repo, tag).await?,
            };
            Ok((StatusCode::OK, descriptor_headers(&descriptor)?, "").into_response())
        }
        WireRequest::ManifestPut { repo, reference } => {
            server.put_manifest(&repo, reference, &parts.headers, body).await
        }
        WireRequest::ManifestDelete { repo, reference } => {
            match &reference {
                ManifestRef::Digest(digest) => {
                    server.backend.delete_manifest(&repo, digest).await?
                }
                ManifestRef::Tag(tag) => server.backend.delete_tag(&repo, tag).await?,
            }
            Ok((StatusCode::ACCEPTED, "").into_response())
        }

        WireRequest::TagsList { repo, n, last } => {
            let mut tags = collect_entries(server.backend.tags(&repo, last)).await?;
            if let Some(n) = n {
                tags.truncate(n);
            }
            Ok((
                StatusCode::OK,
                axum::Json(TagList {
                    name: repo,
                    tags,
                }),
            )
                .into_response())
        }
        WireRequest::ReferrersList {
            repo,
            digest,
            artifact_type,
        } => {
            let referrers =
                collect_entries(server.backend.referrers(&repo, &digest, artifact_type)).await?;
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(media_type::IMAGE_INDEX),
            );
            let body = serde_json::to_vec(&Index::new(referrers))
                .map_err(|e| Error::Body(e.to_string()))?;
            Ok((StatusCode::OK, headers, body).into_response())
        }
        WireRequest::CatalogList { n, last } => {
            let mut repositories = collect_entries(server.backend.repositories(last)).await?;
            if let Some(n) = n {
                repositories.truncate(n);
            }
            Ok((StatusCode::OK, axum::Json(RepositoryList { repositories })).into_response())
        }
    }
}

impl RegistryServer {
    async fn get_blob(&self, repo: &str, digest: &OciDigest) -> Result<Response> {
        let blob = self.backend.get_blob(repo, digest).await?;
        if let Some(locator) = &self.blob_locator {
            let locations = locator(repo, &blob.descriptor);
            if let Some(url) = locations.first() {
                let mut headers = HeaderMap::new();
                headers.insert(header::LOCATION, location_value(url)?);
                return Ok((StatusCode::TEMPORARY_REDIRECT, headers, "").into_response());
            }
        }
        let headers = descriptor_headers(&blob.descriptor)?;
        Ok((StatusCode::OK, headers, StreamBody::new(blob.content)).into_response())
    }

    async fn start_upload(&self, repo: &str) -> Result<Response> {
        let writer = self.backend.push_blob_chunked(repo, None).await?;
        let id = writer.close().await?;
        let headers = upload_headers(repo, &id, 0)?;
        Ok((StatusCode::ACCEPTED, headers, "").into_response())
    }

    async fn resume(&self, repo: &str, encoded_id: &str) -> Result<Box<dyn BlobWriter>> {
        let id = decode_upload_id(encoded_id)?;
        Ok(self.backend.resume_blob_chunked(repo, &id, None).await?)
    }

    async fn put_manifest(
        &self,
        repo: &str,
        reference: ManifestRef,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<Response> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingHeader("Content-Type"))?
            .to_string();
        let contents = read_body(body).await?;
        if contents.len() > MAX_MANIFEST_SIZE {
            return Err(wharf_core::Error::coded_message(
                DistributionErrorCode::SizeInvalid,
                "manifest exceeds the size limit",
            )
            .into());
        }
        let tag = match &reference {
            ManifestRef::Tag(tag) => Some(tag.as_str()),
            ManifestRef::Digest(digest) => {
                // a push by digest must hash to that digest
                let computed = OciDigest::from(contents.as_ref());
                if &computed != digest {
                    return Err(wharf_core::Error::DigestMismatch {
                        expected: digest.encoded().to_string(),
                        actual: computed.encoded().to_string(),
                        bytes: contents.len() as u64,
                    }
                    .into());
                }
                None
            }
        };

        let descriptor = self
            .backend
            .push_manifest(repo, tag, contents.clone(), &content_type)
            .await?;

        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(
            header::LOCATION,
            location_value(&format!("/v2/{repo}/manifests/{reference}"))?,
        );
        resp_headers.insert(
            &DOCKER_CONTENT_DIGEST,
            HeaderValue::from_str(&descriptor.digest.to_string())?,
        );
        if let Ok(manifest) = wharf_core::Manifest::from_slice(&contents) {
            if let Some(subject) = manifest.subject {
                resp_headers.insert(
                    &OCI_SUBJECT,
                    HeaderValue::from_str(&subject.digest.to_string())?,
                );
            }
        }
        Ok((StatusCode::CREATED, resp_headers, "").into_response())
    }
}

async fn read_body(body: Body) -> Result<Bytes> {
    hyper::body::to_bytes(body)
        .await
        .map_err(|e| Error::Body(e.to_string()))
}

fn descriptor_headers(descriptor: &Descriptor) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        &DOCKER_CONTENT_DIGEST,
        HeaderValue::from_str(&descriptor.digest.to_string())?,
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&descriptor.media_type)?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&descriptor.size.to_string())?,
    );
    Ok(headers)
}

fn upload_headers(repo: &str, id: &str, size: u64) -> Result<HeaderMap> {
    let encoded = encode_upload_id(id);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        location_value(&format!("/v2/{repo}/blobs/uploads/{encoded}"))?,
    );
    headers.insert(&DOCKER_UPLOAD_UUID, HeaderValue::from_str(&encoded)?);
    headers.insert(
        &OCI_CHUNK_MIN_LENGTH,
        HeaderValue::from_str(&CHUNK_MIN_LENGTH.to_string())?,
    );
    if size > 0 {
        headers.insert(&RANGE, HeaderValue::from_str(&format!("0-{}", size - 1))?);
    }
    Ok(headers)
}

fn location_value(location: &str) -> Result<HeaderValue> {
    Ok(HeaderValue::from_str(location)?)
}

/// Upload ids are opaque backend strings; they travel inside URLs
/// base64url-encoded so the backend may use any byte sequence.
fn encode_upload_id(id: &str) -> String {
    BASE64_URL.encode(id)
}

fn decode_upload_id(encoded: &str) -> Result<String> {
    let bytes = BASE64_URL.decode(encoded).map_err(|_| {
        wharf_core::Error::coded_message(
            DistributionErrorCode::BlobUploadUnknown,
            format!("malformed upload id: {encoded:?}"),
        )
    })?;
    String::from_utf8(bytes).map_err(|_| {
        wharf_core::Error::coded_message(
            DistributionErrorCode::BlobUploadUnknown,
            format!("malformed upload id: {encoded:?}"),
        )
        .into()
    })
}

fn content_range(headers: &HeaderMap) -> Result<Option<(u64, u64)>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let s = value.to_str().map_err(|_| {
        wharf_core::Error::coded_message(
            DistributionErrorCode::RangeInvalid,
            "unreadable Content-Range header",
        )
    })?;
    let parsed = s
        .split_once('-')
        .and_then(|(start, end)| Some((u64::from_str(start).ok()?, u64::from_str(end).ok()?)));
    match parsed {
        Some((start, end)) if start <= end => Ok(Some((start, end))),
        _ => Err(wharf_core::Error::coded_message(
            DistributionErrorCode::RangeInvalid,
            format!("malformed Content-Range: {s:?}"),
        )
        .into()),
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Error::Body(e.to_string())
    }
}
