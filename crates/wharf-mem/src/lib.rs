//! # Wharf Mem
//!
//! An in-memory registry implementing the full wharf registry interface.
//! It exists to back tests — both as a lightweight registry for the HTTP
//! server and as a reference oracle for other implementations — but is a
//! complete, verifying content store in its own right.
//!
//! One instance scopes to one registry. All state lives behind a single
//! mutex; write operations buffer caller-supplied streams fully before
//! taking the lock, so the lock is never held across caller I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use wharf_core::model::media_type;
use wharf_core::registry::{
    collect_stream, entry_stream, error_stream, Blob, BlobWriter, ByteStream, EntryStream,
    RegistryDeleter, RegistryLister, RegistryReader, RegistryWriter,
};
use wharf_core::reference::is_valid_repository;
use wharf_core::{Descriptor, DistributionErrorCode, Error, Manifest, OciDigest, Result};

mod writer;
use writer::MemBlobWriter;

#[derive(Clone, Debug)]
struct StoredManifest {
    descriptor: Descriptor,
    content: Bytes,
    subject: Option<OciDigest>,
    /// Descriptor listed by the referrers endpoint: the manifest descriptor
    /// enriched with artifact type and annotations.
    referrer: Descriptor,
}

#[derive(Default, Debug)]
struct Repo {
    blobs: BTreeMap<OciDigest, Bytes>,
    manifests: BTreeMap<OciDigest, StoredManifest>,
    tags: BTreeMap<String, Descriptor>,
}

#[derive(Default)]
pub(crate) struct UploadSession {
    pub(crate) repo: String,
    pub(crate) buf: BytesMut,
}

#[derive(Default)]
pub(crate) struct MemState {
    repos: BTreeMap<String, Repo>,
    pub(crate) sessions: HashMap<String, UploadSession>,
}

/// The in-memory registry. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemRegistry {
    pub(crate) state: Arc<Mutex<MemState>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_repo<T>(&self, repo: &str, f: impl FnOnce(&Repo) -> Result<T>) -> Result<T> {
        check_repo_name(repo)?;
        let state = self.lock();
        match state.repos.get(repo) {
            Some(r) => f(r),
            None => Err(Error::name_unknown(repo)),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("registry lock is never poisoned")
    }

    /// Verify content against a claimed digest and size, then store it.
    pub(crate) fn insert_blob(
        &self,
        repo: &str,
        digest: &OciDigest,
        content: Bytes,
    ) -> Result<Descriptor> {
        check_repo_name(repo)?;
        let mut digester = digest.digester();
        digester.update(&content);
        let actual = digester.finalize();
        if actual != digest.encoded() {
            return Err(Error::DigestMismatch {
                expected: digest.encoded().to_string(),
                actual,
                bytes: content.len() as u64,
            });
        }
        let descriptor = Descriptor::new(media_type::OCTET_STREAM, content.len() as u64, digest.clone());
        let mut state = self.lock();
        let r = state.repos.entry(repo.to_string()).or_default();
        r.blobs.insert(digest.clone(), content);
        Ok(descriptor)
    }
}

fn check_repo_name(repo: &str) -> Result<()> {
    if !is_valid_repository(repo) {
        return Err(Error::coded_message(
            DistributionErrorCode::NameInvalid,
            format!("invalid repository name: {repo:?}"),
        ));
    }
    Ok(())
}

#[async_trait]
impl RegistryReader for MemRegistry {
    async fn get_blob(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.with_repo(repo, |r| {
            let content = r
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| Error::blob_unknown(digest))?;
            let descriptor =
                Descriptor::new(media_type::OCTET_STREAM, content.len() as u64, digest.clone());
            Ok(Blob::from_bytes(descriptor, content))
        })
    }

    async fn get_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        self.with_repo(repo, |r| {
            let m = r
                .manifests
                .get(digest)
                .ok_or_else(|| Error::manifest_unknown(digest))?;
            Ok(Blob::from_bytes(m.descriptor.clone(), m.content.clone()))
        })
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<Blob> {
        self.with_repo(repo, |r| {
            let descriptor = r
                .tags
                .get(tag)
                .ok_or_else(|| Error::manifest_unknown(tag))?;
            let m = r
                .manifests
                .get(&descriptor.digest)
                .ok_or_else(|| Error::manifest_unknown(tag))?;
            Ok(Blob::from_bytes(m.descriptor.clone(), m.content.clone()))
        })
    }

    async fn resolve_blob(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.with_repo(repo, |r| {
            let content = r
                .blobs
                .get(digest)
                .ok_or_else(|| Error::blob_unknown(digest))?;
            Ok(Descriptor::new(
                media_type::OCTET_STREAM,
                content.len() as u64,
                digest.clone(),
            ))
        })
    }

    async fn resolve_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        self.with_repo(repo, |r| {
            r.manifests
                .get(digest)
                .map(|m| m.descriptor.clone())
                .ok_or_else(|| Error::manifest_unknown(digest))
        })
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        self.with_repo(repo, |r| {
            r.tags
                .get(tag)
                .cloned()
                .ok_or_else(|| Error::manifest_unknown(tag))
        })
    }
}

#[async_trait]
impl RegistryWriter for MemRegistry {
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        content: ByteStream,
    ) -> Result<Descriptor> {
        check_repo_name(repo)?;
        // buffer fully before taking the lock
        let content = collect_stream(content).await?;
        if content.len() as u64 != descriptor.size {
            return Err(Error::SizeMismatch {
                expected: descriptor.size,
                actual: content.len() as u64,
            });
        }
        self.insert_blob(repo, &descriptor.digest, content)
    }

    async fn push_blob_chunked(
        &self,
        repo: &str,
        _chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        check_repo_name(repo)?;
        let id = uuid::Uuid::new_v4().to_string();
        let mut state = self.lock();
        state.sessions.insert(
            id.clone(),
            UploadSession {
                repo: repo.to_string(),
                buf: BytesMut::new(),
            },
        );
        Ok(Box::new(MemBlobWriter::new(self.clone(), repo.to_string(), id, BytesMut::new())))
    }

    async fn resume_blob_chunked(
        &self,
        repo: &str,
        session_id: &str,
        _chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        check_repo_name(repo)?;
        let mut state = self.lock();
        let session = state.sessions.get_mut(session_id).ok_or_else(|| {
            Error::coded_message(
                DistributionErrorCode::BlobUploadUnknown,
                format!("unknown upload session: {session_id}"),
            )
        })?;
        if session.repo != repo {
            return Err(Error::coded_message(
                DistributionErrorCode::BlobUploadUnknown,
                format!("upload session {session_id} does not belong to {repo}"),
            ));
        }
        let buf = std::mem::take(&mut session.buf);
        Ok(Box::new(MemBlobWriter::new(
            self.clone(),
            repo.to_string(),
            session_id.to_string(),
            buf,
        )))
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        check_repo_name(from_repo)?;
        check_repo_name(to_repo)?;
        let mut state = self.lock();
        let content = state
            .repos
            .get(from_repo)
            .and_then(|r| r.blobs.get(digest))
            .cloned()
            .ok_or_else(|| Error::blob_unknown(digest))?;
        let descriptor =
            Descriptor::new(media_type::OCTET_STREAM, content.len() as u64, digest.clone());
        let r = state.repos.entry(to_repo.to_string()).or_default();
        r.blobs.insert(digest.clone(), content);
        Ok(descriptor)
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        contents: Bytes,
        content_type: &str,
    ) -> Result<Descriptor> {
        check_repo_name(repo)?;
        if !media_type::is_manifest(content_type) {
            return Err(Error::coded_message(
                DistributionErrorCode::ManifestInvalid,
                format!("unsupported manifest media type: {content_type}"),
            ));
        }
        if let Some(tag) = tag {
            if !wharf_core::reference::is_valid_tag(tag) {
                return Err(Error::coded_message(
                    DistributionErrorCode::ManifestInvalid,
                    format!("invalid tag: {tag:?}"),
                ));
            }
        }
        let manifest = Manifest::from_slice(&contents)?;

        let digest = OciDigest::from(contents.as_ref());
        let descriptor = Descriptor::new(content_type, contents.len() as u64, digest.clone());
        let mut referrer = descriptor.clone();
        referrer.artifact_type = manifest.referrer_artifact_type().map(String::from);
        referrer.annotations = manifest.annotations.clone();

        let mut state = self.lock();
        let r = state.repos.entry(repo.to_string()).or_default();

        // a manifest may only reference content that is already present in
        // the same repository
        for d in manifest.references() {
            let present = if manifest.is_index() {
                r.manifests.contains_key(&d.digest)
            } else {
                r.blobs.contains_key(&d.digest)
            };
            if !present {
                return Err(Error::coded_message(
                    DistributionErrorCode::ManifestBlobUnknown,
                    format!("manifest references unknown content: {}", d.digest),
                ));
            }
        }

        r.manifests.insert(
            digest.clone(),
            StoredManifest {
                descriptor: descriptor.clone(),
                content: contents,
                subject: manifest.subject.as_ref().map(|s| s.digest.clone()),
                referrer,
            },
        );
        if let Some(tag) = tag {
            r.tags.insert(tag.to_string(), descriptor.clone());
        }
        Ok(descriptor)
    }
}

#[async_trait]
impl RegistryDeleter for MemRegistry {
    async fn delete_blob(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        check_repo_name(repo)?;
        let mut state = self.lock();
        let r = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| Error::name_unknown(repo))?;
        r.blobs
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| Error::blob_unknown(digest))
    }

    async fn delete_manifest(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        check_repo_name(repo)?;
        let mut state = self.lock();
        let r = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| Error::name_unknown(repo))?;
        if r.manifests.remove(digest).is_none() {
            return Err(Error::manifest_unknown(digest));
        }
        // drop tags that would otherwise dangle
        r.tags.retain(|_, d| &d.digest != digest);
        Ok(())
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        check_repo_name(repo)?;
        let mut state = self.lock();
        let r = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| Error::name_unknown(repo))?;
        r.tags
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| Error::manifest_unknown(tag))
    }
}

impl RegistryLister for MemRegistry {
    fn repositories(&self, start_after: Option<String>) -> EntryStream<String> {
        let state = self.lock();
        let repos: Vec<String> = state
            .repos
            .keys()
            .filter(|k| match &start_after {
                Some(last) => k.as_str() > last.as_str(),
                None => true,
            })
            .cloned()
            .collect();
        entry_stream(repos)
    }

    fn tags(&self, repo: &str, start_after: Option<String>) -> EntryStream<String> {
        match self.with_repo(repo, |r| {
            Ok(r.tags
                .keys()
                .filter(|k| match &start_after {
                    Some(last) => k.as_str() > last.as_str(),
                    None => true,
                })
                .cloned()
                .collect::<Vec<_>>())
        }) {
            Ok(tags) => entry_stream(tags),
            Err(e) => error_stream(e),
        }
    }

    fn referrers(
        &self,
        repo: &str,
        digest: &OciDigest,
        artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        match self.with_repo(repo, |r| {
            Ok(r.manifests
                .values()
                .filter(|m| m.subject.as_ref() == Some(digest))
                .filter(|m| match &artifact_type {
                    Some(at) => m.referrer.artifact_type.as_deref() == Some(at.as_str()),
                    None => true,
                })
                .map(|m| m.referrer.clone())
                .collect::<Vec<_>>())
        }) {
            Ok(referrers) => entry_stream(referrers),
            Err(e) => error_stream(e),
        }
    }
}
