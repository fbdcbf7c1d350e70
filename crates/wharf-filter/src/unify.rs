use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join, select, Either};
use futures::pin_mut;
use futures_core::Stream;

use wharf_core::registry::{
    byte_stream, collect_stream, Blob, BlobWriter, ByteStream, EntryStream, Registry,
    RegistryDeleter, RegistryLister, RegistryReader, RegistryWriter,
};
use wharf_core::{Descriptor, DistributionErrorCode, Error, OciDigest, Result};

/// Two registries presented as one.
///
/// Reads race both backends and take the first success; the loser is
/// dropped. Writes and deletes fan out and must succeed on both sides,
/// except that a delete tolerates one side not holding the content (or not
/// supporting deletion at all). Listings are the deduplicated merge of both
/// backends' sorted listings. Tag resolution consults both sides and fails
/// on disagreement rather than silently picking one.
pub struct Unify {
    primary: Arc<dyn Registry>,
    secondary: Arc<dyn Registry>,
}

impl Unify {
    pub fn new(primary: Arc<dyn Registry>, secondary: Arc<dyn Registry>) -> Self {
        Self { primary, secondary }
    }
}

/// First success wins; when both sides fail, the primary's error surfaces.
async fn race<T>(
    fa: impl Future<Output = Result<T>>,
    fb: impl Future<Output = Result<T>>,
) -> Result<T> {
    pin_mut!(fa);
    pin_mut!(fb);
    match select(fa, fb).await {
        Either::Left((Ok(v), _)) => Ok(v),
        Either::Right((Ok(v), _)) => Ok(v),
        Either::Left((Err(primary_err), rest)) => match rest.await {
            Ok(v) => Ok(v),
            Err(_) => Err(primary_err),
        },
        Either::Right((Err(_), rest)) => rest.await,
    }
}

/// Both sides must succeed; the primary's result is returned.
async fn both<T>(
    fa: impl Future<Output = Result<T>>,
    fb: impl Future<Output = Result<T>>,
) -> Result<T> {
    let (ra, rb) = join(fa, fb).await;
    let a = ra?;
    rb?;
    Ok(a)
}

fn delete_tolerable(e: &Error) -> bool {
    matches!(
        e.code(),
        DistributionErrorCode::BlobUnknown
            | DistributionErrorCode::ManifestUnknown
            | DistributionErrorCode::NameUnknown
            | DistributionErrorCode::Unsupported
    )
}

/// Fan-out delete: best-effort on each side, success if at least one side
/// deleted and the other at worst didn't have the content.
async fn delete_both(
    fa: impl Future<Output = Result<()>>,
    fb: impl Future<Output = Result<()>>,
) -> Result<()> {
    match join(fa, fb).await {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(e)) if delete_tolerable(&e) => Ok(()),
        (Err(e), Ok(())) if delete_tolerable(&e) => Ok(()),
        (Err(e), _) => Err(e),
        (_, Err(e)) => Err(e),
    }
}

fn not_found(e: &Error) -> bool {
    matches!(
        e.code(),
        DistributionErrorCode::ManifestUnknown | DistributionErrorCode::NameUnknown
    )
}

#[async_trait]
impl RegistryReader for Unify {
    async fn get_blob(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        race(
            self.primary.get_blob(repo, digest),
            self.secondary.get_blob(repo, digest),
        )
        .await
    }

    async fn get_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Blob> {
        race(
            self.primary.get_manifest(repo, digest),
            self.secondary.get_manifest(repo, digest),
        )
        .await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<Blob> {
        race(self.primary.get_tag(repo, tag), self.secondary.get_tag(repo, tag)).await
    }

    async fn resolve_blob(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        race(
            self.primary.resolve_blob(repo, digest),
            self.secondary.resolve_blob(repo, digest),
        )
        .await
    }

    async fn resolve_manifest(&self, repo: &str, digest: &OciDigest) -> Result<Descriptor> {
        race(
            self.primary.resolve_manifest(repo, digest),
            self.secondary.resolve_manifest(repo, digest),
        )
        .await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        let (ra, rb) = join(
            self.primary.resolve_tag(repo, tag),
            self.secondary.resolve_tag(repo, tag),
        )
        .await;
        match (ra, rb) {
            (Ok(a), Ok(b)) => {
                if a.digest == b.digest {
                    Ok(a)
                } else {
                    Err(Error::coded_message(
                        DistributionErrorCode::Unknown,
                        format!(
                            "tag {tag:?} in {repo:?} disagrees between unified registries: {} vs {}",
                            a.digest, b.digest
                        ),
                    ))
                }
            }
            (Ok(a), Err(e)) if not_found(&e) => Ok(a),
            (Err(e), Ok(b)) if not_found(&e) => Ok(b),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    }
}

#[async_trait]
impl RegistryWriter for Unify {
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        content: ByteStream,
    ) -> Result<Descriptor> {
        // the stream is single-use; buffer it so both sides see the bytes
        let content = collect_stream(content).await?;
        both(
            self.primary.push_blob(repo, descriptor, byte_stream(content.clone())),
            self.secondary.push_blob(repo, descriptor, byte_stream(content)),
        )
        .await
    }

    async fn push_blob_chunked(
        &self,
        repo: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        let (wa, wb) = join(
            self.primary.push_blob_chunked(repo, chunk_size),
            self.secondary.push_blob_chunked(repo, chunk_size),
        )
        .await;
        Ok(Box::new(UnifyBlobWriter { a: wa?, b: wb? }))
    }

    async fn resume_blob_chunked(
        &self,
        repo: &str,
        session_id: &str,
        chunk_size: Option<usize>,
    ) -> Result<Box<dyn BlobWriter>> {
        let (id_a, id_b) = session_id.split_once(' ').ok_or_else(|| {
            Error::coded_message(
                DistributionErrorCode::BlobUploadUnknown,
                format!("malformed unified upload session id: {session_id:?}"),
            )
        })?;
        let (wa, wb) = join(
            self.primary.resume_blob_chunked(repo, id_a, chunk_size),
            self.secondary.resume_blob_chunked(repo, id_b, chunk_size),
        )
        .await;
        Ok(Box::new(UnifyBlobWriter { a: wa?, b: wb? }))
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &OciDigest,
    ) -> Result<Descriptor> {
        both(
            self.primary.mount_blob(from_repo, to_repo, digest),
            self.secondary.mount_blob(from_repo, to_repo, digest),
        )
        .await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        both(
            self.primary.push_manifest(repo, tag, contents.clone(), media_type),
            self.secondary.push_manifest(repo, tag, contents, media_type),
        )
        .await
    }
}

#[async_trait]
impl RegistryDeleter for Unify {
    async fn delete_blob(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        delete_both(
            self.primary.delete_blob(repo, digest),
            self.secondary.delete_blob(repo, digest),
        )
        .await
    }

    async fn delete_manifest(&self, repo: &str, digest: &OciDigest) -> Result<()> {
        delete_both(
            self.primary.delete_manifest(repo, digest),
            self.secondary.delete_manifest(repo, digest),
        )
        .await
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        delete_both(
            self.primary.delete_tag(repo, tag),
            self.secondary.delete_tag(repo, tag),
        )
        .await
    }
}

impl RegistryLister for Unify {
    fn repositories(&self, start_after: Option<String>) -> EntryStream<String> {
        merge_sorted(
            self.primary.repositories(start_after.clone()),
            self.secondary.repositories(start_after),
            Ord::cmp,
        )
    }

    fn tags(&self, repo: &str, start_after: Option<String>) -> EntryStream<String> {
        merge_sorted(
            self.primary.tags(repo, start_after.clone()),
            self.secondary.tags(repo, start_after),
            Ord::cmp,
        )
    }

    fn referrers(
        &self,
        repo: &str,
        digest: &OciDigest,
        artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        merge_sorted(
            self.primary.referrers(repo, digest, artifact_type.clone()),
            self.secondary.referrers(repo, digest, artifact_type),
            |a, b| a.digest.cmp(&b.digest),
        )
    }
}

struct UnifyBlobWriter {
    a: Box<dyn BlobWriter>,
    b: Box<dyn BlobWriter>,
}

#[async_trait]
impl BlobWriter for UnifyBlobWriter {
    fn id(&self) -> String {
        format!("{} {}", self.a.id(), self.b.id())
    }

    fn size(&self) -> u64 {
        self.a.size()
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.a.write(data.clone()).await?;
        self.b.write(data).await
    }

    async fn commit(self: Box<Self>, digest: &OciDigest) -> Result<OciDigest> {
        let this = *self;
        both(this.a.commit(digest), this.b.commit(digest)).await
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        let this = *self;
        let (ra, rb) = join(this.a.cancel(), this.b.cancel()).await;
        ra.and(rb)
    }

    async fn close(self: Box<Self>) -> Result<String> {
        let this = *self;
        let (ra, rb) = join(this.a.close(), this.b.close()).await;
        Ok(format!("{} {}", ra?, rb?))
    }
}

/// Lazily merge two sorted listings, dropping duplicates. Comparison-equal
/// items from both sides collapse to the primary's.
fn merge_sorted<T: Send + Unpin + 'static>(
    a: EntryStream<T>,
    b: EntryStream<T>,
    cmp: fn(&T, &T) -> Ordering,
) -> EntryStream<T> {
    Box::pin(MergeSorted {
        a,
        b,
        peek_a: None,
        peek_b: None,
        a_done: false,
        b_done: false,
        failed: false,
        cmp,
    })
}

struct MergeSorted<T> {
    a: EntryStream<T>,
    b: EntryStream<T>,
    peek_a: Option<T>,
    peek_b: Option<T>,
    a_done: bool,
    b_done: bool,
    failed: bool,
    cmp: fn(&T, &T) -> Ordering,
}

impl<T: Unpin> Stream for MergeSorted<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(None);
        }
        if this.peek_a.is_none() && !this.a_done {
            match this.a.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(v))) => this.peek_a = Some(v),
                Poll::Ready(Some(Err(e))) => {
                    this.failed = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => this.a_done = true,
                Poll::Pending => {}
            }
        }
        if this.peek_b.is_none() && !this.b_done {
            match this.b.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(v))) => this.peek_b = Some(v),
                Poll::Ready(Some(Err(e))) => {
                    this.failed = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => this.b_done = true,
                Poll::Pending => {}
            }
        }
        // ordering needs both heads before either can be emitted
        if (this.peek_a.is_none() && !this.a_done) || (this.peek_b.is_none() && !this.b_done) {
            return Poll::Pending;
        }
        match (this.peek_a.is_some(), this.peek_b.is_some()) {
            (true, true) => {
                let ord = (this.cmp)(
                    this.peek_a.as_ref().expect("peeked"),
                    this.peek_b.as_ref().expect("peeked"),
                );
                match ord {
                    Ordering::Less => Poll::Ready(this.peek_a.take().map(Ok)),
                    Ordering::Greater => Poll::Ready(this.peek_b.take().map(Ok)),
                    Ordering::Equal => {
                        this.peek_b = None;
                        Poll::Ready(this.peek_a.take().map(Ok))
                    }
                }
            }
            (true, false) => Poll::Ready(this.peek_a.take().map(Ok)),
            (false, true) => Poll::Ready(this.peek_b.take().map(Ok)),
            (false, false) => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod test {
    use wharf_core::model::media_type;
    use wharf_core::registry::collect_entries;
    use wharf_mem::MemRegistry;

    use super::*;

    async fn seed_blob(mem: &MemRegistry, repo: &str, content: &'static [u8]) -> Descriptor {
        let desc = Descriptor::from_content(media_type::OCTET_STREAM, content);
        mem.push_blob(repo, &desc, byte_stream(Bytes::from_static(content)))
            .await
            .unwrap()
    }

    async fn seed_manifest(mem: &MemRegistry, repo: &str, tag: &str, note: &str) -> Descriptor {
        let config = seed_blob(mem, repo, b"{}").await;
        let body = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "mediaType": media_type::IMAGE_MANIFEST,
                "config": config,
                "layers": [],
                "annotations": {"note": note},
            }))
            .unwrap(),
        );
        mem.push_manifest(repo, Some(tag), body, media_type::IMAGE_MANIFEST)
            .await
            .unwrap()
    }

    fn unify(a: &MemRegistry, b: &MemRegistry) -> Unify {
        Unify::new(Arc::new(a.clone()), Arc::new(b.clone()))
    }

    #[tokio::test]
    async fn reads_hit_either_backend() {
        let a = MemRegistry::new();
        let b = MemRegistry::new();
        let only_a = seed_blob(&a, "r", b"in-a").await;
        let only_b = seed_blob(&b, "r", b"in-b").await;

        let u = unify(&a, &b);
        assert_eq!(
            u.get_blob("r", &only_a.digest).await.unwrap().collect().await.unwrap().as_ref(),
            b"in-a"
        );
        assert_eq!(
            u.get_blob("r", &only_b.digest).await.unwrap().collect().await.unwrap().as_ref(),
            b"in-b"
        );
        let absent = OciDigest::from("absent".as_bytes());
        assert!(u.get_blob("r", &absent).await.is_err());
    }

    #[tokio::test]
    async fn writes_land_on_both() {
        let a = MemRegistry::new();
        let b = MemRegistry::new();
        let u = unify(&a, &b);

        let desc = Descriptor::from_content(media_type::OCTET_STREAM, b"both");
        u.push_blob("r", &desc, byte_stream(Bytes::from_static(b"both")))
            .await
            .unwrap();
        assert!(a.resolve_blob("r", &desc.digest).await.is_ok());
        assert!(b.resolve_blob("r", &desc.digest).await.is_ok());
    }

    #[tokio::test]
    async fn chunked_writer_fans_out() {
        let a = MemRegistry::new();
        let b = MemRegistry::new();
        let u = unify(&a, &b);

        let mut w = u.push_blob_chunked("r", None).await.unwrap();
        w.write(Bytes::from_static(b"abc")).await.unwrap();
        let id = w.close().await.unwrap();

        let mut w = u.resume_blob_chunked("r", &id, None).await.unwrap();
        w.write(Bytes::from_static(b"def")).await.unwrap();
        let digest = OciDigest::from("abcdef".as_bytes());
        w.commit(&digest).await.unwrap();

        for side in [&a, &b] {
            let blob = side.get_blob("r", &digest).await.unwrap();
            assert_eq!(blob.collect().await.unwrap().as_ref(), b"abcdef");
        }
    }

    #[tokio::test]
    async fn tag_disagreement_is_a_conflict() {
        let a = MemRegistry::new();
        let b = MemRegistry::new();
        seed_manifest(&a, "r", "t", "from-a").await;
        seed_manifest(&b, "r", "t", "from-b").await;

        let u = unify(&a, &b);
        let err = u.resolve_tag("r", "t").await.unwrap_err();
        assert!(err.to_string().contains("disagrees"));

        // agreement resolves fine
        let a2 = MemRegistry::new();
        let b2 = MemRegistry::new();
        let d1 = seed_manifest(&a2, "r", "t", "same").await;
        let d2 = seed_manifest(&b2, "r", "t", "same").await;
        assert_eq!(d1.digest, d2.digest);
        let u = unify(&a2, &b2);
        assert_eq!(u.resolve_tag("r", "t").await.unwrap().digest, d1.digest);

        // one-sided tags resolve from the side that has them
        let c = MemRegistry::new();
        let u = unify(&a2, &c);
        assert_eq!(u.resolve_tag("r", "t").await.unwrap().digest, d1.digest);
    }

    #[tokio::test]
    async fn listings_merge_sorted_and_dedupe() {
        let a = MemRegistry::new();
        let b = MemRegistry::new();
        for repo in ["alpha", "mid"] {
            seed_blob(&a, repo, b"x").await;
        }
        for repo in ["mid", "zoo"] {
            seed_blob(&b, repo, b"x").await;
        }

        let u = unify(&a, &b);
        let repos = collect_entries(u.repositories(None)).await.unwrap();
        assert_eq!(repos, vec!["alpha", "mid", "zoo"]);
    }

    #[tokio::test]
    async fn delete_tolerates_one_missing_side() {
        let a = MemRegistry::new();
        let b = MemRegistry::new();
        let desc = seed_blob(&a, "r", b"only-a").await;
        seed_blob(&b, "r", b"other").await;

        let u = unify(&a, &b);
        u.delete_blob("r", &desc.digest).await.unwrap();
        assert!(a.resolve_blob("r", &desc.digest).await.is_err());

        // both sides missing is still an error
        let err = u.delete_blob("r", &desc.digest).await.unwrap_err();
        assert!(err.is_code(DistributionErrorCode::BlobUnknown));
    }
}
