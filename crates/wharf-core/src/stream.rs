use core::pin::Pin;
use core::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use pin_project::pin_project;

use crate::model::Descriptor;
use crate::oci_digest::{Digester, OciDigest};
use crate::registry::ByteStream;
use crate::{Error, Result};

/// Wraps a byte stream and verifies its content against an expected digest
/// and, when known, an exact size.
///
/// Every chunk is fed into a hash matching the digest's algorithm. At end of
/// stream the hash and byte count are checked; a mismatch surfaces as a
/// terminal `Err` item before the stream reports exhaustion. When the
/// expected size is known the stream never yields beyond it: excess input is
/// rejected as a size mismatch.
#[pin_project]
pub struct VerifyingStream<S> {
    #[pin]
    inner: S,
    digester: Option<Digester>,
    expected: OciDigest,
    expected_size: Option<u64>,
    seen: u64,
    done: bool,
}

impl<S> VerifyingStream<S>
where
    S: Stream<Item = Result<Bytes>>,
{
    pub fn new(inner: S, expected: OciDigest, expected_size: Option<u64>) -> Self {
        let digester = expected.digester();
        Self {
            inner,
            digester: Some(digester),
            expected,
            expected_size,
            seen: 0,
            done: false,
        }
    }
}

impl<S> Stream for VerifyingStream<S>
where
    S: Stream<Item = Result<Bytes>>,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let seen = *this.seen + bytes.len() as u64;
                if let Some(expected_size) = this.expected_size {
                    if seen > *expected_size {
                        *this.done = true;
                        return Poll::Ready(Some(Err(Error::SizeMismatch {
                            expected: *expected_size,
                            actual: seen,
                        })));
                    }
                }
                if let Some(digester) = this.digester.as_mut() {
                    digester.update(bytes.as_ref());
                }
                *this.seen = seen;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                *this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                *this.done = true;
                if let Some(expected_size) = this.expected_size {
                    if *this.seen != *expected_size {
                        return Poll::Ready(Some(Err(Error::SizeMismatch {
                            expected: *expected_size,
                            actual: *this.seen,
                        })));
                    }
                }
                let digester = this
                    .digester
                    .take()
                    .expect("digester is consumed exactly once at end of stream");
                let actual = digester.finalize();
                if actual != this.expected.encoded() {
                    return Poll::Ready(Some(Err(Error::DigestMismatch {
                        expected: this.expected.encoded().to_string(),
                        actual,
                        bytes: *this.seen,
                    })));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap a boxed byte stream so it verifies against `descriptor`.
pub fn verify_stream(inner: ByteStream, descriptor: &Descriptor) -> ByteStream {
    Box::pin(VerifyingStream::new(
        inner,
        descriptor.digest.clone(),
        Some(descriptor.size),
    ))
}

#[cfg(test)]
mod test {
    use futures::stream;

    use super::*;
    use crate::errors::DistributionErrorCode;
    use crate::registry::collect_stream;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let parts: Vec<Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p)))
            .collect();
        Box::pin(stream::iter(parts))
    }

    #[tokio::test]
    async fn passes_matching_content_through() {
        let descriptor = Descriptor::from_content("application/octet-stream", b"hello world");
        let verified = verify_stream(chunks(&[b"hello ", b"world"]), &descriptor);
        let collected = collect_stream(verified).await.unwrap();
        assert_eq!(collected.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn rejects_digest_mismatch() {
        let descriptor = Descriptor::from_content("application/octet-stream", b"hello world");
        let mut descriptor = descriptor;
        descriptor.size = 5;
        descriptor.digest = OciDigest::from("other".as_bytes());
        let verified = verify_stream(chunks(&[b"hello"]), &descriptor);
        let err = collect_stream(verified).await.unwrap_err();
        match err {
            Error::DigestMismatch {
                expected,
                actual,
                bytes,
            } => {
                assert_eq!(expected, OciDigest::from("other".as_bytes()).encoded());
                assert_eq!(actual, OciDigest::from("hello".as_bytes()).encoded());
                assert_eq!(bytes, 5);
            }
            other => panic!("expected digest mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_short_content() {
        let descriptor = Descriptor::from_content("application/octet-stream", b"hello world");
        let verified = verify_stream(chunks(&[b"hello"]), &descriptor);
        let err = collect_stream(verified).await.unwrap_err();
        assert!(err.is_code(DistributionErrorCode::SizeInvalid));
    }

    #[tokio::test]
    async fn rejects_excess_content_without_yielding_it() {
        let descriptor = Descriptor::from_content("application/octet-stream", b"hello");
        let mut verified = verify_stream(chunks(&[b"hello", b" world"]), &descriptor);

        use futures::StreamExt;
        let first = verified.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), b"hello");
        let second = verified.next().await.unwrap();
        assert!(second.is_err());
        assert!(verified.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_size_still_verifies_digest() {
        let expected = OciDigest::from("abc".as_bytes());
        let verified: ByteStream = Box::pin(VerifyingStream::new(
            chunks(&[b"abc"]),
            expected,
            None,
        ));
        assert_eq!(collect_stream(verified).await.unwrap().as_ref(), b"abc");
    }
}
