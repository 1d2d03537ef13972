//! Streaming digest computation.
//!
//! Filters that rewrite layer bytes (`normalize-timestamps`, `exclude`) and sinks
//! that upload or write blobs (the registry pusher, the tarball writer) both need
//! the SHA-256 of a stream they're simultaneously passing through somewhere else.
//! [`HashingStream`] computes it inline instead of buffering the whole blob first.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_lite::Stream;
use pin_project_lite::pin_project;
use sha2::{Digest as _, Sha256};
use tokio::sync::oneshot;

use crate::transform::Chunk;
use crate::Digest;

pin_project! {
    /// Wraps a byte stream, hashing every chunk as it passes through.
    /// Once the stream is exhausted, the final digest is sent on the paired
    /// [`oneshot::Receiver`] returned by [`hashing`].
    pub struct HashingStream<S> {
        #[pin]
        inner: S,
        hasher: Option<Sha256>,
        size: u64,
        sink: Option<oneshot::Sender<(Digest, u64)>>,
    }
}

/// Wrap a stream so its SHA-256 and byte count are computed as it is consumed.
/// The returned receiver resolves once the stream has been fully drained;
/// awaiting it before the stream is exhausted will hang, so callers must drain
/// the stream to completion (e.g. by writing it to a sink) before awaiting.
pub fn hashing<S>(stream: S) -> (HashingStream<S>, oneshot::Receiver<(Digest, u64)>)
where
    S: Stream<Item = Chunk>,
{
    let (tx, rx) = oneshot::channel();
    (
        HashingStream {
            inner: stream,
            hasher: Some(Sha256::new()),
            size: 0,
            sink: Some(tx),
        },
        rx,
    )
}

impl<S> Stream for HashingStream<S>
where
    S: Stream<Item = Chunk>,
{
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                *this.size += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                if let (Some(hasher), Some(sink)) = (this.hasher.take(), this.sink.take()) {
                    let hash = hasher.finalize().to_vec();
                    let _ = sink.send((Digest::from_hash(hash), *this.size));
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Hash a complete, already-in-memory buffer. Used for small blobs (configs)
/// where streaming overhead isn't worth it.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest::from_hash(hasher.finalize().to_vec())
}
