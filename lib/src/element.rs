//! The image element model and the uniform consumer contract.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use futures_lite::Stream;

use crate::{Digest, Layer};

/// A boxed byte stream, the handle an element's bytes are delivered through.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// One unit of data flowing through the pipeline: either the image config or a
/// layer tar.
pub enum Element {
    /// The image configuration JSON blob.
    Config {
        /// Path-like name this element should occupy at the sink (e.g. `<sha256>.json`).
        name: String,
        /// The digest of the config bytes as emitted by the source (or as
        /// recomputed by a filter that has rewritten it).
        digest: Digest,
        /// The raw config JSON bytes.
        bytes: Bytes,
    },
    /// A layer tar, uncompressed on the pipeline (sources decompress on ingress;
    /// sinks choose their own compression on egress).
    Layer {
        /// Path-like name this element should occupy at the sink.
        name: String,
        /// The layer's declared diffID (SHA-256 of the uncompressed tar).
        layer: Layer,
        /// A stream yielding the uncompressed tar bytes.
        handle: ByteStream,
    },
}

impl Element {
    /// The element's current name.
    pub fn name(&self) -> &str {
        match self {
            Element::Config { name, .. } => name,
            Element::Layer { name, .. } => name,
        }
    }

    /// Whether this element is a Config.
    pub fn is_config(&self) -> bool {
        matches!(self, Element::Config { .. })
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Element::Config { name, digest, .. } => f
                .debug_struct("Element::Config")
                .field("name", name)
                .field("digest", digest)
                .finish(),
            Element::Layer { name, layer, .. } => f
                .debug_struct("Element::Layer")
                .field("name", name)
                .field("digest", &layer.digest)
                .finish(),
        }
    }
}

/// The uniform consumer contract shared by sinks and filters.
///
/// A filter wraps another `Consumer` and, by default, delegates every call
/// unchanged; see [`crate::pipeline::Filter`]. Object safety (`Box<dyn Consumer>`)
/// is required because the filter chain is assembled at runtime from CLI flags,
/// unlike the closed set of source backends.
#[async_trait]
pub trait Consumer: Send {
    /// Accept one element. Implementations that do not wish to forward an
    /// element (because they dropped or buffered it) simply return `Ok(())`
    /// without delegating.
    async fn accept(&mut self, element: Element) -> Result<()>;

    /// The sink's layer admission check: called by a source before it pulls a
    /// layer's bytes, so that sinks that already hold the blob (registry dedup)
    /// can signal no interest and let the source skip the fetch entirely.
    /// Default: always want the layer.
    async fn want(&mut self, _digest: &Digest) -> Result<bool> {
        Ok(true)
    }

    /// Called exactly once after the source finishes emitting elements. Must
    /// flush any buffered/accumulated state (e.g. a mutating filter's patched
    /// Config) by calling through to `accept` on whatever it wraps *before*
    /// delegating its own `finalize`, so that the sink's finalize (which
    /// actually writes the manifest) is the innermost call to complete.
    async fn finalize(&mut self) -> Result<()>;
}
