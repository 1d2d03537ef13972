//! The pipeline runtime: threads a source through a filter chain to a sink.

use async_trait::async_trait;
use color_eyre::Result;

use crate::element::{Consumer, Element};
use crate::Digest;

/// A source of image elements. Implementations own the emit loop: they decide
/// when to call `want`/`accept` on the consumer chain and in what order,
/// subject to the rule that layers are emitted in apply order.
///
/// Unlike [`Consumer`], this trait is consumed by concrete call sites (the
/// pipeline driver in [`run`]) rather than boxed, so it does not need to be
/// object safe; each concrete source (registry, daemon, tarball) is driven
/// directly by name.
#[async_trait]
pub trait Source: Send {
    /// Drive this source's elements into `consumer`, in their entirety. Layers
    /// are emitted in apply order; `consumer.want(digest)` is checked before
    /// pulling each layer's bytes.
    async fn emit(self: Box<Self>, consumer: &mut dyn Consumer) -> Result<()>;
}

/// A filter wraps another consumer and, by default, delegates every call
/// unchanged. Concrete filters override `accept` to transform the
/// element and implement their own buffering/finalize behavior as needed.
#[async_trait]
pub trait Filter: Send {
    /// Transform (or drop, or buffer) an element before delegating it to `inner`.
    async fn accept(&mut self, element: Element, inner: &mut dyn Consumer) -> Result<()>;

    /// Whether this filter wants the given layer, checked before `inner.want`.
    /// Default: defer entirely to `inner`.
    async fn want(&mut self, digest: &Digest, inner: &mut dyn Consumer) -> Result<bool> {
        inner.want(digest).await
    }

    /// Flush any state this filter accumulated, then delegate to `inner.finalize()`.
    /// Default: no state to flush, just delegate.
    async fn finalize(&mut self, inner: &mut dyn Consumer) -> Result<()> {
        inner.finalize().await
    }
}

/// Adapts a `(Filter, inner consumer)` pair into a single `Consumer`, so that
/// a chain of filters terminating in a sink can be folded into one boxed
/// consumer the source can drive uniformly.
struct Chained {
    filter: Box<dyn Filter>,
    inner: Box<dyn Consumer>,
}

#[async_trait]
impl Consumer for Chained {
    async fn accept(&mut self, element: Element) -> Result<()> {
        self.filter.accept(element, self.inner.as_mut()).await
    }

    async fn want(&mut self, digest: &Digest) -> Result<bool> {
        self.filter.want(digest, self.inner.as_mut()).await
    }

    async fn finalize(&mut self) -> Result<()> {
        self.filter.finalize(self.inner.as_mut()).await
    }
}

/// Build one consumer out of an ordered filter chain and a terminal sink.
/// `filters[0]` is closest to the source; the sink is innermost.
pub fn build_chain(filters: Vec<Box<dyn Filter>>, sink: Box<dyn Consumer>) -> Box<dyn Consumer> {
    filters
        .into_iter()
        .rev()
        .fold(sink, |inner, filter| Box::new(Chained { filter, inner }))
}

/// Run a source through a filter chain into a sink. This is the single entry
/// point a CLI command needs: build the chain with [`build_chain`], then call
/// this with the source.
pub async fn run(source: Box<dyn Source>, mut consumer: Box<dyn Consumer>) -> Result<()> {
    source.emit(consumer.as_mut()).await?;
    consumer.finalize().await
}
