//! `search`: scans each layer's tar member names against a glob or regex and
//! logs the matches. Always delegates every element unchanged.

use async_trait::async_trait;
use color_eyre::{eyre::Context, Result};
use tracing::info;

use crate::{
    cio,
    element::{ByteStream, Consumer, Element},
    filter::retar,
    pipeline::Filter,
    FilterMatch, Filters,
};

/// Scans tar member names within every layer against a set of patterns and
/// logs each match; never drops or rewrites an element.
pub struct Search {
    patterns: Filters,
}

impl Search {
    pub fn new(patterns: Filters) -> Self {
        Self { patterns }
    }
}

#[async_trait]
impl Filter for Search {
    async fn accept(&mut self, element: Element, inner: &mut dyn Consumer) -> Result<()> {
        let Element::Layer { name, layer, handle } = element else {
            return inner.accept(element).await;
        };

        let scratch = cio::collect_tmp(handle)
            .await
            .context("buffer layer for search")?;
        let file = tokio::fs::File::open(scratch.file_path())
            .await
            .context("reopen buffered layer")?;
        let stream: ByteStream = Box::pin(tokio_util::io::ReaderStream::new(file));
        let members = cio::enumerate_tarball(stream)
            .await
            .context("enumerate layer members")?;

        for member in &members {
            if self.patterns.matches(member.as_str()) {
                info!(layer = %layer.digest, member = %member, "search match");
            }
        }

        let handle = retar::into_byte_stream(&scratch).await?;
        inner
            .accept(Element::Layer { name, layer, handle })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipeline::build_chain, Digest, Layer, LayerMediaType};
    use astral_tokio_tar::{Builder, Header};
    use async_tempfile::TempFile;
    use bytes::Bytes;
    use futures_lite::stream;
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<Element>>>);

    #[async_trait]
    impl Consumer for RecordingSink {
        async fn accept(&mut self, element: Element) -> Result<()> {
            self.0.lock().expect("lock").push(element);
            Ok(())
        }

        async fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    async fn build_test_tar(entries: &[(&str, &[u8])]) -> Bytes {
        let scratch = TempFile::new().await.expect("create scratch tar");
        let mut builder = Builder::new(scratch);
        for (path, data) in entries {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, *data)
                .await
                .expect("append entry");
        }
        let scratch = builder.into_inner().await.expect("finish tar");
        scratch.sync_all().await.expect("sync tar");
        Bytes::from(tokio::fs::read(scratch.file_path()).await.expect("read tar bytes"))
    }

    #[tokio::test]
    async fn forwards_layer_bytes_unchanged() {
        let tar_bytes = build_test_tar(&[("etc/passwd", b"root:x:0:0")]).await;
        let digest = Digest::from_hash(vec![0u8; 32]);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: Box<dyn Consumer> = Box::new(RecordingSink(events.clone()));
        let patterns = Filters::parse_glob(["etc/**"]).expect("parse glob");
        let filter: Box<dyn Filter> = Box::new(Search::new(patterns));

        let mut chain = build_chain(vec![filter], sink);
        chain
            .accept(Element::Layer {
                name: "layer".to_string(),
                layer: Layer::builder()
                    .digest(digest)
                    .size(tar_bytes.len() as i64)
                    .media_type(LayerMediaType::default())
                    .build(),
                handle: Box::pin(stream::once(Ok(tar_bytes.clone()))),
            })
            .await
            .expect("accept layer");
        chain.finalize().await.expect("finalize");

        let element = events.lock().expect("lock").remove(0);
        match element {
            Element::Layer { handle, .. } => {
                let forwarded = cio::collect_buf(handle)
                    .await
                    .expect("collect forwarded bytes");
                assert_eq!(forwarded, tar_bytes);
            }
            other => panic!("expected Layer element, got {other:?}"),
        }
    }
}
