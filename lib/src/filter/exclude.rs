//! `exclude`: drops tar members matching a set of glob patterns from every
//! layer, recomputing the layer's digest and patching the buffered config to
//! match -- otherwise identical to `normalize-timestamps`.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::Context, Result};
use tracing::info;

use crate::{
    digest,
    element::{Consumer, Element},
    filter::retar::{self, Keep},
    manifest::ImageConfig,
    pipeline::Filter,
    Digest, FilterMatch, Filters, Layer,
};

/// Drops tar members whose path matches any of a set of glob patterns from
/// every layer it sees, then patches the buffered config's diffIDs once every
/// layer has passed through.
pub struct Exclude {
    patterns: Filters,
    renamed: HashMap<Digest, Digest>,
    config: Option<Element>,
}

impl Exclude {
    /// `patterns` are double-star-capable globs matched against each tar
    /// member's path within the layer.
    pub fn new(patterns: Filters) -> Self {
        Self {
            patterns,
            renamed: HashMap::new(),
            config: None,
        }
    }
}

#[async_trait]
impl Filter for Exclude {
    async fn accept(&mut self, element: Element, inner: &mut dyn Consumer) -> Result<()> {
        match element {
            Element::Config { .. } => {
                self.config = Some(element);
                Ok(())
            }
            Element::Layer { layer, handle, .. } => {
                let old_digest = layer.digest.clone();
                let patterns = &self.patterns;
                let (scratch, new_digest, new_size) = retar::rewrite(
                    handle,
                    |path| {
                        if patterns.matches(path) {
                            Keep::No
                        } else {
                            Keep::Yes
                        }
                    },
                    None,
                )
                .await
                .context("filter layer members")?;
                self.renamed.insert(old_digest.clone(), new_digest.clone());

                let new_layer = Layer::builder()
                    .digest(new_digest.clone())
                    .size(new_size)
                    .media_type(layer.media_type)
                    .build();
                let handle = retar::into_byte_stream(&scratch).await?;

                info!(old = %old_digest, new = %new_digest, "excluded members from layer");
                inner
                    .accept(Element::Layer {
                        name: new_digest.tarball_filename(),
                        layer: new_layer,
                        handle,
                    })
                    .await
            }
        }
    }

    async fn finalize(&mut self, inner: &mut dyn Consumer) -> Result<()> {
        if let Some(Element::Config { bytes, .. }) = self.config.take() {
            let mut config = ImageConfig::parse(&bytes).context("parse buffered config")?;
            for (old, new) in &self.renamed {
                config.replace_diff_id(old, new);
            }
            let new_bytes = config.to_bytes().context("serialize patched config")?;
            let new_digest = digest::hash_bytes(&new_bytes);
            inner
                .accept(Element::Config {
                    name: format!("{}.json", new_digest.as_hex()),
                    digest: new_digest,
                    bytes: Bytes::from(new_bytes),
                })
                .await?;
        }
        inner.finalize().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{element::ByteStream, pipeline::build_chain, LayerMediaType};
    use astral_tokio_tar::{Builder, Header};
    use async_tempfile::TempFile;
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

    fn layer_stream(bytes: Bytes) -> ByteStream {
        Box::pin(stream::once(Ok(bytes)))
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
    async fn drops_matching_members_and_renames_layer() {
        let tar_bytes = build_test_tar(&[
            ("keep.txt", b"keep me"),
            ("secrets/token.txt", b"drop me"),
        ])
        .await;
        let layer_digest = digest::hash_bytes(&tar_bytes);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: Box<dyn Consumer> = Box::new(RecordingSink(events.clone()));
        let patterns = Filters::parse_glob(["secrets/**"]).expect("parse glob");
        let filter: Box<dyn Filter> = Box::new(Exclude::new(patterns));

        let mut chain = build_chain(vec![filter], sink);

        let config = ImageConfig {
            rootfs: crate::manifest::RootFs::Layers {
                diff_ids: vec![layer_digest.clone()],
            },
            history: Vec::new(),
            rest: Default::default(),
        };
        let config_bytes = Bytes::from(config.to_bytes().expect("serialize config"));
        let config_digest = digest::hash_bytes(&config_bytes);

        chain
            .accept(Element::Config {
                name: format!("{}.json", config_digest.as_hex()),
                digest: config_digest,
                bytes: config_bytes,
            })
            .await
            .expect("accept config");

        chain
            .accept(Element::Layer {
                name: "layer".to_string(),
                layer: Layer::builder()
                    .digest(layer_digest.clone())
                    .size(tar_bytes.len() as i64)
                    .media_type(LayerMediaType::default())
                    .build(),
                handle: layer_stream(tar_bytes),
            })
            .await
            .expect("accept layer");

        chain.finalize().await.expect("finalize");

        let events = events.lock().expect("lock");
        assert_eq!(events.len(), 2);
        match &events[1] {
            Element::Config { bytes, .. } => {
                let patched = ImageConfig::parse(bytes).expect("parse patched config");
                assert_ne!(patched.rootfs.diff_ids()[0], layer_digest);
            }
            other => panic!("expected Config element, got {other:?}"),
        }
    }
}
