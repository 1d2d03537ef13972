//! `normalize-timestamps`: rewrites every tar member's mtime/atime to a fixed
//! value and recomputes each rewritten layer's digest, keeping the buffered
//! image config's diffID list and history in sync.

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
    Digest, Layer,
};

/// Rewrites every layer's tar member timestamps to a fixed value (the Unix
/// epoch by default) and patches the buffered config's diffIDs and history
/// entries to match once every layer has passed through.
pub struct NormalizeTimestamps {
    fixed_time: u64,
    renamed: HashMap<Digest, Digest>,
    config: Option<Element>,
}

impl NormalizeTimestamps {
    /// `fixed_time` is the Unix timestamp every tar member's mtime/atime is
    /// rewritten to; defaults to 0 (the epoch) if not given.
    pub fn new(fixed_time: Option<u64>) -> Self {
        Self {
            fixed_time: fixed_time.unwrap_or(0),
            renamed: HashMap::new(),
            config: None,
        }
    }
}

#[async_trait]
impl Filter for NormalizeTimestamps {
    async fn accept(&mut self, element: Element, inner: &mut dyn Consumer) -> Result<()> {
        match element {
            Element::Config { .. } => {
                self.config = Some(element);
                Ok(())
            }
            Element::Layer { layer, handle, .. } => {
                let old_digest = layer.digest.clone();
                let (scratch, new_digest, new_size) =
                    retar::rewrite(handle, |_| Keep::Yes, Some(self.fixed_time))
                        .await
                        .context("normalize layer timestamps")?;
                self.renamed.insert(old_digest.clone(), new_digest.clone());

                let new_layer = Layer::builder()
                    .digest(new_digest.clone())
                    .size(new_size)
                    .media_type(layer.media_type)
                    .build();
                let handle = retar::into_byte_stream(&scratch).await?;

                info!(old = %old_digest, new = %new_digest, "normalized layer timestamps");
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
            inner.accept(patch_config(&bytes, &self.renamed, self.fixed_time)?).await?;
        }
        inner.finalize().await
    }
}

/// Patch a config's `rootfs.diff_ids` and history `created` fields to reflect
/// a set of layer-digest renames and a fixed timestamp, and re-digest it.
fn patch_config(
    bytes: &[u8],
    renamed: &HashMap<Digest, Digest>,
    fixed_time: u64,
) -> Result<Element> {
    let mut config = ImageConfig::parse(bytes).context("parse buffered config")?;
    for (old, new) in renamed {
        config.replace_diff_id(old, new);
    }
    let created = format_unix_time(fixed_time);
    for entry in &mut config.history {
        entry.created = Some(created.clone());
    }

    let new_bytes = config.to_bytes().context("serialize patched config")?;
    let new_digest = digest::hash_bytes(&new_bytes);
    Ok(Element::Config {
        name: format!("{}.json", new_digest.as_hex()),
        digest: new_digest,
        bytes: Bytes::from(new_bytes),
    })
}

/// Render a Unix timestamp as the RFC 3339 string Docker image configs use
/// for `created`/`history[].created`.
fn format_unix_time(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{element::ByteStream, manifest::HistoryEntry, pipeline::build_chain, LayerMediaType};
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

    /// Build a real single-file tarball with a non-zero mtime, so normalizing
    /// it to 0 is guaranteed to change its bytes (and thus its digest).
    async fn build_test_tar(path: &str, data: &[u8]) -> Bytes {
        let scratch = TempFile::new().await.expect("create scratch tar");
        let mut builder = Builder::new(scratch);
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data)
            .await
            .expect("append entry");
        let scratch = builder.into_inner().await.expect("finish tar");
        scratch.sync_all().await.expect("sync tar");
        Bytes::from(tokio::fs::read(scratch.file_path()).await.expect("read tar bytes"))
    }

    #[tokio::test]
    async fn rewrites_layer_and_patches_config() {
        let tar_bytes = build_test_tar("file.txt", b"hello layer").await;
        let layer_digest = digest::hash_bytes(&tar_bytes);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: Box<dyn Consumer> = Box::new(RecordingSink(events.clone()));
        let filter: Box<dyn Filter> = Box::new(NormalizeTimestamps::new(Some(0)));

        let mut chain = build_chain(vec![filter], sink);

        let config = ImageConfig {
            rootfs: crate::manifest::RootFs::Layers {
                diff_ids: vec![layer_digest.clone()],
            },
            history: vec![HistoryEntry {
                created: Some("2020-01-01T00:00:00Z".to_string()),
                created_by: Some("RUN echo hi".to_string()),
                empty_layer: false,
                rest: Default::default(),
            }],
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
        assert_eq!(events.len(), 2, "layer then patched config");
        assert!(matches!(events[0], Element::Layer { .. }));
        match &events[1] {
            Element::Config { bytes, .. } => {
                let patched = ImageConfig::parse(bytes).expect("parse patched config");
                assert_ne!(patched.rootfs.diff_ids()[0], layer_digest);
                assert_eq!(
                    patched.history[0].created.as_deref(),
                    Some("1970-01-01T00:00:00Z")
                );
            }
            other => panic!("expected Config element, got {other:?}"),
        }
    }
}
