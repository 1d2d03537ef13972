//! `inspect`: pure passthrough that records one JSON line per layer (digest,
//! size, the history step that produced it, and the image's repo tags) to a
//! configured file. Useful sandwiched between other filters to measure their
//! effect on layer count/size.

use std::path::PathBuf;

use async_trait::async_trait;
use color_eyre::{eyre::Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::{
    element::{Consumer, Element},
    manifest::ImageConfig,
    pipeline::Filter,
    Digest,
};

/// One inspected layer, serialized as a line in the output file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectRecord<'a> {
    digest: String,
    size: i64,
    created_by: Option<&'a str>,
    repo_tags: &'a [String],
}

/// Records one line per layer to `output`; never drops or rewrites an
/// element.
pub struct Inspect {
    output: PathBuf,
    repo_tags: Vec<String>,
    layers: Vec<(Digest, i64)>,
    created_by: Vec<Option<String>>,
}

impl Inspect {
    pub fn new(output: impl Into<PathBuf>, repo_tags: Vec<String>) -> Self {
        Self {
            output: output.into(),
            repo_tags,
            layers: Vec::new(),
            created_by: Vec::new(),
        }
    }
}

#[async_trait]
impl Filter for Inspect {
    async fn accept(&mut self, element: Element, inner: &mut dyn Consumer) -> Result<()> {
        match &element {
            Element::Config { bytes, .. } => {
                if let Ok(config) = ImageConfig::parse(bytes) {
                    self.created_by = config
                        .history
                        .iter()
                        .filter(|entry| !entry.empty_layer)
                        .map(|entry| entry.created_by.clone())
                        .collect();
                }
            }
            Element::Layer { layer, .. } => {
                self.layers.push((layer.digest.clone(), layer.size));
            }
        }
        inner.accept(element).await
    }

    async fn finalize(&mut self, inner: &mut dyn Consumer) -> Result<()> {
        if let Some(parent) = self.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("create inspect output directory")?;
            }
        }

        let mut file = tokio::fs::File::create(&self.output)
            .await
            .context("create inspect output file")?;
        for (i, (digest, size)) in self.layers.iter().enumerate() {
            let record = InspectRecord {
                digest: digest.to_string(),
                size: *size,
                created_by: self
                    .created_by
                    .get(i)
                    .and_then(|entry| entry.as_deref()),
                repo_tags: &self.repo_tags,
            };
            let mut line = serde_json::to_string(&record).context("serialize inspect record")?;
            line.push('\n');
            file.write_all(line.as_bytes())
                .await
                .context("write inspect record")?;
        }
        file.flush().await.context("flush inspect output")?;

        inner.finalize().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{element::ByteStream, manifest::HistoryEntry, pipeline::build_chain, Layer, LayerMediaType};
    use async_tempfile::TempDir;
    use bytes::Bytes;
    use futures_lite::stream;
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Consumer for RecordingSink {
        async fn accept(&mut self, element: Element) -> Result<()> {
            self.0.lock().expect("lock").push(format!("accept:{}", element.name()));
            Ok(())
        }

        async fn finalize(&mut self) -> Result<()> {
            self.0.lock().expect("lock").push("finalize:sink".to_string());
            Ok(())
        }
    }

    fn empty_layer_stream() -> ByteStream {
        Box::pin(stream::empty())
    }

    #[tokio::test]
    async fn writes_one_line_per_layer() {
        let dir = TempDir::new().await.expect("make tempdir");
        let output = dir.dir_path().join("inspect.jsonl");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: Box<dyn Consumer> = Box::new(RecordingSink(events.clone()));
        let filter: Box<dyn Filter> = Box::new(Inspect::new(output.clone(), vec!["example:latest".to_string()]));

        let mut chain = build_chain(vec![filter], sink);

        let config = ImageConfig {
            rootfs: crate::manifest::RootFs::Layers { diff_ids: Vec::new() },
            history: vec![HistoryEntry {
                created: None,
                created_by: Some("RUN echo hi".to_string()),
                empty_layer: false,
                rest: Default::default(),
            }],
            rest: Default::default(),
        };
        let config_bytes = Bytes::from(config.to_bytes().expect("serialize config"));

        chain
            .accept(Element::Config {
                name: "config.json".to_string(),
                digest: crate::digest::hash_bytes(&config_bytes),
                bytes: config_bytes,
            })
            .await
            .expect("accept config");

        let digest = crate::digest::hash_bytes(b"layer");
        chain
            .accept(Element::Layer {
                name: "layer".to_string(),
                layer: Layer::builder()
                    .digest(digest)
                    .size(42)
                    .media_type(LayerMediaType::default())
                    .build(),
                handle: empty_layer_stream(),
            })
            .await
            .expect("accept layer");

        chain.finalize().await.expect("finalize");

        let written = tokio::fs::read_to_string(&output)
            .await
            .expect("read inspect output");
        let mut lines = written.lines();
        let record: serde_json::Value =
            serde_json::from_str(lines.next().expect("one line")).expect("parse json line");
        assert_eq!(record["size"], 42);
        assert_eq!(record["createdBy"], "RUN echo hi");
        assert_eq!(record["repoTags"][0], "example:latest");
        assert!(lines.next().is_none());
    }
}
