//! Tarball sink: writes a docker-save-v1.2 layout tarball to disk.

use std::path::PathBuf;

use astral_tokio_tar::Builder;
use async_tempfile::TempFile;
use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use tracing::info;

use crate::{
    cio,
    element::{Consumer, Element},
    manifest::{DockerSaveManifest, ManifestEntry},
    Digest,
};

/// Writes a `docker save`-shaped tarball to a path on disk: `manifest.json`,
/// `<config-digest>.json`, and one `<layer-digest>/layer.tar` per layer.
/// Layers are written to the scratch tarball as they arrive; `manifest.json`
/// and the config are appended in `finalize`.
pub struct Tarball {
    output: PathBuf,
    repo_tags: Vec<String>,
    builder: Option<Builder<TempFile>>,
    config: Option<(String, Digest, Bytes)>,
    layers: Vec<String>,
}

#[bon::bon]
impl Tarball {
    #[builder]
    pub async fn new(
        #[builder(into)] output: PathBuf,
        #[builder(default)] repo_tags: Vec<String>,
    ) -> Result<Self> {
        let scratch = TempFile::new().await.context("create scratch tarball")?;
        Ok(Self {
            output,
            repo_tags,
            builder: Some(Builder::new(scratch)),
            config: None,
            layers: Vec::new(),
        })
    }
}

#[async_trait]
impl Consumer for Tarball {
    async fn accept(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, digest, bytes } => {
                self.config = Some((name, digest, bytes));
                Ok(())
            }
            Element::Layer { name, layer, handle } => {
                let filename = layer.digest.tarball_filename();
                let scratch = cio::collect_tmp(handle)
                    .await
                    .context("buffer layer to scratch file")?;

                let builder = self
                    .builder
                    .as_mut()
                    .ok_or_else(|| eyre!("tarball already finalized"))?;
                builder
                    .append_path_with_name(scratch.file_path(), &filename)
                    .await
                    .context("append layer to tarball")?;

                info!(layer = %name, filename = %filename, "added layer to tarball");
                self.layers.push(filename);
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let (config_name, _digest, config_bytes) = self
            .config
            .take()
            .ok_or_else(|| eyre!("no config element received"))?;

        let mut builder = self
            .builder
            .take()
            .ok_or_else(|| eyre!("tarball already finalized"))?;

        let mut config_file = TempFile::new().await.context("create config scratch file")?;
        {
            use tokio::io::AsyncWriteExt;
            config_file
                .write_all(&config_bytes)
                .await
                .context("write config")?;
            config_file.flush().await.context("flush config")?;
            config_file.sync_all().await.context("sync config")?;
        }
        builder
            .append_path_with_name(config_file.file_path(), &config_name)
            .await
            .context("append config to tarball")?;

        let manifest = DockerSaveManifest(vec![ManifestEntry::builder()
            .config(config_name)
            .repo_tags(self.repo_tags.clone())
            .layers(self.layers.clone())
            .build()]);
        let manifest_file = manifest
            .write_tempfile()
            .await
            .context("write manifest.json")?;
        builder
            .append_path_with_name(manifest_file.file_path(), DockerSaveManifest::FILENAME)
            .await
            .context("append manifest.json to tarball")?;

        let scratch = builder.into_inner().await.context("finish tarball")?;
        scratch.sync_all().await.context("sync tarball")?;
        tokio::fs::copy(scratch.file_path(), &self.output)
            .await
            .context("copy tarball to destination")?;

        info!(output = %self.output.display(), "wrote tarball");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LayerMediaType, Layer};
    use futures_lite::stream;

    fn layer_stream(bytes: &'static [u8]) -> crate::element::ByteStream {
        Box::pin(stream::once(Ok(Bytes::from_static(bytes))))
    }

    #[tokio::test]
    async fn writes_manifest_and_layers() {
        let output = TempFile::new()
            .await
            .expect("reserve output path")
            .file_path()
            .to_path_buf();

        let mut sink = Tarball::builder()
            .output(output.clone())
            .repo_tags(vec!["example:latest".to_string()])
            .build()
            .await
            .expect("build sink");

        let config_digest = crate::digest::hash_bytes(b"{}");
        sink.accept(Element::Config {
            name: format!("{}.json", config_digest.as_hex()),
            digest: config_digest,
            bytes: Bytes::from_static(b"{}"),
        })
        .await
        .expect("accept config");

        let layer_digest = crate::digest::hash_bytes(b"layer-bytes");
        sink.accept(Element::Layer {
            name: "layer-0".to_string(),
            layer: Layer::builder()
                .digest(layer_digest)
                .size(0)
                .media_type(LayerMediaType::default())
                .build(),
            handle: layer_stream(b"layer-bytes"),
        })
        .await
        .expect("accept layer");

        sink.finalize().await.expect("finalize");

        assert!(tokio::fs::try_exists(&output).await.unwrap_or(false));
    }
}
