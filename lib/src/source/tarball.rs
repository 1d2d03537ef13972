//! Saved-tarball source: reads a `docker save`-shaped tarball off disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use color_eyre::{
    eyre::{ensure, eyre, Context, OptionExt},
    Result,
};
use tracing::debug;

use crate::{
    cio,
    digest::hash_bytes,
    element::{ByteStream, Consumer, Element},
    error::UnsupportedTarballFormat,
    manifest::{DockerSaveManifest, ImageConfig},
    pipeline::Source,
    Digest, FilterMatch, Filters,
};

/// A saved image tarball on disk, in `docker save` v1.2 layout.
pub struct Tarball {
    path: PathBuf,
    layer_filters: Filters,
}

#[bon::bon]
impl Tarball {
    #[builder]
    pub async fn new(
        #[builder(into)] path: PathBuf,
        #[builder(into)] layer_filters: Option<Filters>,
    ) -> Result<Self> {
        ensure!(
            tokio::fs::try_exists(&path).await.unwrap_or(false),
            "tarball does not exist: {path:?}"
        );
        Ok(Self {
            path,
            layer_filters: layer_filters.unwrap_or_default(),
        })
    }

    /// The SHA-256 of the tarball file itself, used by callers that need a
    /// stable tag for an otherwise-unnamed local file.
    pub async fn digest(&self) -> Result<Digest> {
        cio::file_digest(&self.path).await
    }
}

#[async_trait]
impl Source for Tarball {
    async fn emit(self: Box<Self>, consumer: &mut dyn Consumer) -> Result<()> {
        let path = self.path;

        let manifest: DockerSaveManifest =
            cio::extract_json(&path, |p| p == Path::new(DockerSaveManifest::FILENAME))
                .await
                .context("read manifest.json")?
                .ok_or_else(|| UnsupportedTarballFormat {
                    reason: "no manifest.json in tarball; pre-1.10 docker save format is not supported".to_string(),
                })?;

        let entry = manifest
            .0
            .into_iter()
            .next()
            .ok_or_eyre("manifest.json has no image entries")?;

        let config_path = entry.config.clone();
        let config_bytes = cio::extract_file_buf(&path, |p| p == Path::new(&config_path))
            .await
            .context("read image config")?
            .ok_or_else(|| eyre!("config file {config_path:?} referenced by manifest.json not found"))?;

        let config_digest = hash_bytes(&config_bytes);
        let config = ImageConfig::parse(&config_bytes).context("parse image config")?;
        let diff_ids = config.rootfs.diff_ids().to_vec();
        ensure!(
            diff_ids.len() == entry.layers.len(),
            "manifest.json lists {} layers but config.rootfs.diff_ids has {}",
            entry.layers.len(),
            diff_ids.len()
        );

        consumer
            .accept(Element::Config {
                name: entry.config,
                digest: config_digest,
                bytes: config_bytes.into(),
            })
            .await
            .context("accept config")?;

        for (layer_path, diff_id) in entry.layers.into_iter().zip(diff_ids) {
            if !self.layer_filters.is_empty()
                && !self.layer_filters.matches(diff_id.to_string().as_str())
            {
                debug!(%diff_id, "skip: layer filter");
                continue;
            }

            if !consumer.want(&diff_id).await? {
                debug!(%diff_id, "skip: sink declined layer");
                continue;
            }

            let stream = cio::extract_file(&path, {
                let layer_path = layer_path.clone();
                move |p| p == Path::new(&layer_path)
            })
            .await
            .context("open layer tar")?
            .ok_or_else(|| eyre!("layer tar {layer_path:?} referenced by manifest.json not found"))?;

            let scratch = cio::collect_tmp(stream)
                .await
                .context("buffer layer tar to scratch file")?;
            let size = tokio::fs::metadata(scratch.file_path())
                .await
                .context("stat buffered layer")?
                .len() as i64;
            let (media_type, handle) = cio::peel_sniffed(scratch.file_path())
                .await
                .context("detect layer compression")?;
            let handle: ByteStream = handle;

            consumer
                .accept(Element::Layer {
                    name: layer_path,
                    layer: crate::Layer::builder()
                        .digest(diff_id)
                        .size(size)
                        .media_type(media_type)
                        .build(),
                    handle,
                })
                .await
                .context("accept layer")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_rejects_missing_path() {
        let result = Tarball::builder()
            .path(PathBuf::from("/nonexistent/path/to/image.tar"))
            .build()
            .await;
        assert!(result.is_err());
    }
}
