//! Local-daemon source: pulls an image out of the Docker daemon's own
//! `docker save`-shaped export stream.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use astral_tokio_tar::Archive;
use async_trait::async_trait;
use bollard::Docker;
use color_eyre::{
    eyre::{ensure, eyre, Context, OptionExt},
    Result,
};
use futures_lite::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::{
    cio,
    digest::hash_bytes,
    docker::find_image,
    element::{ByteStream, Consumer, Element},
    error::UnsupportedTarballFormat,
    manifest::{DockerSaveManifest, ImageConfig},
    pipeline::Source,
    Digest, FilterMatch, Filters,
};

/// A view of a single image pulled out of the local Docker daemon.
///
/// The daemon's `export_image` call gives no way to ask for one layer at a
/// time, but it does expose `GET /images/<ref>/json` before the export even
/// starts. That endpoint's `RootFS.Layers` gives diff IDs in apply order, so
/// the export stream can be parsed entry-by-entry as it arrives rather than
/// buffered to a single scratch file up front.
pub struct Daemon {
    image: String,
    docker: Docker,
    expected_config_digest: Digest,
    expected_diff_ids: Vec<Digest>,
    layer_filters: Filters,
}

#[bon::bon]
impl Daemon {
    /// Export the named image (tag, short ID, or digest, as the daemon knows
    /// it -- not necessarily a fully qualified reference) from the local
    /// Docker daemon.
    #[builder]
    pub async fn new(
        #[builder(into)] reference: String,
        #[builder(into)] layer_filters: Option<Filters>,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connect to docker daemon")?;
        let image = find_image(&docker, &reference).await.context("find image")?;

        let inspect = docker.inspect_image(&image).await.context("inspect image")?;
        let id = inspect.id.as_deref().unwrap_or(&image);
        let expected_config_digest = Digest::from_sha256(id.trim_start_matches("sha256:"))
            .context("parse image id as digest")?;
        let expected_diff_ids = inspect
            .root_fs
            .and_then(|rootfs| rootfs.layers)
            .unwrap_or_default()
            .iter()
            .map(|diff_id| Digest::from_str(diff_id))
            .collect::<Result<Vec<_>>>()
            .context("parse RootFS.Layers diff ids")?;

        Ok(Self {
            image,
            docker,
            expected_config_digest,
            expected_diff_ids,
            layer_filters: layer_filters.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Source for Daemon {
    async fn emit(self: Box<Self>, consumer: &mut dyn Consumer) -> Result<()> {
        let byte_stream = self
            .docker
            .export_image(&self.image)
            .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));

        let reader = StreamReader::new(byte_stream);
        let mut archive = Archive::new(reader);
        let mut entries = archive.entries().context("read entries from daemon export")?;

        let mut manifest: Option<DockerSaveManifest> = None;
        let mut actual_diff_ids: Option<Vec<Digest>> = None;
        let mut config_emitted = false;
        // Layer apply order for a pre-1.10-layout export isn't known until
        // manifest.json arrives (usually near the end of the tar), so each
        // layer.tar entry is buffered to its own scratch file, keyed by the
        // directory (legacy layer ID) it lives under, and emitted afterward.
        let mut pending_layers: HashMap<String, async_tempfile::TempFile> = HashMap::new();

        while let Some(entry) = entries.next().await {
            let mut entry = entry.context("read entry")?;
            let path = entry.path().context("read entry path")?.to_path_buf();

            if path == Path::new(DockerSaveManifest::FILENAME) {
                let bytes = cio::collect_buf(tokio_util::io::ReaderStream::new(entry))
                    .await
                    .context("read manifest.json")?;
                manifest = Some(serde_json::from_slice(&bytes).context("parse manifest.json")?);
                continue;
            }

            if path.file_name() == Some(std::ffi::OsStr::new("layer.tar")) {
                let dir = path
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let scratch = cio::collect_tmp(tokio_util::io::ReaderStream::new(entry))
                    .await
                    .context("buffer layer tar to scratch file")?;
                pending_layers.insert(dir, scratch);
                continue;
            }

            // The only other top-level json file in a docker-save v1.2
            // export is the image config, named after its own digest.
            let is_top_level = path.parent().map(|p| p == Path::new("")).unwrap_or(true);
            if is_top_level && path.extension().map(|e| e == "json").unwrap_or(false) {
                let bytes = cio::collect_buf(tokio_util::io::ReaderStream::new(entry))
                    .await
                    .context("read image config")?;
                let digest = hash_bytes(&bytes);
                if digest != self.expected_config_digest {
                    warn!(
                        inspected = %self.expected_config_digest,
                        exported = %digest,
                        "daemon inspect reported a different image id than the exported config",
                    );
                }
                let config = ImageConfig::parse(&bytes).context("parse image config")?;
                actual_diff_ids = Some(config.rootfs.diff_ids().to_vec());

                consumer
                    .accept(Element::Config {
                        name: path.to_string_lossy().into_owned(),
                        digest,
                        bytes: bytes.into(),
                    })
                    .await
                    .context("accept config")?;
                config_emitted = true;
                continue;
            }
        }

        ensure!(config_emitted, "no image config found in daemon export");
        let manifest = manifest.ok_or_else(|| UnsupportedTarballFormat {
            reason: "no manifest.json in daemon export; pre-1.10 docker save format is not supported".to_string(),
        })?;
        let entry = manifest
            .0
            .into_iter()
            .next()
            .ok_or_eyre("manifest.json has no image entries")?;

        let diff_ids = match actual_diff_ids {
            Some(actual) if actual != self.expected_diff_ids => {
                warn!(
                    inspected = ?self.expected_diff_ids,
                    exported = ?actual,
                    "daemon inspect disagreed with the exported image config; using the exported config",
                );
                actual
            }
            Some(actual) => actual,
            None => self.expected_diff_ids,
        };
        ensure!(
            diff_ids.len() == entry.layers.len(),
            "manifest.json lists {} layers but image config has {} diff ids",
            entry.layers.len(),
            diff_ids.len()
        );

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

            let dir = Path::new(&layer_path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let scratch = pending_layers
                .remove(&dir)
                .ok_or_else(|| eyre!("layer tar {layer_path:?} referenced by manifest.json was not found in the export stream"))?;

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
