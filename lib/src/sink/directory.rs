//! Directory / OCI-bundle / mounts sinks: extract elements onto the local
//! filesystem instead of re-packaging them.

use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::{
    cio::{self, ApplyMode},
    element::{Consumer, Element},
    manifest::{DockerSaveManifest, ImageConfig, ManifestEntry},
    Digest, Filters,
};

/// Where a single layer's contents ended up on disk, as part of a [`Report`].
#[derive(Debug, Serialize)]
pub struct ReportLayer {
    pub digest: Digest,
    pub path: PathBuf,
}

/// A machine-readable record of an extracted image, written as `image.json`
/// alongside a directory/OCI-bundle sink's output so downstream tooling
/// doesn't have to re-derive which directory holds which layer.
#[derive(Debug, Serialize)]
pub struct Report {
    pub reference: String,
    pub digest: String,
    pub layers: Vec<ReportLayer>,
}

impl Report {
    pub const FILENAME: &'static str = "image.json";

    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize image report")
    }

    pub async fn write(&self, output: &Path) -> Result<()> {
        let path = output.join(Self::FILENAME);
        tokio::fs::write(&path, self.render()?)
            .await
            .context("write image report")
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The shared-directory catalog, updated under an advisory file lock so
/// concurrent processes targeting the same directory don't clobber each
/// other's entries.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    images: std::collections::BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogEntry {
    manifest: String,
    digest: String,
}

/// Read-modify-write `catalog.json` under an exclusive lock. Runs on a
/// blocking thread since `file_lock` is a synchronous API.
async fn update_catalog(
    path: PathBuf,
    update: impl FnOnce(&mut Catalog) + Send + 'static,
) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        use file_lock::{FileLock, FileOptions};

        let options = FileOptions::new().write(true).read(true).create(true);
        let mut lock = FileLock::lock(&path, true, options)
            .map_err(|e| eyre!("lock catalog.json: {e}"))?;

        let mut contents = String::new();
        lock.file
            .read_to_string(&mut contents)
            .context("read catalog.json")?;
        let mut catalog: Catalog = if contents.trim().is_empty() {
            Catalog::default()
        } else {
            serde_json::from_str(&contents).context("parse catalog.json")?
        };

        update(&mut catalog);

        let serialized = serde_json::to_vec_pretty(&catalog).context("serialize catalog.json")?;
        lock.file.set_len(0).context("truncate catalog.json")?;
        lock.file
            .seek(SeekFrom::Start(0))
            .context("seek catalog.json")?;
        lock.file
            .write_all(&serialized)
            .context("write catalog.json")?;
        Ok(())
    })
    .await
    .context("join catalog lock task")?
}

async fn write_blob(output: &Path, digest: &Digest, bytes: &[u8]) -> Result<String> {
    let rel = digest.blob_path();
    let path = output.join(&rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create blobs directory")?;
    }
    tokio::fs::write(&path, bytes).await.context("write blob")?;
    Ok(rel)
}

async fn expand_layer(output_root: &Path, blob_path: &Path, dir: &Path, mode: ApplyMode) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create extraction directory")?;
    let file = tokio::fs::File::open(blob_path)
        .await
        .context("reopen layer blob")?;
    let stream = ReaderStream::new(file);
    cio::apply_tarball(&Filters::default(), stream, dir, mode)
        .await
        .with_context(|| format!("extract into {}", output_root.join(dir).display()))
}

/// Extracts a single image's elements into a directory, either standalone
/// or (with `unique_names`) sharing blob storage and a `catalog.json` with
/// other images extracted into the same directory.
pub struct Directory {
    output: PathBuf,
    image: String,
    tag: String,
    unique_names: bool,
    expand: bool,
    config: Option<(Digest, Bytes)>,
    layers: Vec<String>,
    extracted: Vec<ReportLayer>,
}

#[bon::bon]
impl Directory {
    #[builder]
    pub async fn new(
        #[builder(into)] output: PathBuf,
        #[builder(into)] image: String,
        #[builder(into)] tag: String,
        #[builder(default = false)] unique_names: bool,
        #[builder(default = false)] expand: bool,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&output)
            .await
            .context("create output directory")?;
        Ok(Self {
            output,
            image,
            tag,
            unique_names,
            expand,
            config: None,
            layers: Vec::new(),
            extracted: Vec::new(),
        })
    }

    fn merged_dir(&self) -> PathBuf {
        self.output
            .join(format!("merged-{}-{}", sanitize(&self.image), sanitize(&self.tag)))
    }
}

#[async_trait]
impl Consumer for Directory {
    async fn accept(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { digest, bytes, .. } => {
                self.config = Some((digest, bytes));
                Ok(())
            }
            Element::Layer { name, layer, handle } => {
                let scratch = cio::collect_tmp(handle).await.context("buffer layer")?;
                let bytes = tokio::fs::read(scratch.file_path())
                    .await
                    .context("read buffered layer")?;
                let rel = write_blob(&self.output, &layer.digest, &bytes)
                    .await
                    .context("write layer blob")?;

                if self.expand {
                    let blob_path = self.output.join(&rel);
                    let per_layer = self.output.join("layers").join(layer.digest.as_hex());
                    expand_layer(&self.output, &blob_path, &per_layer, ApplyMode::Literal)
                        .await
                        .context("expand per-layer view")?;

                    let merged = self.merged_dir();
                    expand_layer(&self.output, &blob_path, &merged, ApplyMode::Resolved)
                        .await
                        .context("expand merged view")?;

                    self.extracted.push(ReportLayer {
                        digest: layer.digest.clone(),
                        path: per_layer,
                    });
                }

                info!(layer = %name, path = %rel, "wrote layer blob");
                self.layers.push(rel);
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let (config_digest, config_bytes) = self
            .config
            .take()
            .ok_or_else(|| eyre!("no config element received"))?;
        let config_rel = write_blob(&self.output, &config_digest, &config_bytes)
            .await
            .context("write config blob")?;

        let entry = ManifestEntry::builder()
            .config(config_rel)
            .repo_tags(vec![format!("{}:{}", self.image, self.tag)])
            .layers(self.layers.clone())
            .build();
        let manifest = DockerSaveManifest(vec![entry]);
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).context("serialize manifest")?;

        let manifest_filename = if self.unique_names {
            format!("manifest-{}-{}.json", sanitize(&self.image), sanitize(&self.tag))
        } else {
            DockerSaveManifest::FILENAME.to_string()
        };
        tokio::fs::write(self.output.join(&manifest_filename), &manifest_bytes)
            .await
            .context("write manifest")?;

        if self.unique_names {
            let key = format!("{}:{}", self.image, self.tag);
            let digest_hex = config_digest.as_hex();
            let manifest_filename = manifest_filename.clone();
            update_catalog(self.output.join("catalog.json"), move |catalog| {
                catalog.images.insert(
                    key,
                    CatalogEntry {
                        manifest: manifest_filename,
                        digest: digest_hex,
                    },
                );
            })
            .await
            .context("update catalog")?;
        }

        if self.expand {
            let report = Report {
                reference: format!("{}:{}", self.image, self.tag),
                digest: config_digest.to_string(),
                layers: std::mem::take(&mut self.extracted),
            };
            report.write(&self.output).await.context("write image report")?;
        }

        info!(output = %self.output.display(), "wrote directory layout");
        Ok(())
    }
}

/// The OCI-bundle writer: a [`Directory`] restricted to a single image, plus
/// a synthesized `config.json` OCI runtime spec alongside the merged rootfs.
pub struct OciBundle {
    output: PathBuf,
    rootfs: PathBuf,
    config: Option<(Digest, Bytes)>,
    extracted: Vec<ReportLayer>,
}

#[bon::bon]
impl OciBundle {
    #[builder]
    pub async fn new(#[builder(into)] output: PathBuf) -> Result<Self> {
        let rootfs = output.join("rootfs");
        tokio::fs::create_dir_all(&rootfs)
            .await
            .context("create rootfs directory")?;
        Ok(Self {
            output,
            rootfs,
            config: None,
            extracted: Vec::new(),
        })
    }

    /// Build an OCI runtime-spec `process`/`root` skeleton from the image
    /// config's `Config` object (`Entrypoint`, `Cmd`, `Env`, `WorkingDir`).
    fn runtime_spec(&self, config: &ImageConfig) -> serde_json::Value {
        let docker_config = config.rest.get("config").cloned().unwrap_or_default();
        let entrypoint = docker_config
            .get("Entrypoint")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let cmd = docker_config
            .get("Cmd")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let args: Vec<serde_json::Value> = entrypoint.into_iter().chain(cmd).collect();
        let env = docker_config
            .get("Env")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        let cwd = docker_config
            .get("WorkingDir")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("/")
            .to_string();

        serde_json::json!({
            "ociVersion": "1.0.2",
            "process": {
                "terminal": false,
                "cwd": cwd,
                "env": env,
                "args": if args.is_empty() { serde_json::json!(["/bin/sh"]) } else { serde_json::Value::Array(args) },
            },
            "root": {
                "path": "rootfs",
                "readonly": false,
            },
            "linux": {
                "namespaces": [
                    {"type": "pid"},
                    {"type": "network"},
                    {"type": "ipc"},
                    {"type": "uts"},
                    {"type": "mount"},
                ],
            },
            "mounts": [
                {"destination": "/proc", "type": "proc", "source": "proc"},
                {"destination": "/dev", "type": "tmpfs", "source": "tmpfs", "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]},
                {"destination": "/sys", "type": "sysfs", "source": "sysfs", "options": ["nosuid", "noexec", "nodev", "ro"]},
            ],
        })
    }
}

#[async_trait]
impl Consumer for OciBundle {
    async fn accept(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { digest, bytes, .. } => {
                self.config = Some((digest, bytes));
                Ok(())
            }
            Element::Layer { name, layer, handle } => {
                let scratch = cio::collect_tmp(handle).await.context("buffer layer")?;
                let reader = tokio::fs::File::open(scratch.file_path())
                    .await
                    .context("reopen layer")?;
                let stream = ReaderStream::new(reader);
                cio::apply_tarball(&Filters::default(), stream, &self.rootfs, ApplyMode::Resolved)
                    .await
                    .context("extract layer into rootfs")?;
                info!(layer = %name, digest = %layer.digest, "merged layer into rootfs");
                self.extracted.push(ReportLayer {
                    digest: layer.digest,
                    path: self.rootfs.clone(),
                });
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let (digest, config_bytes) = self
            .config
            .take()
            .ok_or_else(|| eyre!("no config element received"))?;
        let config = ImageConfig::parse(&config_bytes).context("parse image config")?;
        let spec = self.runtime_spec(&config);
        let bytes = serde_json::to_vec_pretty(&spec).context("serialize config.json")?;
        tokio::fs::write(self.output.join("config.json"), bytes)
            .await
            .context("write config.json")?;

        let report = Report {
            reference: digest.to_string(),
            digest: digest.to_string(),
            layers: std::mem::take(&mut self.extracted),
        };
        report.write(&self.output).await.context("write image report")?;

        info!(output = %self.output.display(), "wrote oci bundle");
        Ok(())
    }
}

/// The mounts writer: per-layer extracted directories (literal whiteouts)
/// plus a `lowerdir` ordering file consumable by `mount -t overlay`.
pub struct Mounts {
    output: PathBuf,
    layers: Vec<PathBuf>,
}

#[bon::bon]
impl Mounts {
    #[builder]
    pub async fn new(#[builder(into)] output: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&output)
            .await
            .context("create output directory")?;
        Ok(Self {
            output,
            layers: Vec::new(),
        })
    }
}

#[async_trait]
impl Consumer for Mounts {
    async fn accept(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { .. } => Ok(()),
            Element::Layer { name, layer, handle } => {
                let dir = self.output.join(layer.digest.as_hex());
                let scratch = cio::collect_tmp(handle).await.context("buffer layer")?;
                let blob_path = self.output.join("blobs").join(layer.digest.as_hex());
                if let Some(parent) = blob_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("create blobs directory")?;
                }
                tokio::fs::copy(scratch.file_path(), &blob_path)
                    .await
                    .context("stage layer blob")?;
                expand_layer(&self.output, &blob_path, &dir, ApplyMode::Literal)
                    .await
                    .context("expand layer for mount")?;

                info!(layer = %name, dir = %dir.display(), "extracted layer for overlay mount");
                self.layers.push(dir);
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        // overlayfs wants lowerdir listed highest-precedence first; layers
        // arrive in apply order (base first), so reverse for the mount option.
        let lowerdir = self
            .layers
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        tokio::fs::write(self.output.join("lowerdir"), lowerdir)
            .await
            .context("write lowerdir metadata")?;

        info!(output = %self.output.display(), "wrote overlay mount metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Layer, LayerMediaType};
    use futures_lite::stream;

    fn layer_stream(bytes: &'static [u8]) -> crate::element::ByteStream {
        Box::pin(stream::once(Ok(Bytes::from_static(bytes))))
    }

    #[tokio::test]
    async fn writes_manifest_and_blobs() {
        let output = async_tempfile::TempDir::new().await.expect("make tempdir");
        let mut sink = Directory::builder()
            .output(output.dir_path().to_path_buf())
            .image("example")
            .tag("latest")
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

        let manifest_path = output.dir_path().join(DockerSaveManifest::FILENAME);
        assert!(tokio::fs::try_exists(&manifest_path).await.unwrap_or(false));
    }

    /// Builds a single-entry tar containing one regular file, for feeding to
    /// layer-expansion tests.
    async fn build_layer_tar(entry_path: &str, data: &[u8]) -> Bytes {
        let scratch = async_tempfile::TempFile::new().await.expect("create scratch tar");
        let mut builder = astral_tokio_tar::Builder::new(scratch);
        let mut header = astral_tokio_tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, entry_path, data)
            .await
            .expect("append entry");
        let scratch = builder.into_inner().await.expect("finish tar");
        scratch.sync_all().await.expect("sync tar");
        Bytes::from(tokio::fs::read(scratch.file_path()).await.expect("read tar bytes"))
    }

    #[tokio::test]
    async fn expand_resolves_whiteouts_in_merged_view_but_not_per_layer() {
        let output = async_tempfile::TempDir::new().await.expect("make tempdir");
        let mut sink = Directory::builder()
            .output(output.dir_path().to_path_buf())
            .image("example")
            .tag("latest")
            .expand(true)
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

        let lower = build_layer_tar("foo", b"lower layer content").await;
        let lower_digest = crate::digest::hash_bytes(&lower);
        sink.accept(Element::Layer {
            name: "layer-0".to_string(),
            layer: Layer::builder()
                .digest(lower_digest)
                .size(0)
                .media_type(LayerMediaType::default())
                .build(),
            handle: Box::pin(futures_lite::stream::once(Ok(lower))),
        })
        .await
        .expect("accept lower layer");

        let upper = build_layer_tar(".wh.foo", b"").await;
        let upper_digest = crate::digest::hash_bytes(&upper);
        sink.accept(Element::Layer {
            name: "layer-1".to_string(),
            layer: Layer::builder()
                .digest(upper_digest.clone())
                .size(0)
                .media_type(LayerMediaType::default())
                .build(),
            handle: Box::pin(futures_lite::stream::once(Ok(upper))),
        })
        .await
        .expect("accept upper layer");

        sink.finalize().await.expect("finalize");

        let merged = sink.merged_dir();
        assert!(
            !tokio::fs::try_exists(merged.join("foo")).await.unwrap_or(true),
            "merged view must not contain a path the upper layer whited out"
        );

        let per_layer_upper = output.dir_path().join("layers").join(upper_digest.as_hex());
        assert!(
            tokio::fs::try_exists(per_layer_upper.join(".wh.foo")).await.unwrap_or(false),
            "per-layer view must retain the whiteout marker literally"
        );

        let report_bytes = tokio::fs::read(output.dir_path().join(Report::FILENAME))
            .await
            .expect("read image.json");
        let report: serde_json::Value = serde_json::from_slice(&report_bytes).expect("parse image.json");
        assert_eq!(report["layers"].as_array().expect("layers array").len(), 2);
    }
}
