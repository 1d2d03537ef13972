//! Registry source: pulls image elements from an OCI/Docker Distribution
//! registry, negotiating the manifest, platform, and blob fetches.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{
    eyre::{ensure, eyre, Context},
    Result,
};
use futures_lite::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    cio,
    digest::{self, hash_bytes},
    element::{ByteStream, Consumer, Element},
    error::{AuthFailed, AuthRequired, DigestMismatch, NoMatchingPlatform},
    manifest::{
        ImageConfig, OciDescriptor, OciManifest, OciManifestList, LIST_MEDIA_TYPES,
        MANIFEST_ACCEPT_TYPES,
    },
    pipeline::Source,
    registry_auth::{parse_challenge, RegistryAuth},
    Authentication, Digest, Layer, LayerMediaType, Platform, Reference, Version,
};

/// Default number of concurrent layer fetches, used when the caller doesn't
/// set `max_workers` explicitly.
const DEFAULT_MAX_WORKERS: usize = 4;
/// Maximum attempts for a transient blob/manifest fetch before giving up.
const MAX_RETRIES: u32 = 5;

struct Inner {
    client: Client,
    auth: Arc<RegistryAuth>,
    insecure: bool,
    /// Resolved scheme for this host, once known. Only ever populated (and
    /// only ever consulted) when `insecure` is set: an HTTPS endpoint is
    /// always assumed otherwise. Lets a single connection failure against
    /// HTTPS fall back to plain HTTP for every subsequent request to the
    /// same airgapped/internal registry, instead of probing on every call.
    scheme: tokio::sync::Mutex<Option<&'static str>>,
}

impl Inner {
    async fn base_url(&self, host: &str) -> String {
        if !self.insecure {
            return format!("https://{host}");
        }

        let mut cached = self.scheme.lock().await;
        if let Some(scheme) = *cached {
            return format!("{scheme}://{host}");
        }

        let probe = format!("https://{host}/v2/");
        let scheme = match self.client.get(&probe).send().await {
            Ok(_) => "https",
            Err(_) => {
                debug!(%host, "https probe failed; falling back to http (--insecure)");
                "http"
            }
        };
        *cached = Some(scheme);
        format!("{scheme}://{host}")
    }

    /// GET a URL, transparently handling the Bearer challenge/token dance on
    /// a 401. Does not retry transient failures; see [`retry_with_backoff`].
    async fn authed_get(
        &self,
        host: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let build = |token: Option<&str>| {
            let mut req = self.client.get(url);
            if let Some(accept) = accept {
                req = req.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(token) = token {
                req = req.bearer_auth(token);
            } else if let Some((user, pass)) = self.auth.basic_auth_header() {
                req = req.basic_auth(user, Some(pass));
            }
            req
        };

        let response = build(None).send().await.context("send request")?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge_header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AuthRequired {
                host: host.to_string(),
            })?;
        let challenge = parse_challenge(&challenge_header).context("parse auth challenge")?;
        let token = self
            .auth
            .token_for(&challenge)
            .await
            .map_err(|_| AuthFailed {
                host: host.to_string(),
            })?;

        let response = build(Some(&token))
            .send()
            .await
            .context("send authenticated request")?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(AuthFailed {
                host: host.to_string(),
            }
            .into());
        }
        Ok(response)
    }
}

/// Retry a fallible operation with exponential backoff, up to [`MAX_RETRIES`]
/// attempts. Used for blob/manifest fetches, which see transient network and
/// 5xx failures that a second attempt routinely clears.
async fn retry_with_backoff<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(attempt, error = ?err, "transient fetch failure");
                last_err = Some(err);
                if attempt + 1 < MAX_RETRIES {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err.expect("retry_with_backoff called with MAX_RETRIES == 0"))
}

/// A remote OCI/Docker Distribution registry, as a pipeline [`Source`].
pub struct Registry {
    inner: Arc<Inner>,
    reference: Reference,
    platform: Option<Platform>,
    max_workers: usize,
}

#[bon::bon]
impl Registry {
    #[builder]
    pub async fn new(
        #[builder(into)] reference: Reference,
        #[builder(default)] auth: Authentication,
        platform: Option<Platform>,
        #[builder(default = DEFAULT_MAX_WORKERS)] max_workers: usize,
        #[builder(default = false)] insecure: bool,
    ) -> Result<Self> {
        let client = Client::builder().build().context("build http client")?;
        let auth = RegistryAuth::new(client.clone(), auth);
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                auth,
                insecure,
                scheme: tokio::sync::Mutex::new(None),
            }),
            reference,
            platform,
            max_workers,
        })
    }
}

impl Registry {
    fn version_str(&self) -> String {
        match &self.reference.version {
            Version::Tag(tag) => tag.clone(),
            Version::Digest(digest) => digest.to_string(),
        }
    }

    /// Negotiate and fetch the single-platform manifest for this reference,
    /// resolving a manifest list/index to the requested platform if needed.
    async fn fetch_manifest(&self) -> Result<OciManifest> {
        let host = &self.reference.host;
        let repo = self.reference.repository();
        let accept = MANIFEST_ACCEPT_TYPES.join(", ");

        let url = format!("{}/v2/{repo}/manifests/{}", self.inner.base_url(host).await, self.version_str());
        let response = retry_with_backoff(|| async {
            self.inner
                .authed_get(host, &url, Some(&accept))
                .await?
                .error_for_status()
                .context("manifest fetch returned an error status")
        })
        .await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.context("read manifest body")?;

        if LIST_MEDIA_TYPES.iter().any(|t| content_type.starts_with(t)) {
            let list: OciManifestList =
                serde_json::from_slice(&body).context("parse manifest list")?;
            let requested = self.platform.clone().unwrap_or_else(Platform::linux_amd64);
            let chosen = list
                .manifests
                .iter()
                .find(|m| requested.matches(&Platform::from(&m.platform)))
                .ok_or_else(|| NoMatchingPlatform {
                    requested: requested.to_string(),
                    available: list
                        .manifests
                        .iter()
                        .map(|m| Platform::from(&m.platform).to_string())
                        .collect(),
                })?;

            let url = format!(
                "{}/v2/{repo}/manifests/{}",
                self.inner.base_url(host).await,
                chosen.digest
            );
            let response = retry_with_backoff(|| async {
                self.inner
                    .authed_get(host, &url, Some(&accept))
                    .await?
                    .error_for_status()
                    .context("platform manifest fetch returned an error status")
            })
            .await?;
            let body = response.bytes().await.context("read platform manifest body")?;
            serde_json::from_slice(&body).context("parse platform manifest")
        } else {
            serde_json::from_slice(&body).context("parse manifest")
        }
    }

    async fn fetch_config(&self, repo: &str, descriptor: &OciDescriptor) -> Result<Bytes> {
        let host = &self.reference.host;
        let url = format!("{}/v2/{repo}/blobs/{}", self.inner.base_url(host).await, descriptor.digest);
        let response = retry_with_backoff(|| async {
            self.inner
                .authed_get(host, &url, None)
                .await?
                .error_for_status()
                .context("config blob fetch returned an error status")
        })
        .await?;
        response.bytes().await.context("read config blob")
    }

    /// Fetch and decompress a layer blob to a scratch file, verifying the
    /// decompressed bytes hash to `diff_id`.
    async fn fetch_layer(
        inner: Arc<Inner>,
        host: String,
        repo: String,
        descriptor: OciDescriptor,
        media_type: LayerMediaType,
        diff_id: Digest,
    ) -> Result<async_tempfile::TempFile> {
        let url = format!("{}/v2/{repo}/blobs/{}", inner.base_url(&host).await, descriptor.digest);
        let response = retry_with_backoff(|| {
            let inner = inner.clone();
            let host = host.clone();
            let url = url.clone();
            async move {
                inner
                    .authed_get(&host, &url, None)
                    .await?
                    .error_for_status()
                    .context("layer blob fetch returned an error status")
            }
        })
        .await?;

        let byte_stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::other(e.to_string()))),
        );
        let layer = Layer::builder()
            .digest(diff_id.clone())
            .size(descriptor.size)
            .media_type(media_type)
            .build();
        let peeled =
            cio::peel_layer(&layer, byte_stream).ok_or_else(|| eyre!("cannot pull foreign layer"))?;

        let (hashed, rx) = digest::hashing(peeled);
        let tempfile = cio::collect_tmp(hashed)
            .await
            .context("buffer decompressed layer")?;
        let (computed, _size) = rx.await.context("await computed layer digest")?;
        if computed != diff_id {
            return Err(DigestMismatch {
                expected: diff_id.to_string(),
                computed: computed.to_string(),
            }
            .into());
        }
        Ok(tempfile)
    }
}

#[async_trait]
impl Source for Registry {
    async fn emit(self: Box<Self>, consumer: &mut dyn Consumer) -> Result<()> {
        let repo = self.reference.repository();
        let manifest = self.fetch_manifest().await.context("fetch manifest")?;

        let config_bytes = self
            .fetch_config(&repo, &manifest.config)
            .await
            .context("fetch config blob")?;
        let computed_config_digest = hash_bytes(&config_bytes);
        if computed_config_digest != manifest.config.digest {
            return Err(DigestMismatch {
                expected: manifest.config.digest.to_string(),
                computed: computed_config_digest.to_string(),
            }
            .into());
        }

        let config = ImageConfig::parse(&config_bytes).context("parse image config")?;
        let diff_ids = config.rootfs.diff_ids().to_vec();
        ensure!(
            diff_ids.len() == manifest.layers.len(),
            "manifest has {} layers but config.rootfs.diff_ids has {}",
            manifest.layers.len(),
            diff_ids.len()
        );

        consumer
            .accept(Element::Config {
                name: format!("{}.json", manifest.config.digest.as_hex()),
                digest: computed_config_digest,
                bytes: config_bytes,
            })
            .await
            .context("accept config")?;

        let mut wanted = Vec::new();
        for diff_id in &diff_ids {
            if consumer.want(diff_id).await? {
                wanted.push(true);
            } else {
                debug!(%diff_id, "skip: sink declined layer");
                wanted.push(false);
            }
        }

        let indices: Vec<usize> = (0..diff_ids.len()).filter(|i| wanted[*i]).collect();
        let mut results: BTreeMap<usize, async_tempfile::TempFile> = BTreeMap::new();

        for chunk in indices.chunks(self.max_workers.max(1)) {
            let mut tasks = JoinSet::new();
            for &i in chunk {
                let inner = self.inner.clone();
                let host = self.reference.host.clone();
                let repo = repo.clone();
                let descriptor = manifest.layers[i].clone();
                let media_type = LayerMediaType::from_str(&descriptor.media_type)
                    .unwrap_or_else(|_| LayerMediaType::default());
                let diff_id = diff_ids[i].clone();
                tasks.spawn(async move {
                    Registry::fetch_layer(inner, host, repo, descriptor, media_type, diff_id)
                        .await
                        .map(|tempfile| (i, tempfile))
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let (i, tempfile) = joined.context("join layer fetch task")??;
                results.insert(i, tempfile);
            }
        }

        for i in indices {
            let tempfile = results.remove(&i).expect("every wanted index was fetched");
            let diff_id = diff_ids[i].clone();
            let descriptor = &manifest.layers[i];
            let media_type = LayerMediaType::from_str(&descriptor.media_type)
                .unwrap_or_else(|_| LayerMediaType::default());

            let file = tokio::fs::File::open(tempfile.file_path())
                .await
                .context("reopen buffered layer")?;
            let stream: ByteStream = Box::pin(tokio_util::io::ReaderStream::new(file));

            consumer
                .accept(Element::Layer {
                    name: format!("{}.tar", diff_id.as_hex()),
                    layer: Layer::builder()
                        .digest(diff_id)
                        .size(descriptor.size)
                        .media_type(media_type)
                        .build(),
                    handle: stream,
                })
                .await
                .context("accept layer")?;
        }

        Ok(())
    }
}
