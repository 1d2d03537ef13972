//! Registry sink: pushes image elements to an OCI/Docker Distribution
//! registry (HEAD-dedup blob upload, parallel compress+upload, manifest PUT).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use reqwest::{Client, StatusCode};
use tokio::task::JoinSet;
use tracing::debug;

use crate::{
    digest::hashing,
    element::{ByteStream, Consumer, Element},
    error::{AuthFailed, AuthRequired},
    manifest::{OciDescriptor, OciManifest},
    registry_auth::{parse_challenge, RegistryAuth},
    transform::{self, Compression},
    Authentication, Digest, Reference, Version,
};

const DEFAULT_MAX_WORKERS: usize = 4;

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

struct Inner {
    client: Client,
    auth: Arc<RegistryAuth>,
    insecure: bool,
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
            Err(_) => "http",
        };
        *cached = Some(scheme);
        format!("{scheme}://{host}")
    }

    async fn token(&self, host: &str, challenge_header: &str) -> Result<String> {
        let challenge = parse_challenge(challenge_header).context("parse auth challenge")?;
        self.auth
            .token_for(&challenge)
            .await
            .map_err(|_| AuthFailed {
                host: host.to_string(),
            }
            .into())
    }

    /// HEAD a blob, returning whether the registry already has it.
    async fn blob_exists(&self, host: &str, repo: &str, digest: &Digest) -> Result<bool> {
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.base_url(host).await);
        let response = self.client.head(&url).send().await.context("HEAD blob")?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge_header = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| AuthRequired {
                    host: host.to_string(),
                })?;
            let token = self.token(host, &challenge_header).await?;
            let response = self
                .client
                .head(&url)
                .bearer_auth(&token)
                .send()
                .await
                .context("HEAD blob (authenticated)")?;
            return Ok(response.status().is_success());
        }
        Ok(response.status().is_success())
    }

    /// Start a chunked blob upload, returning the URL the `PATCH`/`PUT` steps
    /// should target and the bearer token (if any) the registry demanded for
    /// this repo's push scope, so the caller can reuse it on the `PATCH`
    /// without a second round of challenge/response.
    async fn start_upload(&self, host: &str, repo: &str) -> Result<(String, Option<String>)> {
        let start_url = format!("{}/v2/{repo}/blobs/uploads/", self.base_url(host).await);
        let (start, token) = self.authed_with_token(|c| c.post(&start_url), host).await?;
        let location = start
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| eyre!("registry did not return a Location header for blob upload"))?;
        let url = if location.starts_with('/') {
            format!("{}{location}", self.base_url(host).await)
        } else {
            location
        };
        Ok((url, token))
    }

    /// Finalize a chunked blob upload against the `Location` the `PATCH` step
    /// returned, via `PUT ?digest=`.
    async fn finalize_upload(&self, host: &str, patch_location: String, digest: &Digest) -> Result<()> {
        let finalize_url = format!(
            "{}{}digest={digest}",
            if patch_location.starts_with('/') {
                self.base_url(host).await
            } else {
                String::new()
            },
            if patch_location.contains('?') {
                format!("{patch_location}&")
            } else {
                format!("{patch_location}?")
            }
        );

        self.authed(|c| c.put(&finalize_url).body(Bytes::new()), host)
            .await?
            .error_for_status()
            .context("finalize blob upload")?;
        Ok(())
    }

    /// Upload a complete blob, already buffered in memory, via the chunked
    /// upload endpoints: `POST .../blobs/uploads/` to start, one `PATCH` with
    /// the whole body, then `PUT ?digest=` to finalize.
    ///
    /// Only used for the config blob, which is small and already resident in
    /// memory by the time [`Element::Config`] is received; layer blobs go
    /// through [`Self::upload_blob_file`] instead.
    async fn upload_blob(&self, host: &str, repo: &str, digest: &Digest, body: Bytes) -> Result<()> {
        if self.blob_exists(host, repo, digest).await? {
            debug!(%digest, "skip: blob already present");
            return Ok(());
        }

        let (patch_url, token) = self.start_upload(host, repo).await?;
        let patched = match &token {
            Some(token) => self
                .client
                .patch(&patch_url)
                .bearer_auth(token)
                .body(body.clone())
                .send()
                .await
                .context("send authenticated request")?,
            None => self.authed(|c| c.patch(&patch_url).body(body.clone()), host).await?,
        };
        let patch_location = patched
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(patch_url);

        self.finalize_upload(host, patch_location, digest).await
    }

    /// Upload a complete blob that has been compressed to a scratch file on
    /// disk, streaming the `PATCH` body straight from it rather than holding
    /// the blob in memory. The token obtained by [`Self::start_upload`] (if
    /// any) is reused directly, since a streaming body can only be attached
    /// to one request and `authed`'s unauthenticated-then-retry dance would
    /// otherwise consume it on the first attempt.
    async fn upload_blob_file(&self, host: &str, repo: &str, digest: &Digest, path: &std::path::Path) -> Result<()> {
        if self.blob_exists(host, repo, digest).await? {
            debug!(%digest, "skip: blob already present");
            return Ok(());
        }

        let (patch_url, token) = self.start_upload(host, repo).await?;
        let file = tokio::fs::File::open(path).await.context("reopen scratch layer for upload")?;
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let mut request = self.client.patch(&patch_url).body(body);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let patched = request.send().await.context("send layer blob")?;

        let patch_location = patched
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(patch_url);

        self.finalize_upload(host, patch_location, digest).await
    }

    /// Send a request, retrying once with a bearer token on a 401 challenge.
    async fn authed(
        &self,
        build: impl Fn(&Client) -> reqwest::RequestBuilder,
        host: &str,
    ) -> Result<reqwest::Response> {
        self.authed_with_token(build, host).await.map(|(response, _)| response)
    }

    /// Like [`Self::authed`], but also returns the bearer token used, if any,
    /// so a caller that needs to attach a single-use (streaming) body to a
    /// later request can skip a redundant challenge round-trip.
    async fn authed_with_token(
        &self,
        build: impl Fn(&Client) -> reqwest::RequestBuilder,
        host: &str,
    ) -> Result<(reqwest::Response, Option<String>)> {
        let response = build(&self.client).send().await.context("send request")?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok((response, None));
        }
        let challenge_header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AuthRequired {
                host: host.to_string(),
            })?;
        let token = self.token(host, &challenge_header).await?;
        let response = build(&self.client)
            .bearer_auth(&token)
            .send()
            .await
            .context("send authenticated request")?;
        Ok((response, Some(token)))
    }
}

/// A remote OCI/Docker Distribution registry, as a pipeline [`Consumer`] sink.
pub struct Registry {
    inner: Arc<Inner>,
    reference: Reference,
    compression: Compression,
    max_workers: usize,
    repo: String,

    config: Option<(String, Digest, Bytes)>,
    next_index: usize,
    pending: JoinSet<Result<(usize, OciDescriptor)>>,
    layer_descriptors: BTreeMap<usize, OciDescriptor>,
}

#[bon::bon]
impl Registry {
    #[builder]
    pub async fn new(
        #[builder(into)] reference: Reference,
        #[builder(default)] auth: Authentication,
        #[builder(default = Compression::Gzip)] compression: Compression,
        #[builder(default = DEFAULT_MAX_WORKERS)] max_workers: usize,
        #[builder(default = false)] insecure: bool,
    ) -> Result<Self> {
        let client = Client::builder().build().context("build http client")?;
        let auth = RegistryAuth::new(client.clone(), auth);
        let repo = reference.repository();
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                auth,
                insecure,
                scheme: tokio::sync::Mutex::new(None),
            }),
            reference,
            compression,
            max_workers: max_workers.max(1),
            repo,
            config: None,
            next_index: 0,
            pending: JoinSet::new(),
            layer_descriptors: BTreeMap::new(),
        })
    }
}

impl Registry {
    async fn drain_one(&mut self) -> Result<()> {
        if let Some(joined) = self.pending.join_next().await {
            let (i, descriptor) = joined.context("join layer upload task")??;
            self.layer_descriptors.insert(i, descriptor);
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for Registry {
    async fn want(&mut self, _digest: &Digest) -> Result<bool> {
        // Real blob dedup happens per-upload via a HEAD on the compressed
        // digest, which isn't known until the layer is compressed; admission
        // here is unconditional.
        Ok(true)
    }

    async fn accept(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, digest, bytes } => {
                self.config = Some((name, digest, bytes));
                Ok(())
            }
            Element::Layer { name: _, layer: _, handle } => {
                if self.pending.len() >= self.max_workers {
                    self.drain_one().await.context("drain upload slot")?;
                }

                let index = self.next_index;
                self.next_index += 1;

                let inner = self.inner.clone();
                let host = self.reference.host.clone();
                let repo = self.repo.clone();
                let compression = self.compression;

                self.pending.spawn(async move {
                    let compressed_stream: ByteStream = match compression {
                        Compression::None => handle,
                        Compression::Gzip => Box::pin(transform::gzip_encode(handle)),
                        Compression::Zstd => Box::pin(transform::zstd_encode(handle)),
                    };

                    let (hashed, rx) = hashing(compressed_stream);
                    let scratch = crate::cio::collect_tmp(hashed)
                        .await
                        .context("buffer compressed layer to scratch file")?;
                    let (blob_digest, size) = rx.await.context("await compressed digest")?;

                    inner
                        .upload_blob_file(&host, &repo, &blob_digest, scratch.file_path())
                        .await
                        .context("upload layer blob")?;

                    let media_type = match compression {
                        Compression::Gzip => "application/vnd.oci.image.layer.v1.tar+gzip",
                        Compression::Zstd => "application/vnd.oci.image.layer.v1.tar+zstd",
                        Compression::None => "application/vnd.oci.image.layer.v1.tar",
                    }
                    .to_string();

                    let descriptor = OciDescriptor {
                        media_type,
                        digest: blob_digest,
                        size: size as i64,
                    };
                    Ok((index, descriptor))
                });
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        while let Some(joined) = self.pending.join_next().await {
            let (i, descriptor) = joined.context("join layer upload task")??;
            self.layer_descriptors.insert(i, descriptor);
        }

        let (_name, config_digest, config_bytes) =
            self.config.take().ok_or_else(|| eyre!("no config element received"))?;

        self.inner
            .upload_blob(&self.reference.host, &self.repo, &config_digest, config_bytes.clone())
            .await
            .context("upload config blob")?;

        let layers = (0..self.next_index)
            .map(|i| {
                self.layer_descriptors
                    .remove(&i)
                    .expect("every layer index was uploaded before finalize")
            })
            .collect();

        let manifest = OciManifest {
            schema_version: 2,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            config: OciDescriptor {
                media_type: OCI_CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_bytes.len() as i64,
            },
            layers,
        };
        let body = serde_json::to_vec(&manifest).context("serialize manifest")?;

        let version = match &self.reference.version {
            Version::Tag(tag) => tag.clone(),
            Version::Digest(digest) => digest.to_string(),
        };
        let url = format!(
            "{}/v2/{}/manifests/{version}",
            self.inner.base_url(&self.reference.host).await,
            self.repo
        );
        self.inner
            .authed(
                |c| {
                    c.put(&url)
                        .header(reqwest::header::CONTENT_TYPE, manifest.media_type.clone())
                        .body(body.clone())
                },
                &self.reference.host,
            )
            .await?
            .error_for_status()
            .context("PUT manifest")?;

        Ok(())
    }
}
