//! Local-daemon sink: builds a docker-save-v1.2 tar in a scratch file and
//! loads it into the local Docker daemon via `POST /images/load`.

use async_trait::async_trait;
use bollard::{image::ImportImageOptions, Docker};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use futures_lite::StreamExt;
use tracing::{debug, info};

use crate::{
    element::{Consumer, Element},
    Digest,
};

use super::tarball::Tarball;

/// Loads an image into the local Docker daemon by building the same
/// docker-save-v1.2 tar the [`Tarball`] sink writes, then importing it.
pub struct Daemon {
    tarball: Tarball,
    scratch: async_tempfile::TempFile,
}

#[bon::bon]
impl Daemon {
    #[builder]
    pub async fn new(#[builder(default)] repo_tags: Vec<String>) -> Result<Self> {
        let scratch = async_tempfile::TempFile::new().await.context("reserve scratch tarball")?;
        let tarball = Tarball::builder()
            .output(scratch.file_path().to_path_buf())
            .repo_tags(repo_tags)
            .build()
            .await
            .context("build tarball writer")?;
        Ok(Self { tarball, scratch })
    }
}

#[async_trait]
impl Consumer for Daemon {
    async fn want(&mut self, digest: &Digest) -> Result<bool> {
        self.tarball.want(digest).await
    }

    async fn accept(&mut self, element: Element) -> Result<()> {
        self.tarball.accept(element).await
    }

    async fn finalize(&mut self) -> Result<()> {
        self.tarball.finalize().await.context("write scratch tarball")?;

        let docker = Docker::connect_with_local_defaults().context("connect to docker daemon")?;
        let tar_bytes = tokio::fs::read(self.scratch.file_path())
            .await
            .context("read scratch tarball")?;

        let options = ImportImageOptions::default();
        let mut stream = docker.import_image(options, tar_bytes.into(), None);
        while let Some(info) = stream.next().await.transpose().context("load image into daemon")? {
            if let Some(error) = info.error {
                return Err(eyre!("daemon image load failed: {error}"));
            }
            if let Some(status) = info.status {
                debug!(%status, "daemon load progress");
            }
            if let Some(stream_line) = info.stream {
                debug!(line = %stream_line.trim_end(), "daemon load progress");
            }
        }

        info!("loaded image into local docker daemon");
        Ok(())
    }
}
