//! Docker CLI credential resolution, and the local-daemon image lookup shared
//! by the daemon source and sink.

use std::{collections::HashMap, process::Stdio};

use base64::Engine;
use bollard::Docker;
use color_eyre::{
    eyre::{eyre, Context, OptionExt, Result},
    Section, SectionExt,
};
use derive_more::Debug;
use serde::Deserialize;
use tap::TapFallible;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{homedir, Authentication, Reference};

impl Authentication {
    /// Read authentication information for the host from the configured Docker
    /// credentials, if any. Falls back to `Authentication::None` rather than
    /// erroring, since an anonymous pull is often still valid (public images).
    ///
    /// Reference:
    /// - https://docs.docker.com/reference/cli/docker/login
    /// - https://github.com/docker/docker-credential-helpers
    pub async fn docker(target: &Reference) -> Result<Self> {
        match Self::docker_internal(target).await {
            Ok(auth) => {
                debug!("inferred docker auth: {auth:?}");
                Ok(auth)
            }
            Err(err) => {
                warn!(?err, "unable to infer docker auth; trying unauthenticated");
                Ok(Authentication::None)
            }
        }
    }

    async fn docker_internal(target: &Reference) -> Result<Self> {
        let host = &target.host;
        let path = homedir()
            .context("get home directory")?
            .join(".docker")
            .join("config.json");

        let config = tokio::fs::read_to_string(&path)
            .await
            .context("read docker config")
            .with_section(|| path.display().to_string().header("Config file path:"))?;

        serde_json::from_str::<DockerConfig>(&config)
            .context("parse docker config")
            .with_section(|| path.display().to_string().header("Config file path:"))
            .with_section(|| config.header("Config file content:"))?
            .auth(host)
            .await
            .tap_ok(|auth| info!("inferred docker auth: {auth:?}"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    /// The default credential store.
    ///
    /// The value of the config property is the suffix of the program to use
    /// (i.e. everything after `docker-credential-`).
    creds_store: Option<String>,

    /// Credential stores per host. Keys specify the registry domain, values
    /// specify the suffix of the program to use.
    #[serde(default)]
    cred_helpers: HashMap<String, String>,

    /// Logged in hosts.
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

impl DockerConfig {
    /// Some hosts have fallback keys; this returns the keys to try for a host.
    fn auth_keys(host: &str) -> impl Iterator<Item = &str> {
        if host == "docker.io" {
            vec!["docker.io", "https://index.docker.io/v1/"]
        } else {
            vec![host]
        }
        .into_iter()
    }

    async fn auth(&self, host: &str) -> Result<Authentication> {
        for key in Self::auth_keys(host) {
            if let Some(auth) = self.auths.get(key) {
                match auth.decode(self, key).await {
                    Ok(auth) => return Ok(auth),
                    Err(err) => {
                        warn!("failed decoding auth for host {key:?}: {err:?}");
                        continue;
                    }
                }
            }
        }

        Ok(Authentication::None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DockerAuth {
    /// The credentials are stored in plain text, not in a helper.
    Plain {
        /// Base64 encoded `username:password`.
        auth: String,
    },

    /// The credentials are stored in a helper; use the host with the
    /// top-level [`DockerConfig`] to determine which helper to invoke.
    Helper {},
}

impl DockerAuth {
    async fn decode(&self, config: &DockerConfig, host: &str) -> Result<Authentication> {
        match self {
            DockerAuth::Plain { auth } => Self::decode_plain(auth),
            DockerAuth::Helper {} => Self::decode_helper(config, host).await,
        }
    }

    fn decode_plain(auth: &str) -> Result<Authentication> {
        let auth = base64::engine::general_purpose::STANDARD
            .decode(auth)
            .context("decode base64 auth key")?;
        let auth = String::from_utf8(auth).context("parse auth key as utf-8")?;
        let (username, password) = auth
            .split_once(':')
            .ok_or_eyre("invalid auth key format, expected username:password")?;
        Ok(Authentication::basic(username, password))
    }

    async fn decode_helper(config: &DockerConfig, host: &str) -> Result<Authentication> {
        let helper = config
            .cred_helpers
            .get(host)
            .or(config.creds_store.as_ref())
            .ok_or_eyre("no helper found for host")?;

        let binary = format!("docker-credential-{helper}");
        let mut exec = tokio::process::Command::new(&binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn docker credential helper")
            .with_section(|| binary.clone().header("Helper binary:"))?;

        if let Some(mut stdin) = exec.stdin.take() {
            stdin
                .write_all(host.as_bytes())
                .await
                .context("write request to helper")?;
            drop(stdin);
        }

        let output = exec.wait_with_output().await.context("run helper")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            return Err(eyre!("auth helper failed with status: {}", output.status))
                .with_section(|| binary.clone().header("Helper binary:"))
                .with_section(|| host.to_string().header("Host:"))
                .with_section(|| output.status.to_string().header("Command status code:"))
                .with_section(|| stderr.header("Stderr:"))
                .with_section(|| stdout.header("Stdout:"));
        }

        let credential = serde_json::from_slice::<DockerCredential>(&output.stdout)
            .context("decode helper output")
            .with_section(|| binary.header("Helper binary:"))?;
        Ok(Authentication::basic(
            credential.username,
            credential.secret,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerCredential {
    username: String,
    secret: String,
}

/// Find the ID of the image for the specified reference in the local Docker
/// daemon. Daemon images are keyed by short tag/digest strings rather than
/// fully qualified references, so this matches against whatever the caller
/// provided directly.
pub(crate) async fn find_image(docker: &Docker, reference: &str) -> Result<String> {
    let opts = bollard::image::ListImagesOptions::<String> {
        all: true,
        ..Default::default()
    };

    let images = docker
        .list_images(Some(opts))
        .await
        .context("list images")?;

    let id_by_tag_or_digest = images
        .iter()
        .flat_map(|i| {
            i.repo_tags
                .iter()
                .map(|t| t.as_str())
                .chain(i.repo_digests.iter().map(|d| d.as_str()))
                .zip(std::iter::repeat(i.id.as_str()))
        })
        .collect::<HashMap<_, _>>();

    if let Some(image) = id_by_tag_or_digest.get(reference) {
        return Ok(image.to_string());
    }

    let listings = id_by_tag_or_digest.keys().collect::<Vec<_>>();
    Err(eyre!("image not found: {reference}"))
        .with_section(|| format!("{listings:#?}").header("Images:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_keys_adds_docker_io_fallback() {
        let keys: Vec<_> = DockerConfig::auth_keys("docker.io").collect();
        assert_eq!(keys, vec!["docker.io", "https://index.docker.io/v1/"]);
    }

    #[test]
    fn auth_keys_passes_through_other_hosts() {
        let keys: Vec<_> = DockerConfig::auth_keys("ghcr.io").collect();
        assert_eq!(keys, vec!["ghcr.io"]);
    }

    #[test]
    fn decode_plain_splits_username_password() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:hunter2");
        let auth = DockerAuth::decode_plain(&encoded).expect("decode");
        match auth {
            Authentication::Basic { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "hunter2");
            }
            other => panic!("expected basic auth, got {other:?}"),
        }
    }
}
