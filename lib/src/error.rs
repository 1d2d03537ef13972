//! Error kinds surfaced across the pipeline.
//!
//! Most errors in this crate are plain `color_eyre::Report`s built with
//! `eyre!`/`bail!`/`.context(...)`; the marker types here exist only for the
//! handful of kinds the CLI needs to recognize (for exit-code routing, see
//! `occystrap`'s `main.rs`) or that tests want to assert on by type rather
//! than by message. Downcast with `report.downcast_ref::<T>()`.

use derive_more::Display;

/// A source or destination URI could not be parsed.
#[derive(Debug, Display)]
#[display("invalid URI: {reason}")]
pub struct UriParseError {
    pub reason: String,
}

impl std::error::Error for UriParseError {}

impl UriParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A registry required authentication but none was configured.
#[derive(Debug, Display)]
#[display("authentication required for {host}")]
pub struct AuthRequired {
    pub host: String,
}

/// A registry rejected the credentials that were provided.
#[derive(Debug, Display)]
#[display("authentication failed for {host}")]
pub struct AuthFailed {
    pub host: String,
}

impl std::error::Error for AuthRequired {}
impl std::error::Error for AuthFailed {}

/// A manifest list/index had no entry matching the requested platform.
#[derive(Debug, Display)]
#[display("no manifest entry matches platform {requested}")]
pub struct NoMatchingPlatform {
    pub requested: String,
    pub available: Vec<String>,
}

impl std::error::Error for NoMatchingPlatform {}

/// A computed digest did not match the digest declared for a blob.
#[derive(Debug, Display)]
#[display("digest mismatch: expected {expected}, computed {computed}")]
pub struct DigestMismatch {
    pub expected: String,
    pub computed: String,
}

impl std::error::Error for DigestMismatch {}

/// A `docker save` tarball predates the 1.10 content-addressable layout.
#[derive(Debug, Display)]
#[display("unsupported tarball format: {reason}")]
pub struct UnsupportedTarballFormat {
    pub reason: String,
}

impl std::error::Error for UnsupportedTarballFormat {}
