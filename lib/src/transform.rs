//! Primitives for stream transformations.

use std::pin::Pin;

use async_compression::tokio::bufread::{
    GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder,
};
use async_compression::Level;
use bytes::Bytes;
use color_eyre::Result;
use futures_lite::Stream;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::LayerMediaTypeFlag;

/// Convenience alias for a chunk of bytes in a stream.
pub type Chunk = Result<Bytes, std::io::Error>;

/// Compression codec a layer can be written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// gzip, deterministic (header timestamp zeroed by `async-compression`'s encoder).
    Gzip,
    /// zstd, deterministic by default.
    Zstd,
}

impl std::str::FromStr for Compression {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => color_eyre::eyre::bail!("unknown compression: {other}"),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

/// Identity transformer.
pub fn identity(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    stream
}

/// Decompress the stream using gzip.
pub fn gzip(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = GzipDecoder::new(reader);
    ReaderStream::new(inner)
}

/// Decompress the stream using zstd.
pub fn zstd(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = ZstdDecoder::new(reader);
    ReaderStream::new(inner)
}

/// Compress the stream with gzip at the default level. The encoder's header
/// carries no timestamp, so output is deterministic for identical input.
pub fn gzip_encode(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = GzipEncoder::with_quality(reader, Level::Default);
    ReaderStream::new(inner)
}

/// Compress the stream with zstd at the default level. zstd's frame format has
/// no embedded timestamp, so output is deterministic for identical input.
pub fn zstd_encode(
    stream: impl Stream<Item = Chunk> + Send + 'static,
) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = ZstdEncoder::with_quality(reader, Level::Default);
    ReaderStream::new(inner)
}

/// Apply a sequence of transformations to the stream based on the media type flags.
pub fn sequence(
    stream: impl Stream<Item = Chunk> + Send + 'static,
    flags: &[LayerMediaTypeFlag],
) -> Pin<Box<dyn Stream<Item = Chunk> + Send>> {
    let mut stream: Pin<Box<dyn Stream<Item = Chunk> + Send>> = Box::pin(stream);
    for flag in flags {
        match flag {
            LayerMediaTypeFlag::Zstd => stream = Box::pin(zstd(stream)),
            LayerMediaTypeFlag::Gzip => stream = Box::pin(gzip(stream)),
            LayerMediaTypeFlag::Foreign => (),
        }
    }
    stream
}

/// Sniff a blob's compression from its leading bytes, using the magic-byte
/// fallback (used when the declared media type is absent or untrustworthy, e.g.
/// a daemon tar export that has no media type at all).
pub fn detect_compression(prefix: &[u8]) -> Compression {
    const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
    const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

    if prefix.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if prefix.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gzip_magic() {
        assert_eq!(detect_compression(&[0x1f, 0x8b, 0x08, 0x00]), Compression::Gzip);
    }

    #[test]
    fn detects_zstd_magic() {
        assert_eq!(
            detect_compression(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]),
            Compression::Zstd
        );
    }

    #[test]
    fn falls_back_to_none() {
        assert_eq!(detect_compression(b"plain tar data here"), Compression::None);
    }

    #[test]
    fn compression_roundtrips_through_string() {
        for c in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let parsed: Compression = c.to_string().parse().expect("parse");
            assert_eq!(parsed, c);
        }
    }
}
