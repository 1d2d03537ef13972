use async_compression::tokio::bufread::{GzipEncoder, ZstdEncoder};
use bytes::Bytes;
use color_eyre::Result;
use futures_lite::{stream, Stream, StreamExt};
use occystrap_lib::transform;
use tokio::io::{AsyncReadExt, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};

fn byte_stream(input: Vec<u8>) -> impl Stream<Item = transform::Chunk> {
    stream::once(Ok(Bytes::from(input)))
}

async fn buffer(stream: impl Stream<Item = transform::Chunk>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    tokio::pin!(stream);
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

async fn gzip_compress(input: &[u8]) -> Result<Vec<u8>> {
    let reader = BufReader::new(input);
    let mut encoder = GzipEncoder::new(reader);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await?;
    Ok(out)
}

async fn zstd_compress(input: &[u8]) -> Result<Vec<u8>> {
    let reader = BufReader::new(input);
    let mut encoder = ZstdEncoder::new(reader);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await?;
    Ok(out)
}

#[tokio::test]
async fn identity_passes_bytes_through_unchanged() -> Result<()> {
    let input = b"hello, world!".to_vec();
    let result = buffer(transform::identity(byte_stream(input.clone()))).await?;
    assert_eq!(result, input);
    Ok(())
}

#[tokio::test]
async fn gzip_decodes_compressed_input() -> Result<()> {
    let input = b"hello, world! this is a layer tar, pretend.".to_vec();
    let compressed = gzip_compress(&input).await?;
    let stream = ReaderStream::new(StreamReader::new(byte_stream(compressed)));
    let decoded = buffer(transform::gzip(stream)).await?;
    assert_eq!(decoded, input);
    Ok(())
}

#[tokio::test]
async fn zstd_decodes_compressed_input() -> Result<()> {
    let input = b"hello, world! this is a layer tar, pretend.".to_vec();
    let compressed = zstd_compress(&input).await?;
    let stream = ReaderStream::new(StreamReader::new(byte_stream(compressed)));
    let decoded = buffer(transform::zstd(stream)).await?;
    assert_eq!(decoded, input);
    Ok(())
}

#[tokio::test]
async fn gzip_roundtrips_through_encode_and_decode() -> Result<()> {
    let input = b"occystrap moves container images between registries, daemons, and disk".to_vec();
    let compressed = buffer(transform::gzip_encode(byte_stream(input.clone()))).await?;
    let stream = ReaderStream::new(StreamReader::new(byte_stream(compressed)));
    let decoded = buffer(transform::gzip(stream)).await?;
    assert_eq!(decoded, input);
    Ok(())
}

#[tokio::test]
async fn zstd_roundtrips_through_encode_and_decode() -> Result<()> {
    let input = b"occystrap moves container images between registries, daemons, and disk".to_vec();
    let compressed = buffer(transform::zstd_encode(byte_stream(input.clone()))).await?;
    let stream = ReaderStream::new(StreamReader::new(byte_stream(compressed)));
    let decoded = buffer(transform::zstd(stream)).await?;
    assert_eq!(decoded, input);
    Ok(())
}
