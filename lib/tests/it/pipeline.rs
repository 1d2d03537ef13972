use astral_tokio_tar::{Builder, Header};
use async_tempfile::{TempDir, TempFile};
use bytes::Bytes;
use color_eyre::Result;
use occystrap_lib::{
    digest, element::Element, filter::NormalizeTimestamps, pipeline, sink, source,
};

/// Build a real single-file tarball with a non-zero mtime, so normalizing it
/// to 0 on the way through is guaranteed to change its bytes and digest.
async fn build_test_tar(path: &str, data: &[u8]) -> Bytes {
    let scratch = TempFile::new().await.expect("create scratch tar");
    let mut builder = Builder::new(scratch);
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .await
        .expect("append entry");
    let scratch = builder.into_inner().await.expect("finish tar");
    scratch.sync_all().await.expect("sync tar");
    Bytes::from(tokio::fs::read(scratch.file_path()).await.expect("read tar bytes"))
}

/// Exercises the full source -> filter -> sink chain with real on-disk
/// tarballs at both ends: write a tarball with `sink::Tarball`, read it back
/// with `source::Tarball` through a `normalize-timestamps` filter into a
/// `sink::Directory`, and confirm the layer blob that lands on disk differs
/// from the original (the mtime rewrite changed its bytes).
#[tokio::test]
async fn tarball_through_normalize_timestamps_to_directory() -> Result<()> {
    let workdir = TempDir::new().await?;
    let source_tar = workdir.dir_path().join("source.tar");

    let layer_bytes = build_test_tar("file.txt", b"hello layer").await;
    let layer_digest = digest::hash_bytes(&layer_bytes);
    let config_bytes = serde_json::to_vec(&serde_json::json!({
        "rootfs": {"type": "layers", "diff_ids": [layer_digest.to_string()]},
        "history": [{"created": "2023-11-14T22:13:20Z", "created_by": "test"}],
    }))?;
    let config_digest = digest::hash_bytes(&config_bytes);

    let mut writer = sink::Tarball::builder()
        .output(source_tar.clone())
        .repo_tags(vec!["occystrap-pipeline-test:latest".to_string()])
        .build()
        .await?;
    {
        use occystrap_lib::element::Consumer;
        writer
            .accept(Element::Config {
                name: format!("{}.json", config_digest.as_hex()),
                digest: config_digest.clone(),
                bytes: Bytes::from(config_bytes),
            })
            .await?;
        writer
            .accept(Element::Layer {
                name: layer_digest.tarball_filename(),
                layer: occystrap_lib::Layer::builder()
                    .digest(layer_digest.clone())
                    .size(layer_bytes.len() as u64)
                    .media_type(occystrap_lib::LayerMediaType::default())
                    .build(),
                handle: Box::pin(futures_lite::stream::once(Ok(layer_bytes.clone()))),
            })
            .await?;
        writer.finalize().await?;
    }
    assert!(tokio::fs::try_exists(&source_tar).await.unwrap_or(false));

    let output_dir = workdir.dir_path().join("out");
    let reader = source::Tarball::builder().path(source_tar).build().await?;
    let directory_sink = sink::Directory::builder()
        .output(output_dir.clone())
        .image("occystrap-pipeline-test")
        .tag("latest")
        .build()
        .await?;

    let filters: Vec<Box<dyn pipeline::Filter>> = vec![Box::new(NormalizeTimestamps::new(Some(0)))];
    let consumer = pipeline::build_chain(filters, Box::new(directory_sink));
    pipeline::run(Box::new(reader), consumer).await?;

    let manifest_bytes = tokio::fs::read(output_dir.join("manifest.json")).await?;
    let manifest: occystrap_lib::manifest::DockerSaveManifest =
        serde_json::from_slice(&manifest_bytes)?;
    assert_eq!(manifest.0.len(), 1);
    assert_eq!(manifest.0[0].layers.len(), 1);

    let written_layer_blob = output_dir.join(&manifest.0[0].layers[0]);
    let written_bytes = tokio::fs::read(&written_layer_blob).await?;
    assert_ne!(
        written_bytes.as_slice(),
        layer_bytes.as_ref(),
        "normalize-timestamps should have rewritten the layer bytes"
    );

    Ok(())
}
