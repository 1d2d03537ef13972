use async_tempfile::TempDir;
use color_eyre::Result;
use occystrap_lib::{
    element::{Consumer, Element},
    pipeline::Source,
    sink, source,
};
use simple_test_case::test_case;

async fn daemon_available() -> bool {
    match bollard::Docker::connect_with_local_defaults() {
        Ok(docker) => docker.ping().await.is_ok(),
        Err(_) => false,
    }
}

#[test_case("hello-world:latest"; "hello-world")]
#[test_case("alpine:latest"; "alpine")]
#[test_log::test(tokio::test)]
async fn pull_from_daemon(image: &str) -> Result<()> {
    if !daemon_available().await {
        eprintln!("skipping test; docker daemon not available");
        return Ok(());
    }

    let daemon = source::Daemon::builder().reference(image).build().await?;

    struct Counting(usize);
    #[async_trait::async_trait]
    impl Consumer for Counting {
        async fn accept(&mut self, _element: Element) -> Result<()> {
            self.0 += 1;
            Ok(())
        }
        async fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    let mut consumer = Counting(0);
    Box::new(daemon).emit(&mut consumer).await?;
    assert!(consumer.0 > 0, "image should emit at least the config element");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn round_trip_through_load() -> Result<()> {
    if !daemon_available().await {
        eprintln!("skipping test; docker daemon not available");
        return Ok(());
    }

    let tmp = TempDir::new().await?;
    let tarball_path = tmp.dir_path().join("roundtrip.tar");

    let source = source::Daemon::builder()
        .reference("alpine:latest")
        .build()
        .await?;
    let sink = sink::Tarball::builder()
        .output(tarball_path.clone())
        .repo_tags(vec!["occystrap-roundtrip:latest".to_string()])
        .build()
        .await?;
    let mut sink: Box<dyn Consumer> = Box::new(sink);
    Box::new(source).emit(sink.as_mut()).await?;
    sink.finalize().await?;

    assert!(tokio::fs::try_exists(&tarball_path).await.unwrap_or(false));

    let daemon_sink = sink::Daemon::builder()
        .repo_tags(vec!["occystrap-roundtrip:latest".to_string()])
        .build()
        .await?;
    let replay = source::Tarball::builder().path(tarball_path).build().await?;
    let mut daemon_sink: Box<dyn Consumer> = Box::new(daemon_sink);
    Box::new(replay).emit(daemon_sink.as_mut()).await?;
    daemon_sink.finalize().await?;

    Ok(())
}
