use color_eyre::Result;
use occystrap_lib::{
    element::{Consumer, Element},
    pipeline::Source,
    source, Platform, Reference,
};
use simple_test_case::test_case;

struct Counting {
    configs: usize,
    layers: usize,
}

#[async_trait::async_trait]
impl Consumer for Counting {
    async fn accept(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { .. } => self.configs += 1,
            Element::Layer { .. } => self.layers += 1,
        }
        Ok(())
    }
    async fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test_case("docker.io/library/alpine:latest", None; "docker.io/library/alpine:latest_default")]
#[test_case("docker.io/library/alpine:latest", Some(Platform::linux_amd64()); "docker.io/library/alpine:latest.linux_amd64")]
#[test_case("docker.io/library/alpine:latest", Some(Platform::linux_arm64()); "docker.io/library/alpine:latest.linux_arm64")]
#[test_log::test(tokio::test)]
async fn pull_from_registry(image: &str, platform: Option<Platform>) -> Result<()> {
    let reference = image.parse::<Reference>()?;
    let registry = source::Registry::builder()
        .reference(reference)
        .maybe_platform(platform)
        .build()
        .await?;

    let mut consumer = Counting { configs: 0, layers: 0 };
    Box::new(registry).emit(&mut consumer).await?;

    assert_eq!(consumer.configs, 1, "image should emit exactly one config");
    assert!(consumer.layers > 0, "image should have at least one layer");

    Ok(())
}
