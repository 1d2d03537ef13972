// These tests require that your local docker instance is authenticated with
// the servers. This is performed before tests are run in CI, but you may
// need to `docker login` locally.
use color_eyre::Result;
use occystrap_lib::{
    element::{Consumer, Element},
    pipeline::Source,
    source, Authentication, Reference,
};
use simple_test_case::test_case;

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

#[test_case("quay.io/fossa/hubble-api:latest"; "quay.io/fossa/hubble-api:latest")]
#[test_case("ghcr.io/fossas/sherlock/server:latest"; "ghcr.io/fossas/sherlock/server:latest")]
#[test_log::test(tokio::test)]
async fn pull_authed(image: &str) -> Result<()> {
    let reference = image.parse::<Reference>()?;
    let auth = Authentication::docker(&reference).await?;
    if matches!(auth, Authentication::None) {
        eprintln!("skipping test; no docker auth found");
        return Ok(());
    }

    let registry = source::Registry::builder()
        .reference(reference)
        .auth(auth)
        .build()
        .await?;

    let mut consumer = Counting(0);
    Box::new(registry).emit(&mut consumer).await?;
    assert!(consumer.0 > 0, "image should emit at least the config element");

    Ok(())
}
