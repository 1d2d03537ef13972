use occystrap_lib::{Digest, Reference};
use proptest::prelude::*;
use simple_test_case::test_case;
use std::str::FromStr;

#[test_case(
    "docker.io/library/ubuntu:latest",
    Reference::builder().host("docker.io").namespace("library").name("ubuntu").tag("latest").build();
    "docker.io/library/ubuntu:latest"
)]
#[test_case(
    "docker.io/library/ubuntu",
    Reference::builder().host("docker.io").namespace("library").name("ubuntu").build();
    "docker.io/library/ubuntu"
)]
#[test]
fn parse(input: &str, expected: Reference) {
    let reference = input.parse::<Reference>().unwrap();
    pretty_assertions::assert_eq!(reference, expected);
}

#[test]
fn parse_digest_form() {
    let digest = Digest::from_str(
        "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4",
    )
    .expect("parse digest");
    let reference = "ghcr.io/someuser/somerepo@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4"
        .parse::<Reference>()
        .expect("parse reference");
    pretty_assertions::assert_eq!(
        reference,
        Reference::builder()
            .host("ghcr.io")
            .namespace("someuser")
            .name("somerepo")
            .digest(digest)
            .build()
    );
}

#[test]
fn expands_short_form_to_docker_io() {
    let reference = "alpine".parse::<Reference>().expect("parse");
    assert_eq!(reference.host, "docker.io");
    assert_eq!(reference.namespace, "library");
    assert_eq!(reference.name, "alpine");
}

#[test_case(
    Reference::builder().host("docker.io").namespace("library").name("ubuntu").tag("latest").build(),
    "docker.io/library/ubuntu:latest";
    "docker.io/library/ubuntu:latest"
)]
#[test_case(
    Reference::builder().host("docker.io").namespace("library").name("ubuntu").build(),
    "docker.io/library/ubuntu:latest";
    "default tag renders as latest"
)]
#[test]
fn display(reference: Reference, expected: &str) {
    pretty_assertions::assert_eq!(reference.to_string(), expected);
}

#[test_case("/repo:tag"; "/repo:tag")]
#[test_case(""; "empty")]
#[test]
fn invalid_references(input: &str) {
    let _ = input.parse::<Reference>().expect_err("must error");
}

#[test]
fn repository_joins_namespace_and_name() {
    let reference = Reference::builder()
        .host("docker.io")
        .namespace("library")
        .name("ubuntu")
        .tag("latest")
        .build();
    assert_eq!(reference.repository(), "library/ubuntu");
}

fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]*(\\.[a-z0-9-]+)*\\.[a-z]{2,}".prop_filter("no empty labels", |s| !s.contains(".."))
}

fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}"
}

fn tag_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,31}"
}

fn digest_strategy() -> impl Strategy<Value = Digest> {
    "[a-f0-9]{64}".prop_map(|hex| Digest::from_sha256(&hex).expect("valid hex digest"))
}

fn reference_strategy() -> impl Strategy<Value = Reference> {
    (
        host_strategy(),
        segment_strategy(),
        segment_strategy(),
        prop_oneof![
            tag_strategy().prop_map(|tag| (Some(tag), None)),
            digest_strategy().prop_map(|digest| (None, Some(digest))),
        ],
    )
        .prop_map(|(host, namespace, name, (tag, digest))| {
            let builder = Reference::builder().host(host).namespace(namespace).name(name);
            match (tag, digest) {
                (Some(tag), _) => builder.tag(&tag).build(),
                (_, Some(digest)) => builder.digest(digest).build(),
                _ => unreachable!(),
            }
        })
}

proptest! {
    #[test]
    fn roundtrip_parse_format(reference in reference_strategy()) {
        let formatted = reference.to_string();
        let parsed = formatted.parse::<Reference>().expect("parse formatted reference");
        prop_assert_eq!(reference, parsed);
    }

    #[test]
    fn roundtrip_digest_parse_format(digest in digest_strategy()) {
        let formatted = digest.to_string();
        let parsed = Digest::from_str(&formatted).expect("parse formatted digest");
        prop_assert_eq!(digest, parsed);
    }
}
