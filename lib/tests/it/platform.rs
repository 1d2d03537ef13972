use occystrap_lib::Platform;
use simple_test_case::test_case;

#[test_case("linux/amd64", Platform::linux_amd64(); "linux/amd64")]
#[test_case("linux/arm64/v8", Platform::linux_arm64().with_variant("v8"); "linux/arm64/v8")]
#[test]
fn parse(input: &str, expected: Platform) {
    let platform = input.parse::<Platform>().unwrap();
    pretty_assertions::assert_eq!(platform, expected);
}

#[test_case("linux"; "linux")]
#[test_case("linux/"; "linux/")]
#[test_case("/arm64/v8"; "/arm64/v8")]
#[test_case("linux/amd64/v8/extra"; "linux/amd64/v8/extra")]
#[test]
fn parse_invalid(input: &str) {
    let parsed = input.parse::<Platform>();
    let _ = parsed.expect_err("must error");
}

#[test_case(Platform::linux_amd64(), "linux/amd64"; "linux/amd64")]
#[test_case(Platform::linux_arm64().with_variant("v8"), "linux/arm64/v8"; "linux/arm64/v8")]
#[test]
fn display(platform: Platform, expected: &str) {
    pretty_assertions::assert_eq!(platform.to_string(), expected);
}

#[test]
fn matches_ignores_extra_os_features() {
    let requested = Platform::linux_amd64();
    let candidate = Platform::builder()
        .os(Platform::LINUX)
        .architecture(Platform::AMD64)
        .os_features(vec!["some-feature".to_string()])
        .build();
    assert!(requested.matches(&candidate));
}

#[test]
fn matches_rejects_different_architecture() {
    let requested = Platform::linux_amd64();
    let candidate = Platform::linux_arm64();
    assert!(!requested.matches(&candidate));
}
