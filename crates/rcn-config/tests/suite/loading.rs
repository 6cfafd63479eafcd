use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rcn_config::{ConfigError, MappingConfig, NestingCriterion, RcnConfig};
use tempfile::NamedTempFile;

#[test]
fn empty_file_yields_defaults() {
    let config = RcnConfig::load_from_str("").expect("empty config should parse");
    assert_eq!(config, RcnConfig::default());
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.stderr);
    assert_eq!(config.mapping.max_array_elements, 256);
    assert!(config.mapping.suspend_vm);
    assert_eq!(config.mapping.max_depth, None);
    assert_eq!(
        config.mapping.nesting_criterion,
        NestingCriterion::PreferModifier
    );
}

#[test]
fn defaults_round_trip_through_toml() {
    let config = RcnConfig::default();
    let text = toml::to_string(&config).expect("serialize defaults");
    let parsed = RcnConfig::load_from_str(&text).expect("reparse defaults");
    assert_eq!(parsed, config);
}

#[test]
fn loads_every_section_from_a_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[logging]
level = "rcn.graph=debug"
json = true

[jdwp]
reply_timeout_ms = 250
max_in_flight = 4

[mapping]
excluded_packages = ["com.example.generated"]
shallow_packages = ["com.example.api"]
deep_fields = ["SysLoader-com.example.Cache.entries"]
limit_sdk = true
max_depth = 3
max_array_elements = 16
suspend_vm = false
nesting_criterion = "synthetic-field"
"#
    )
    .unwrap();

    let config = RcnConfig::load_from_path(file.path()).expect("config should load");
    assert_eq!(config.logging.level, "rcn.graph=debug");
    assert!(config.logging.json);

    let client = config.jdwp.client_config();
    assert_eq!(client.reply_timeout, Duration::from_millis(250));
    assert_eq!(client.max_in_flight, 4);
    assert_eq!(client.handshake_timeout, Duration::from_secs(5));

    assert_eq!(
        config.mapping,
        MappingConfig {
            excluded_packages: vec!["com.example.generated".to_owned()],
            shallow_packages: vec!["com.example.api".to_owned()],
            deep_fields: vec!["SysLoader-com.example.Cache.entries".to_owned()],
            limit_sdk: true,
            max_depth: Some(3),
            max_array_elements: 16,
            suspend_vm: false,
            nesting_criterion: NestingCriterion::SyntheticField,
            resolve_concurrency: 8,
        }
    );
}

#[test]
fn missing_file_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = RcnConfig::load_from_path(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => {
            assert!(reported.ends_with("absent.toml"), "{reported}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unknown_nesting_criteria_name_the_accepted_ones() {
    let err = RcnConfig::load_from_str(
        r#"
[mapping]
nesting_criterion = "by-name"
"#,
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    assert!(message.contains("by-name"), "{message}");
    assert!(message.contains("prefer-modifier"), "{message}");
    assert!(!message.contains('\n'), "{message}");
}
