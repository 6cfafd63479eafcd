use pretty_assertions::assert_eq;
use rcn_config::{ConfigWarning, RcnConfig};

#[test]
fn reports_unknown_keys_with_full_paths() {
    let text = r#"
typo = 1

[jdwp]
reply_timeuot_ms = 10

[mapping]
max_dept = 4
"#;

    let (_config, diagnostics) =
        RcnConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert_eq!(
        diagnostics.unknown_keys,
        vec!["jdwp.reply_timeuot_ms", "mapping.max_dept", "typo"]
    );
}

#[test]
fn clean_config_has_no_diagnostics() {
    let (_config, diagnostics) =
        RcnConfig::load_from_str_with_diagnostics("[mapping]\nlimit_sdk = true\n")
            .expect("config should parse");
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
}

#[test]
fn warns_about_zero_bounds_and_empty_prefixes() {
    let text = r#"
[jdwp]
max_in_flight = 0

[mapping]
excluded_packages = ["sun", " "]
"#;

    let (_config, diagnostics) =
        RcnConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    let paths: Vec<_> = diagnostics
        .warnings
        .iter()
        .filter_map(|warning| match warning {
            ConfigWarning::InvalidValue { toml_path, .. } => Some(toml_path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        paths,
        vec!["jdwp.max_in_flight", "mapping.excluded_packages[1]"]
    );
}

#[test]
fn warns_about_unparseable_log_directives() {
    let (_config, diagnostics) =
        RcnConfig::load_from_str_with_diagnostics("[logging]\nlevel = \"rcn.graph=loud\"\n")
            .expect("config should parse");
    assert!(
        diagnostics
            .warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LoggingLevelInvalid { .. })),
        "{diagnostics:?}"
    );
}
