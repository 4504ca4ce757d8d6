// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deep validation tests for `rumi-config`.

use rumi_config::{ConfigError, ConfigWarning, LocalPackMode, RumiConfig, SecurityMode, merge_configs, parse_toml, validate_config};

/// Extract error reasons from a `ConfigError::ValidationError`.
fn validation_reasons(err: ConfigError) -> Vec<String> {
    match err {
        ConfigError::ValidationError { reasons } => reasons,
        other => panic!("expected ValidationError, got {other:?}"),
    }
}

// ===========================================================================
// 1. The default config passes validation modulo the expected GID warning
// ===========================================================================

#[test]
fn default_config_has_only_missing_gid_warning() {
    let warnings = validate_config(&RumiConfig::default()).unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(matches!(
        &warnings[0],
        ConfigWarning::MissingOptionalField { field, .. } if field == "egress_socket_gid"
    ));
}

#[test]
fn fully_specified_config_has_no_warnings() {
    let cfg = RumiConfig { egress_socket_gid: Some(1000), capability_socket_gid: Some(1000), ..RumiConfig::default() };
    let warnings = validate_config(&cfg).unwrap();
    assert!(warnings.is_empty(), "expected zero warnings: {warnings:?}");
}

// ===========================================================================
// 2. Empty roots are hard errors
// ===========================================================================

#[test]
fn empty_user_data_root_is_error() {
    let cfg = RumiConfig { user_data_root: String::new(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("user_data_root must not be empty")));
}

#[test]
fn whitespace_only_ecosystem_root_is_error() {
    let cfg = RumiConfig { ecosystem_root: "   ".into(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("ecosystem_root must not be empty")));
}

#[test]
fn both_roots_empty_reports_both_errors() {
    let cfg = RumiConfig { user_data_root: String::new(), ecosystem_root: String::new(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert_eq!(reasons.len(), 2);
}

// ===========================================================================
// 3. Socket mode validation
// ===========================================================================

#[test]
fn valid_octal_socket_modes_pass() {
    for mode in ["0600", "0644", "0660", "0777"] {
        let cfg = RumiConfig { egress_socket_mode: mode.into(), capability_socket_mode: mode.into(), ..RumiConfig::default() };
        validate_config(&cfg).unwrap_or_else(|e| panic!("mode '{mode}' should be valid: {e}"));
    }
}

#[test]
fn non_octal_digit_socket_mode_is_error() {
    let cfg = RumiConfig { egress_socket_mode: "0989".into(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("egress_socket_mode")));
}

#[test]
fn socket_mode_not_starting_with_zero_is_error() {
    let cfg = RumiConfig { capability_socket_mode: "1660".into(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("capability_socket_mode")));
}

#[test]
fn socket_mode_wrong_length_is_error() {
    let cfg = RumiConfig { egress_socket_mode: "660".into(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("egress_socket_mode")));
}

#[test]
fn both_socket_modes_invalid_reports_both() {
    let cfg = RumiConfig { egress_socket_mode: "bad".into(), capability_socket_mode: "9".into(), ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert_eq!(reasons.len(), 2);
}

// ===========================================================================
// 4. Memory limit validation
// ===========================================================================

#[test]
fn zero_memory_limit_is_error() {
    let cfg = RumiConfig { default_memory_limit_mb: 0, ..RumiConfig::default() };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("default_memory_limit_mb")));
}

#[test]
fn large_memory_limit_warns_but_passes() {
    let cfg = RumiConfig { default_memory_limit_mb: 8192, egress_socket_gid: Some(1), capability_socket_gid: Some(1), ..RumiConfig::default() };
    let warnings = validate_config(&cfg).unwrap();
    assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeMemoryLimit { mb } if *mb == 8192)));
}

#[test]
fn memory_limit_at_threshold_does_not_warn() {
    let cfg = RumiConfig { default_memory_limit_mb: 4096, egress_socket_gid: Some(1), capability_socket_gid: Some(1), ..RumiConfig::default() };
    let warnings = validate_config(&cfg).unwrap();
    assert!(!warnings.iter().any(|w| matches!(w, ConfigWarning::LargeMemoryLimit { .. })));
}

// ===========================================================================
// 5. Missing GID warnings
// ===========================================================================

#[test]
fn missing_egress_gid_warns() {
    let cfg = RumiConfig { capability_socket_gid: Some(1), ..RumiConfig::default() };
    let warnings = validate_config(&cfg).unwrap();
    assert!(warnings.iter().any(|w| matches!(
        w,
        ConfigWarning::MissingOptionalField { field, .. } if field == "egress_socket_gid"
    )));
}

// ===========================================================================
// 6. Multiple validation errors collected together
// ===========================================================================

#[test]
fn multiple_errors_collected() {
    let cfg = RumiConfig {
        user_data_root: String::new(),
        ecosystem_root: String::new(),
        egress_socket_mode: "nope".into(),
        default_memory_limit_mb: 0,
        ..RumiConfig::default()
    };
    let reasons = validation_reasons(validate_config(&cfg).unwrap_err());
    assert!(reasons.len() >= 4, "expected >= 4 errors, got {}: {reasons:?}", reasons.len());
}

// ===========================================================================
// 7. TOML parsing
// ===========================================================================

#[test]
fn parse_toml_empty_document_gives_defaults() {
    let cfg = parse_toml("").unwrap();
    assert_eq!(cfg, RumiConfig::default());
}

#[test]
fn parse_toml_overrides_security_mode() {
    let cfg = parse_toml("security_mode = \"permissive\"\n").unwrap();
    assert_eq!(cfg.security_mode, SecurityMode::Permissive);
}

#[test]
fn parse_toml_overrides_local_pack_mode() {
    let cfg = parse_toml("local_pack_mode = \"require_approval\"\n").unwrap();
    assert_eq!(cfg.local_pack_mode, LocalPackMode::RequireApproval);
}

#[test]
fn parse_toml_rejects_unknown_security_mode() {
    assert!(parse_toml("security_mode = \"yolo\"\n").is_err());
}

#[test]
fn parse_toml_malformed_syntax_is_parse_error() {
    let err = parse_toml("this is not = = toml").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

// ===========================================================================
// 8. Merge semantics
// ===========================================================================

#[test]
fn merge_overlay_string_field_wins_when_set() {
    let base = RumiConfig::default();
    let overlay = RumiConfig { user_data_root: "/custom/data".into(), ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.user_data_root, "/custom/data");
}

#[test]
fn merge_base_string_field_survives_default_overlay() {
    let base = RumiConfig { ecosystem_root: "/custom/eco".into(), ..RumiConfig::default() };
    let overlay = RumiConfig::default();
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.ecosystem_root, "/custom/eco");
}

#[test]
fn merge_overlay_gid_wins_over_base_gid() {
    let base = RumiConfig { egress_socket_gid: Some(100), ..RumiConfig::default() };
    let overlay = RumiConfig { egress_socket_gid: Some(200), ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.egress_socket_gid, Some(200));
}

#[test]
fn merge_base_gid_survives_unset_overlay_gid() {
    let base = RumiConfig { capability_socket_gid: Some(42), ..RumiConfig::default() };
    let overlay = RumiConfig { capability_socket_gid: None, ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.capability_socket_gid, Some(42));
}

#[test]
fn merge_overlay_security_mode_always_wins() {
    let base = RumiConfig { security_mode: SecurityMode::Permissive, ..RumiConfig::default() };
    let overlay = RumiConfig { security_mode: SecurityMode::Strict, ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.security_mode, SecurityMode::Strict);
}

#[test]
fn merge_overlay_memory_limit_wins_when_non_default() {
    let base = RumiConfig::default();
    let overlay = RumiConfig { default_memory_limit_mb: 512, ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.default_memory_limit_mb, 512);
}

#[test]
fn merge_produces_still_valid_config() {
    let base = RumiConfig { egress_socket_gid: Some(1), capability_socket_gid: Some(1), ..RumiConfig::default() };
    let overlay = RumiConfig { default_memory_limit_mb: 512, ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    assert!(validate_config(&merged).unwrap().is_empty());
}

#[test]
fn merge_can_introduce_a_validation_error() {
    let base = RumiConfig::default();
    let overlay = RumiConfig { egress_socket_mode: "nope".into(), ..RumiConfig::default() };
    let merged = merge_configs(base, overlay);
    let reasons = validation_reasons(validate_config(&merged).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("egress_socket_mode")));
}

// ===========================================================================
// 9. Schema / round-trip conformance
// ===========================================================================

#[test]
fn valid_config_roundtrips_via_json() {
    let cfg = RumiConfig { egress_socket_gid: Some(1), capability_socket_gid: Some(1), ..RumiConfig::default() };
    validate_config(&cfg).unwrap();
    let json = serde_json::to_string(&cfg).unwrap();
    let back: RumiConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(cfg, back);
}

#[test]
fn toml_roundtrip_preserves_validity() {
    let cfg = RumiConfig { egress_socket_gid: Some(1), capability_socket_gid: Some(1), ..RumiConfig::default() };
    validate_config(&cfg).unwrap();
    let toml_str = toml::to_string(&cfg).unwrap();
    let back = parse_toml(&toml_str).unwrap();
    let warnings = validate_config(&back).unwrap();
    assert!(warnings.is_empty());
}

#[test]
fn json_schema_can_be_generated() {
    let schema = schemars::schema_for!(RumiConfig);
    let json = serde_json::to_string_pretty(&schema).unwrap();
    assert!(json.contains("RumiConfig"));
}

// ===========================================================================
// 10. Validation idempotency
// ===========================================================================

#[test]
fn idempotent_default_config() {
    let cfg = RumiConfig::default();
    let w1 = validate_config(&cfg).unwrap();
    let w2 = validate_config(&cfg).unwrap();
    assert_eq!(w1, w2);
}

#[test]
fn idempotent_invalid_config() {
    let cfg = RumiConfig { user_data_root: String::new(), ..RumiConfig::default() };
    let r1 = validation_reasons(validate_config(&cfg).unwrap_err());
    let r2 = validation_reasons(validate_config(&cfg).unwrap_err());
    assert_eq!(r1, r2);
}

// ===========================================================================
// 11. Display impls
// ===========================================================================

#[test]
fn config_warning_display_for_missing_optional() {
    let w = ConfigWarning::MissingOptionalField {
        field: "egress_socket_gid".into(),
        hint: "containers will need the socket's default ownership to connect".into(),
    };
    let s = w.to_string();
    assert!(s.contains("egress_socket_gid"));
    assert!(s.contains("connect"));
}

#[test]
fn validation_error_display_contains_all_reasons() {
    let err = ConfigError::ValidationError { reasons: vec!["reason one".into(), "reason two".into()] };
    let s = err.to_string();
    assert!(s.contains("reason one"));
    assert!(s.contains("reason two"));
}
