use admix_core::errors::{AdmixError, ErrorInfo};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("id", "n4")
        .with_context("reason", "example")
}

#[test]
fn graph_error_surface() {
    let err = AdmixError::Graph(sample_info("G001", "unknown variable"));
    assert_eq!(err.info().code, "G001");
    assert!(err.info().context.contains_key("id"));
}

#[test]
fn tree_error_surface() {
    let err = AdmixError::Tree(sample_info("T001", "age ordering violated"));
    assert_eq!(err.info().code, "T001");
    assert!(err.info().context.contains_key("reason"));
}

#[test]
fn move_error_surface() {
    let err = AdmixError::Move(sample_info("M001", "move executed twice"));
    assert_eq!(err.info().code, "M001");
}

#[test]
fn chain_and_config_error_surface() {
    let chain = AdmixError::Chain(sample_info("C001", "drift"));
    let config = AdmixError::Config(sample_info("K001", "bad yaml"));
    assert_eq!(chain.info().code, "C001");
    assert_eq!(config.info().code, "K001");
}

#[test]
fn display_includes_context_and_hint() {
    let err = AdmixError::Serde(
        ErrorInfo::new("checkpoint-read", "missing file")
            .with_context("path", "/tmp/x.json")
            .with_hint("check the run directory"),
    );
    let rendered = err.to_string();
    assert!(rendered.starts_with("serde error: missing file (code: checkpoint-read)"));
    assert!(rendered.contains("path=/tmp/x.json"));
    assert!(rendered.ends_with("hint: check the run directory"));
}

#[test]
fn errors_round_trip_through_json() {
    let err = AdmixError::Move(sample_info("M002", "no candidate"));
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains("\"family\":\"Move\""));
    let back: AdmixError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, err);
}
