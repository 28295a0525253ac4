use cextbridge::BridgeConfig;

#[test]
fn environment_overrides_defaults() {
    // SAFETY: no other test in this binary reads these variables concurrently.
    unsafe {
        std::env::set_var("CEXT_HANDLE_CAPACITY", "64");
        std::env::set_var("CEXT_ABORT_ON_FATAL", "not-a-bool");
    }
    let config = BridgeConfig::from_env();
    unsafe {
        std::env::remove_var("CEXT_HANDLE_CAPACITY");
        std::env::remove_var("CEXT_ABORT_ON_FATAL");
    }

    assert_eq!(config.handle_capacity, 64);
    assert!(config.abort_on_fatal, "unparseable values are ignored");
}

#[cfg(feature = "toml-config")]
#[test]
fn loads_from_toml_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "gc_stress = true").unwrap();
    writeln!(file, "log_filter = \"cextbridge=debug\"").unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert!(config.gc_stress);
    assert_eq!(config.log_filter, "cextbridge=debug");
}

#[cfg(feature = "toml-config")]
#[test]
fn rejects_malformed_toml() {
    let err = BridgeConfig::from_toml_str("gc_stress = \"sometimes\"").unwrap_err();
    assert!(matches!(err, cextbridge::BridgeError::Config(_)));
}
