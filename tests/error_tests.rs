//! Tests for error types.
//!
//! Validates display formatting, conversions and the exit code mapping.

use std::path::PathBuf;

use udock::{
    EXIT_CONFIG_ERROR, EXIT_EXEC_FAILED, EXIT_INIT_FAILED, EXIT_INVALID_OPTIONS, EXIT_SPEC_FAILED,
    Error,
};

// =============================================================================
// Display Tests
// =============================================================================

#[test]
fn test_invalid_exec_mode_display() {
    let err = Error::InvalidExecMode("X9".to_string());
    let msg = err.to_string();

    assert!(msg.contains("X9"), "should include the tag");
    assert!(msg.contains("execution mode"));
}

#[test]
fn test_backend_not_found_display() {
    let err = Error::BackendNotFound {
        tool: "proot".to_string(),
        hint: "install proot or set use_proot_executable".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.starts_with("proot executable not found"));
    assert!(msg.contains("use_proot_executable"));
}

#[test]
fn test_container_not_found_display() {
    let err = Error::ContainerNotFound("mycontainer".to_string());
    assert!(err.to_string().contains("mycontainer"));
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_transition_failed_display() {
    let err = Error::TransitionFailed {
        action: "restore_ld".to_string(),
        reason: "no loader".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("restore_ld"), "should name the failing action");
    assert!(msg.contains("no loader"));
}

#[test]
fn test_privileged_port_display() {
    let err = Error::PrivilegedPort { port: 80 };
    assert!(err.to_string().contains("80"));
}

#[test]
fn test_spec_errors_display_path() {
    let err = Error::SpecSaveFailed {
        path: PathBuf::from("/c/config.json"),
        reason: "read-only".to_string(),
    };
    assert!(err.to_string().contains("/c/config.json"));
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: Error = io.into();

    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("gone"));
    assert_eq!(err.exit_code(), EXIT_INIT_FAILED);
}

#[test]
fn test_serde_error_conversion() {
    let serde_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: Error = serde_err.into();

    assert!(matches!(err, Error::Serialization(_)));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_exit_codes_configuration() {
    assert_eq!(Error::InvalidExecMode("Z1".into()).exit_code(), EXIT_CONFIG_ERROR);
    assert_eq!(
        Error::BackendNotFound {
            tool: "runc".into(),
            hint: String::new()
        }
        .exit_code(),
        EXIT_CONFIG_ERROR
    );
    assert_eq!(Error::FakechrootNotFound(vec![]).exit_code(), EXIT_CONFIG_ERROR);
}

#[test]
fn test_exit_codes_init() {
    assert_eq!(Error::ContainerNotFound("c".into()).exit_code(), EXIT_INIT_FAILED);
    assert_eq!(Error::InvalidUser("a:b:c".into()).exit_code(), EXIT_INIT_FAILED);
    assert_eq!(Error::CommandNotFound("/bin/nope".into()).exit_code(), EXIT_INIT_FAILED);
    assert_eq!(
        Error::VolumeRejected {
            path: "/usr".into(),
            reason: "protected".into()
        }
        .exit_code(),
        EXIT_INIT_FAILED
    );
}

#[test]
fn test_exit_codes_options_spec_exec() {
    assert_eq!(Error::InvalidOption("--location".into()).exit_code(), EXIT_INVALID_OPTIONS);
    assert_eq!(
        Error::SpecLoadFailed {
            path: PathBuf::from("/x"),
            reason: String::new()
        }
        .exit_code(),
        EXIT_SPEC_FAILED
    );
    assert_eq!(
        Error::ExecFailed {
            container: "c".into(),
            reason: "spawn".into()
        }
        .exit_code(),
        EXIT_EXEC_FAILED
    );
}

#[test]
fn test_exit_codes_are_reserved_range() {
    let codes = [
        EXIT_CONFIG_ERROR,
        EXIT_INIT_FAILED,
        EXIT_INVALID_OPTIONS,
        EXIT_SPEC_FAILED,
        EXIT_EXEC_FAILED,
    ];
    for code in codes {
        assert!((1..=5).contains(&code));
    }
}
