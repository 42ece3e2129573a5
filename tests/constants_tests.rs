//! Tests for constants module.
//!
//! Validates the mode tag table, the container layout names and the
//! container id validation used before ids become path components.

use udock::*;

// =============================================================================
// Execution Mode Tests
// =============================================================================

#[test]
fn test_valid_exec_modes_match_mode_tags() {
    assert_eq!(VALID_EXEC_MODES.len(), ModeTag::ALL.len());
    for (name, tag) in VALID_EXEC_MODES.iter().zip(ModeTag::ALL) {
        assert_eq!(*name, tag.as_str());
    }
}

#[test]
fn test_default_exec_mode_is_valid() {
    assert!(VALID_EXEC_MODES.contains(&DEFAULT_EXEC_MODE));
    assert_eq!(DEFAULT_EXEC_MODE.parse::<ModeTag>().unwrap(), ModeTag::P1);
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_bind_dirs_are_hidden_absolute_paths() {
    for dir in [BIND_HOST_DIR, BIND_ORIG_DIR, PROOT_OVERLAY_PATH] {
        assert!(dir.starts_with("/."), "{} should be a hidden top level entry", dir);
        assert_eq!(dir.matches('/').count(), 1);
    }
}

#[test]
fn test_protected_dirs_include_root_and_usr() {
    assert!(PROTECTED_CONTAINER_DIRS.contains(&"/"));
    assert!(PROTECTED_CONTAINER_DIRS.contains(&"/usr"));
    assert!(!PROTECTED_CONTAINER_DIRS.contains(&"/tmp"));
    for dir in DEFAULT_SYSDIRS {
        assert!(
            !PROTECTED_CONTAINER_DIRS.contains(dir),
            "default sysdir {} would always be rejected",
            dir
        );
    }
}

#[test]
fn test_default_host_env_lists_disjoint() {
    for name in DEFAULT_VALID_HOST_ENV {
        assert!(!DEFAULT_INVALID_HOST_ENV.contains(name));
    }
}

#[test]
fn test_first_unprivileged_port() {
    assert_eq!(FIRST_UNPRIVILEGED_PORT, 1024);
}

// =============================================================================
// Container ID Validation Tests
// =============================================================================

#[test]
fn test_validate_container_id_accepts_uuid_and_names() {
    assert!(validate_container_id("3f2c1a9e-77b4-3a1c-9d1e-0c3b2a1f4e5d").is_ok());
    assert!(validate_container_id("my_container.v2").is_ok());
}

#[test]
fn test_validate_container_id_rejects_traversal() {
    assert!(validate_container_id("").is_err());
    assert!(validate_container_id(".").is_err());
    assert!(validate_container_id("..").is_err());
    assert!(validate_container_id("../etc").is_err());
    assert!(validate_container_id("a/b").is_err());
    assert!(validate_container_id("white space").is_err());
}

#[test]
fn test_validate_container_id_length() {
    let max = "a".repeat(MAX_CONTAINER_ID_LEN);
    assert!(validate_container_id(&max).is_ok());
    let over = "a".repeat(MAX_CONTAINER_ID_LEN + 1);
    assert!(validate_container_id(&over).is_err());
}
