//! Integrity checks: source checksums and registry key validation.

use forge_runtime::loader::sha256_hex;
use forge_types::capability::MAX_NAME_LEN;

/// Whether `data` hashes to `expected_sha256` (hex, any case).
pub fn verify_checksum(data: &[u8], expected_sha256: &str) -> bool {
    sha256_hex(data) == expected_sha256.to_lowercase()
}

/// Names must match `[a-z0-9][a-z0-9_-]{0,63}`. They become file names,
/// so anything that could escape the capabilities directory is refused.
pub fn validate_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("name is empty".to_string());
    };
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name longer than {MAX_NAME_LEN} characters"));
    }
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err("name must start with a lower-case letter or digit".to_string());
    }
    let allowed = |c: &char| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-';
    if let Some(bad) = chars.find(|c| !allowed(c)) {
        return Err(format!("invalid character '{bad}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        let hash = sha256_hex(b"(module)");
        assert!(verify_checksum(b"(module)", &hash));
        assert!(verify_checksum(b"(module)", &hash.to_uppercase()));
        assert!(!verify_checksum(b"(module )", &hash));
    }

    #[test]
    fn test_valid_names() {
        for name in ["tool_1a2b3c4d", "learned_send_email", "a", "0-x"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "_x", "-x", "Tool", "../etc", "a/b", "a.wat", "with space"] {
            assert!(validate_name(name).is_err(), "{name}");
        }
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
