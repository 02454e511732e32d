//! Rule name and script validation
use crate::RegistryError;
use lazy_static::lazy_static;
use regex::Regex;

pub const MAX_NAME_LEN: usize = 255;

lazy_static! {
    // Alphanumerics, spaces and hyphens; first and last character alphanumeric.
    static ref RULE_NAME: Regex =
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9 \-]*[A-Za-z0-9])?$").unwrap();
}

pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::Validation("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RegistryError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if !RULE_NAME.is_match(name) {
        return Err(RegistryError::Validation(format!(
            "name '{}' may only contain alphanumerics, spaces and '-', \
             and cannot start or end with '-' or a space",
            name
        )));
    }
    Ok(())
}

pub fn validate_script(script: &str) -> Result<(), RegistryError> {
    if script.trim().is_empty() {
        return Err(RegistryError::Validation("script must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_names() {
        for name in ["a", "add-roles", "Add roles 2", "x1-y2 z3", "7"] {
            assert!(validate_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_rejects_invalid_names() {
        for name in ["", "-lead", "trail-", " lead", "trail ", "under_score", "dots.no", "ção"] {
            assert!(validate_name(name).is_err(), "{:?} should be invalid", name);
        }
    }

    #[test]
    fn test_rejects_overlong_name() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(validate_name(&name).is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_rejects_blank_script() {
        assert!(validate_script("  \n").is_err());
        assert!(validate_script("function(u, c, cb) cb(nil, u, c) end").is_ok());
    }
}
