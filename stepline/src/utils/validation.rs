//! Name validation for pipelines and steps.

use crate::errors::ConfigError;
use regex::Regex;
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-/]*$").expect("name pattern is a valid regex")
    })
}

/// Validates that a pipeline or step name can be used as a key.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidName`] for empty names or names with
/// whitespace or other unsupported characters.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty or whitespace-only".to_string(),
        });
    }
    if !name_pattern().is_match(name) {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason: "name contains unsupported characters".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["build", "deploy-prod", "tests.unit", "group/task", "step_1"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "   ", "has space", "-leading", "semi;colon"] {
            assert!(validate_name(name).is_err(), "{name:?} should be invalid");
        }
    }
}
