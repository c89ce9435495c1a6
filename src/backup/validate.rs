//! Validation functions for job configuration values.

use std::collections::BTreeMap;
use std::path::PathBuf;
use validator::ValidationError;

pub fn validate_not_blank<S: AsRef<str>>(value: S) -> Result<(), ValidationError> {
    if value.as_ref().trim().is_empty() {
        return Err(ValidationError::new("Blank").with_message("must not be blank".into()));
    }

    Ok(())
}

pub fn validate_paths(paths: &Vec<PathBuf>) -> Result<(), ValidationError> {
    if paths.is_empty() {
        return Err(ValidationError::new("NoPaths")
            .with_message("at least one path is required".into()));
    }
    if let Some(blank) = paths.iter().find(|p| p.as_os_str().is_empty()) {
        return Err(ValidationError::new("InvalidPath")
            .with_message(format!("path {:?} is empty", blank).into()));
    }

    Ok(())
}

/// Every list in the map must hold non-blank entries.
pub fn validate_entries_not_blank<K: std::fmt::Debug, V: AsRef<str>>(
    map: &BTreeMap<K, Vec<V>>,
) -> Result<(), ValidationError> {
    for (key, values) in map {
        if values.iter().any(|v| v.as_ref().trim().is_empty()) {
            return Err(ValidationError::new("BlankEntry")
                .with_message(format!("{:?} contains a blank entry", key).into()));
        }
    }

    Ok(())
}
