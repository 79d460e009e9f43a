use crate::cli::errors::{CliError, CliResult};

/// Validates a similarity threshold
pub fn validate_threshold(threshold: f32) -> CliResult<()> {
    if !(-1.0..=1.0).contains(&threshold) {
        return Err(CliError::validation(
            "threshold",
            format!("must be between -1.0 and 1.0, got {threshold}"),
        ));
    }
    Ok(())
}

/// Validates product name length
pub fn validate_name(name: &str) -> CliResult<()> {
    if name.trim().is_empty() {
        return Err(CliError::validation("name", "Name cannot be empty"));
    }
    if name.len() > 500 {
        return Err(CliError::validation("name", "Name cannot exceed 500 characters"));
    }
    Ok(())
}

/// Validates category length
pub fn validate_category(category: &str) -> CliResult<()> {
    if category.trim().is_empty() {
        return Err(CliError::validation("category", "Category cannot be empty"));
    }
    if category.len() > 100 {
        return Err(CliError::validation(
            "category",
            "Category cannot exceed 100 characters",
        ));
    }
    Ok(())
}

/// Validates a catalog edit
pub fn validate_edit(name: &Option<String>, category: &Option<String>) -> CliResult<()> {
    if name.is_none() && category.is_none() {
        return Err(CliError::validation(
            "edit",
            "nothing to change, pass --name or --category",
        ));
    }

    if let Some(name) = name {
        validate_name(name)?;
    }

    if let Some(category) = category {
        validate_category(category)?;
    }

    Ok(())
}
