//! File-name glob matching for folder sources.

use crate::error::{Result, SourceError};
use globset::{GlobBuilder, GlobMatcher};

/// Build a case-insensitive matcher for a folder pattern.
///
/// Folder listings are non-recursive, so patterns match the bare file name.
/// An empty pattern or `*` means "no filter" and yields `None`.
pub fn build_name_matcher(raw: Option<&str>) -> Result<Option<GlobMatcher>> {
    let pattern = match raw.map(str::trim) {
        None | Some("") | Some("*") => return Ok(None),
        Some(p) => p,
    };
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map(|g| Some(g.compile_matcher()))
        .map_err(|e| SourceError::validation(format!("Invalid pattern '{}': {}", pattern, e)))
}

/// Match a file name against an optional matcher.
pub fn name_matches(matcher: Option<&GlobMatcher>, file_name: &str) -> bool {
    matcher.map_or(true, |m| m.is_match(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_star_match_everything() {
        assert!(build_name_matcher(None).unwrap().is_none());
        assert!(build_name_matcher(Some("  ")).unwrap().is_none());
        assert!(build_name_matcher(Some("*")).unwrap().is_none());
        assert!(name_matches(None, "anything.csv"));
    }

    #[test]
    fn matches_file_names_case_insensitively() {
        let matcher = build_name_matcher(Some("sales_*.csv")).unwrap();
        assert!(name_matches(matcher.as_ref(), "sales_2024.csv"));
        assert!(name_matches(matcher.as_ref(), "SALES_2024.CSV"));
        assert!(!name_matches(matcher.as_ref(), "orders_2024.csv"));
        assert!(!name_matches(matcher.as_ref(), "sales_2024.parquet"));
    }

    #[test]
    fn invalid_pattern_is_validation_error() {
        let err = build_name_matcher(Some("data[")).unwrap_err();
        assert!(matches!(err, SourceError::Validation(_)));
    }
}
