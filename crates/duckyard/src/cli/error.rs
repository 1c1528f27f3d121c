//! Helpful error types for CLI commands
//!
//! Every error includes:
//! - What went wrong
//! - Context about the situation
//! - Suggestions for how to fix it

use duckyard_assets::AssetError;
use duckyard_sources::SourceError;
use std::fmt;

/// An error with helpful context and suggestions
#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(
        mut self,
        suggestions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.suggestions.extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    // === Common error constructors ===

    pub fn source_not_found(name: &str) -> Self {
        Self::new(format!("Source not found: {}", name))
            .with_context("No attached source with this name exists in the project")
            .with_suggestions([
                "TRY: List attached sources: duckyard source list".to_string(),
                format!("TRY: Attach it: duckyard source attach {} --type <type> ...", name),
            ])
    }

    pub fn cache_not_found(local_table: &str) -> Self {
        Self::new(format!("Cached table not found: {}", local_table))
            .with_suggestion("TRY: List cached tables: duckyard cache list")
    }

    pub fn folder_not_found(folder_id: &str) -> Self {
        Self::new(format!("Folder source not found: {}", folder_id))
            .with_suggestion("TRY: List folder sources and their ids: duckyard folder list")
    }

    pub fn analysis_not_found(id: &str) -> Self {
        Self::new(format!("Analysis not found: {}", id))
            .with_suggestions([
                "TRY: List analyses: duckyard analysis list".to_string(),
                format!("TRY: Create it: duckyard analysis create {} --sql '...'", id),
            ])
    }

    pub fn query_not_found(job_id: &str) -> Self {
        Self::new(format!("Query not found: {}", job_id))
            .with_suggestion("TRY: List recent queries: duckyard query list")
    }

    pub fn file_not_found(id: &str) -> Self {
        Self::new(format!("File asset not found: {}", id))
            .with_suggestion("TRY: List imported files and their ids: duckyard file list")
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

/// Suggestions derived from library errors anywhere in the chain.
fn suggestions_for(err: &anyhow::Error) -> Vec<String> {
    for cause in err.chain() {
        if let Some(source_err) = cause.downcast_ref::<SourceError>() {
            return source_suggestions(source_err);
        }
        if let Some(asset_err) = cause.downcast_ref::<AssetError>() {
            return match asset_err {
                AssetError::Source(source_err) => source_suggestions(source_err),
                AssetError::NotFound(_) => {
                    vec!["TRY: List analyses: duckyard analysis list".to_string()]
                }
                AssetError::Execution(_) => vec![
                    "TRY: Inspect the plan: duckyard analysis compile <id>".to_string(),
                    "TRY: Check recent runs: duckyard analysis history <id>".to_string(),
                ],
                _ => Vec::new(),
            };
        }
    }
    Vec::new()
}

fn source_suggestions(err: &SourceError) -> Vec<String> {
    match err {
        SourceError::SourceNotFound(_) => {
            vec!["TRY: List attached sources: duckyard source list".to_string()]
        }
        SourceError::Attach { .. } => vec![
            "TRY: Check the path or connection settings of the source".to_string(),
            "TRY: Run with -v to see the attach attempt in the log".to_string(),
        ],
        _ => Vec::new(),
    }
}

/// Print an error for humans on stderr.
pub fn print_error(err: &anyhow::Error) {
    if let Some(helpful) = err.downcast_ref::<HelpfulError>() {
        eprint!("{}", helpful);
        return;
    }
    let helpful = HelpfulError::new(format!("{:#}", err)).with_suggestions(suggestions_for(err));
    eprint!("{}", helpful);
}

/// Print an error as a JSON object on stdout.
pub fn print_json_error(err: &anyhow::Error) {
    let value = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => serde_json::json!({
            "error": helpful.message,
            "context": helpful.context,
            "suggestions": helpful.suggestions,
        }),
        None => serde_json::json!({
            "error": format!("{:#}", err),
            "context": null,
            "suggestions": suggestions_for(err),
        }),
    };
    println!("{}", value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_helpful_error_display() {
        let err = HelpfulError::new("Something went wrong")
            .with_context("While processing data")
            .with_suggestion("TRY: Again");

        let display = format!("{}", err);
        assert!(display.contains("ERROR: Something went wrong"));
        assert!(display.contains("CONTEXT: While processing data"));
        assert!(display.contains("  TRY: Again"));
    }

    #[test]
    fn test_not_found_constructors() {
        let err = HelpfulError::source_not_found("shop");
        assert!(err.message.contains("shop"));
        assert!(err.suggestions.iter().any(|s| s.contains("source list")));
        assert!(HelpfulError::analysis_not_found("daily")
            .suggestions
            .iter()
            .any(|s| s.contains("analysis create daily")));
    }

    #[test]
    fn test_suggestions_follow_the_error_chain() {
        let err = anyhow::Error::new(AssetError::Source(SourceError::SourceNotFound(
            "shop".to_string(),
        )))
        .context("Failed to run analysis");
        let suggestions = suggestions_for(&err);
        assert_eq!(suggestions.len(), 1);
        assert!(suggestions[0].contains("source list"));

        let plain: anyhow::Result<()> = Err(std::io::Error::other("disk")).context("writing");
        assert!(suggestions_for(&plain.unwrap_err()).is_empty());
    }
}
