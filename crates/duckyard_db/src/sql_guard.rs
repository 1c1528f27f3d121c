//! Read-only SQL checks for user-supplied queries and filter fragments.

use thiserror::Error;

const ALLOWED_PREFIXES: &[&str] = &["SELECT", "WITH", "FROM", "VALUES"];
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "COPY", "ATTACH",
    "DETACH", "INSTALL", "LOAD", "PRAGMA", "EXPORT", "IMPORT", "CHECKPOINT",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SqlGuardError {
    message: String,
}

impl SqlGuardError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Validate that `sql` is a single read-only query.
pub fn validate_read_only(sql: &str) -> Result<(), SqlGuardError> {
    let sanitized = sanitize_sql(sql);
    if sanitized.trim().is_empty() {
        return Err(SqlGuardError::new("Query is empty"));
    }

    validate_single_statement(&sanitized)?;

    let first = first_keyword(&sanitized)
        .ok_or_else(|| SqlGuardError::new("Query must start with SELECT, WITH, FROM or VALUES"))?;
    if !ALLOWED_PREFIXES.contains(&first.as_str()) {
        return Err(SqlGuardError::new(
            "Query must start with SELECT, WITH, FROM or VALUES",
        ));
    }

    reject_forbidden(&sanitized)
}

/// Validate a WHERE-clause fragment such as `region = 'EU' AND amount > 10`.
pub fn validate_filter(fragment: &str) -> Result<(), SqlGuardError> {
    let sanitized = sanitize_sql(fragment);
    if sanitized.trim().is_empty() {
        return Err(SqlGuardError::new("Filter is empty"));
    }
    if sanitized.contains(';') {
        return Err(SqlGuardError::new("Filter must not contain ';'"));
    }
    reject_forbidden(&sanitized)
}

/// Trim whitespace and one trailing semicolon so the query can be nested.
pub fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.strip_suffix(';') {
        Some(stripped) => stripped.trim_end(),
        None => trimmed,
    }
}

fn reject_forbidden(sanitized: &str) -> Result<(), SqlGuardError> {
    for token in tokens_upper(sanitized) {
        if FORBIDDEN_KEYWORDS.contains(&token.as_str()) {
            return Err(SqlGuardError::new(format!(
                "Query contains forbidden keyword: {}",
                token
            )));
        }
    }
    Ok(())
}

fn validate_single_statement(sql: &str) -> Result<(), SqlGuardError> {
    let mut semicolons = sql.match_indices(';').map(|(idx, _)| idx);
    let first = semicolons.next();
    if semicolons.next().is_some() {
        return Err(SqlGuardError::new("Multiple statements are not allowed"));
    }
    if let Some(idx) = first {
        if sql[idx + 1..].chars().any(|c| !c.is_whitespace()) {
            return Err(SqlGuardError::new("Multiple statements are not allowed"));
        }
    }
    Ok(())
}

fn first_keyword(sql: &str) -> Option<String> {
    let mut current = String::new();
    for ch in sql.chars() {
        if ch.is_ascii_alphabetic() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    if current.is_empty() {
        None
    } else {
        Some(current.to_ascii_uppercase())
    }
}

fn tokens_upper(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in sql.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(current.to_ascii_uppercase());
            current.clear();
        }
    }
    if !current.is_empty() {
        tokens.push(current.to_ascii_uppercase());
    }
    tokens
}

/// Blank out comments, string literals and quoted identifiers, keeping offsets.
fn sanitize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while let Some(ch) = chars.next() {
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
            }
            out.push(' ');
            continue;
        }
        if in_block_comment {
            if ch == '*' && matches!(chars.peek(), Some('/')) {
                chars.next();
                in_block_comment = false;
                out.push_str("  ");
                continue;
            }
            out.push(' ');
            continue;
        }
        if in_single {
            if ch == '\'' {
                if matches!(chars.peek(), Some('\'')) {
                    chars.next();
                    out.push_str("  ");
                    continue;
                }
                in_single = false;
            }
            out.push(' ');
            continue;
        }
        if in_double {
            if ch == '"' {
                in_double = false;
            }
            out.push(' ');
            continue;
        }

        match ch {
            '-' if matches!(chars.peek(), Some('-')) => {
                chars.next();
                in_line_comment = true;
                out.push_str("  ");
            }
            '/' if matches!(chars.peek(), Some('*')) => {
                chars.next();
                in_block_comment = true;
                out.push_str("  ");
            }
            '\'' => {
                in_single = true;
                out.push(' ');
            }
            '"' => {
                in_double = true;
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }

    out
}
