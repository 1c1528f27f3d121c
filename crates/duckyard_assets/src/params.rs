//! `$name` placeholder binding.
//!
//! Values are rendered as SQL literals and spliced into the text, since
//! placeholders may appear inside DDL wrappers (views, COPY) where prepared
//! parameters are not accepted.

use crate::error::{AssetError, Result};
use crate::types::{ParamValues, ParameterDef};
use duckyard_db::quote_literal;
use serde_json::Value;

/// Substitute every declared `$name` in `sql` with the literal for its value.
///
/// A provided value wins over the declared default. A required parameter
/// with neither is a validation error; an optional one binds to `NULL`.
/// Placeholders that are not declared, and anything inside single-quoted
/// strings, are left untouched.
pub fn bind_parameters(sql: &str, defs: &[ParameterDef], values: &ParamValues) -> Result<String> {
    let mut literals = Vec::with_capacity(defs.len());
    for def in defs {
        let value = values.get(&def.name).or(def.default.as_ref());
        let literal = match value {
            Some(v) => render_literal(def, v)?,
            None if def.required => {
                return Err(AssetError::validation(format!(
                    "Missing required parameter '{}'",
                    def.name
                )))
            }
            None => "NULL".to_string(),
        };
        literals.push((def.name.as_str(), literal));
    }
    if literals.is_empty() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_string = false;
    while let Some((idx, ch)) = chars.next() {
        if ch == '\'' {
            in_string = !in_string;
            out.push(ch);
            continue;
        }
        if ch != '$' || in_string {
            out.push(ch);
            continue;
        }
        let start = idx + 1;
        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let name = &sql[start..end];
        match literals.iter().find(|(n, _)| *n == name) {
            Some((_, literal)) => out.push_str(literal),
            None => {
                out.push('$');
                out.push_str(name);
            }
        }
    }
    Ok(out)
}

fn render_literal(def: &ParameterDef, value: &Value) -> Result<String> {
    if value.is_null() {
        return Ok("NULL".to_string());
    }
    let invalid = |expected: &str| {
        AssetError::validation(format!(
            "Parameter '{}' expects {}, got {}",
            def.name, expected, value
        ))
    };
    match def.param_type.to_lowercase().as_str() {
        "int" | "integer" => match value {
            Value::Number(n) if n.is_i64() => Ok(n.to_string()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|v| v.to_string())
                .map_err(|_| invalid("an integer")),
            _ => Err(invalid("an integer")),
        },
        "float" | "number" | "double" => match value {
            Value::Number(n) => n
                .as_f64()
                .map(|v| v.to_string())
                .ok_or_else(|| invalid("a number")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| v.to_string())
                .ok_or_else(|| invalid("a number")),
            _ => Err(invalid("a number")),
        },
        "bool" | "boolean" => match value {
            Value::Bool(b) => Ok(b.to_string()),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok("true".to_string()),
                "false" | "0" | "no" => Ok("false".to_string()),
                _ => Err(invalid("a boolean")),
            },
            _ => Err(invalid("a boolean")),
        },
        _ => match value {
            Value::String(s) => Ok(quote_literal(s)),
            other => Ok(quote_literal(&other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str, ty: &str) -> ParameterDef {
        ParameterDef {
            param_type: ty.to_string(),
            ..ParameterDef::new(name)
        }
    }

    fn values(v: serde_json::Value) -> ParamValues {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn binds_typed_literals() {
        let defs = vec![def("region", "string"), def("min", "int"), def("active", "bool")];
        let sql = bind_parameters(
            "SELECT * FROM t WHERE region = $region AND amount > $min AND active = $active",
            &defs,
            &values(json!({"region": "O'Hare", "min": 10, "active": "yes"})),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE region = 'O''Hare' AND amount > 10 AND active = true"
        );
    }

    #[test]
    fn defaults_required_and_unknown_placeholders() {
        let mut limit = def("limit", "integer");
        limit.default = Some(json!(5));
        let mut region = def("region", "string");
        region.required = true;
        let note = def("note", "string");
        let defs = vec![limit, region, note];

        let sql = bind_parameters(
            "SELECT '$region', $region, $note, $other LIMIT $limit",
            &defs,
            &values(json!({"region": "EU"})),
        )
        .unwrap();
        assert_eq!(sql, "SELECT '$region', 'EU', NULL, $other LIMIT 5");

        let err = bind_parameters("SELECT $region", &defs, &ParamValues::new()).unwrap_err();
        assert!(matches!(err, AssetError::Validation(_)));
    }

    #[test]
    fn rejects_values_of_the_wrong_type() {
        let defs = vec![def("n", "int")];
        let err = bind_parameters("SELECT $n", &defs, &values(json!({"n": "1; DROP TABLE x"})))
            .unwrap_err();
        assert!(matches!(err, AssetError::Validation(_)));

        let defs = vec![def("f", "float")];
        let sql = bind_parameters("SELECT $f", &defs, &values(json!({"f": "2.5"}))).unwrap();
        assert_eq!(sql, "SELECT 2.5");
    }
}
