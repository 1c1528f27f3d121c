//! Dependency detection, resolution and cycle checks.

use crate::error::{AssetError, Result};
use crate::files::FileCatalog;
use crate::store::AnalysisStore;
use crate::types::{Analysis, DependencyRef, RefType, ANALYSIS_SCHEMA};
use duckyard_sources::registry::Registry;
use std::collections::{BTreeSet, HashMap};

/// `analysis.<id>` references in `sql`, outside string literals, in order of
/// first appearance. Quoted forms (`"analysis"."id"`) are recognised too.
pub fn detect_analysis_refs(sql: &str) -> Vec<String> {
    let masked = mask_strings(sql);
    let lower = masked.to_ascii_lowercase();
    let mut found: Vec<String> = Vec::new();
    for prefix in [format!("{}.", ANALYSIS_SCHEMA), format!("\"{}\".", ANALYSIS_SCHEMA)] {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(&prefix) {
            let start = from + pos;
            from = start + prefix.len();
            let preceded_by_ident = masked[..start]
                .chars()
                .next_back()
                .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
            if preceded_by_ident {
                continue;
            }
            if let Some(id) = read_ident(&masked[from..]) {
                if !found.contains(&id) {
                    found.push(id);
                }
            }
        }
    }
    found
}

/// Declared dependencies plus detected analysis references, deduplicated.
pub fn effective_dependencies(analysis: &Analysis) -> Vec<DependencyRef> {
    let mut deps: Vec<DependencyRef> = Vec::new();
    let detected = detect_analysis_refs(&analysis.sql)
        .into_iter()
        .map(DependencyRef::analysis);
    for dep in analysis.depends_on.iter().cloned().chain(detected) {
        if dep.ref_type == RefType::Analysis && dep.name == analysis.id {
            continue;
        }
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    deps
}

/// Ids of the analyses `analysis` reads from.
pub fn upstream_analysis_ids(analysis: &Analysis) -> Vec<String> {
    effective_dependencies(analysis)
        .into_iter()
        .filter(|d| d.ref_type == RefType::Analysis)
        .map(|d| d.name)
        .collect()
}

/// Check that `dep` names something that exists.
pub fn resolve_dependency(store: &AnalysisStore<'_>, dep: &DependencyRef) -> Result<()> {
    let resolved = match dep.ref_type {
        RefType::Analysis => store.get(&dep.name)?.is_some(),
        RefType::Source => {
            let registry = Registry::open(store.conn())?;
            registry.get_source(&dep.name)?.is_some()
                || registry.get_cached_table(&dep.name)?.is_some()
        }
        RefType::File => FileCatalog::open(store.conn())?
            .find_by_table_or_id(&dep.name)?
            .is_some(),
    };
    if resolved {
        Ok(())
    } else {
        Err(AssetError::validation(format!(
            "Unresolved dependency {}",
            dep.full()
        )))
    }
}

/// Load `target` and every analysis it transitively reads, keyed by id.
///
/// Every dependency along the way must resolve and the analysis graph must
/// be acyclic.
pub fn load_closure(store: &AnalysisStore<'_>, target: &str) -> Result<HashMap<String, Analysis>> {
    let mut loaded: HashMap<String, Analysis> = HashMap::new();
    let mut pending = vec![target.to_string()];
    while let Some(id) = pending.pop() {
        if loaded.contains_key(&id) {
            continue;
        }
        let analysis = store.require(&id)?;
        for dep in effective_dependencies(&analysis) {
            resolve_dependency(store, &dep)?;
            if dep.ref_type == RefType::Analysis && !loaded.contains_key(&dep.name) {
                pending.push(dep.name);
            }
        }
        loaded.insert(id, analysis);
    }
    Ok(loaded)
}

/// Dependencies-first order of `target`'s closure, ending with `target`.
pub fn topological_order(closure: &HashMap<String, Analysis>, target: &str) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: &str,
        closure: &HashMap<String, Analysis>,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| p == id).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(id.to_string());
                return Err(AssetError::validation(format!(
                    "Dependency cycle: {}",
                    cycle.join(" -> ")
                )));
            }
            None => {}
        }
        let analysis = closure
            .get(id)
            .ok_or_else(|| AssetError::not_found(format!("analysis '{}'", id)))?;
        marks.insert(id.to_string(), Mark::Visiting);
        path.push(id.to_string());
        for upstream in upstream_analysis_ids(analysis) {
            visit(&upstream, closure, marks, path, order)?;
        }
        path.pop();
        marks.insert(id.to_string(), Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(closure.len());
    visit(target, closure, &mut marks, &mut Vec::new(), &mut order)?;
    Ok(order)
}

/// Source dependencies of `ids`, deduplicated and sorted.
pub fn source_names<'a>(
    closure: &'a HashMap<String, Analysis>,
    ids: impl IntoIterator<Item = &'a String>,
) -> BTreeSet<String> {
    ids.into_iter()
        .filter_map(|id| closure.get(id))
        .flat_map(|a| a.depends_on.iter())
        .filter(|d| d.ref_type == RefType::Source)
        .map(|d| d.name.clone())
        .collect()
}

fn read_ident(rest: &str) -> Option<String> {
    let quoted = rest.starts_with('"');
    let body = if quoted { &rest[1..] } else { rest };
    let end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(body.len());
    if end == 0 || (quoted && !body[end..].starts_with('"')) {
        return None;
    }
    let ident = &body[..end];
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(ident.to_string())
}

/// Replace the contents of single-quoted strings with spaces, keeping
/// byte offsets.
fn mask_strings(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    for ch in sql.chars() {
        if ch == '\'' {
            in_string = !in_string;
            out.push(ch);
        } else if in_string {
            out.extend(std::iter::repeat(' ').take(ch.len_utf8()));
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn analysis(id: &str, sql: &str, depends_on: Vec<DependencyRef>) -> Analysis {
        Analysis {
            id: id.to_string(),
            name: id.to_string(),
            sql: sql.to_string(),
            description: None,
            materialization: Default::default(),
            parameters: Vec::new(),
            tags: Vec::new(),
            depends_on,
            result_table: format!("analysis.{}", id),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn detects_refs_outside_strings() {
        let refs = detect_analysis_refs(
            "SELECT * FROM analysis.daily d JOIN \"analysis\".\"weekly\" w ON true \
             WHERE note = 'analysis.fake' AND x IN (SELECT y FROM ANALYSIS.daily) \
             AND z = my_analysis.col",
        );
        assert_eq!(refs, vec!["daily".to_string(), "weekly".to_string()]);
    }

    #[test]
    fn effective_dependencies_merge_and_skip_self() {
        let a = analysis(
            "b",
            "SELECT * FROM analysis.a UNION ALL SELECT * FROM analysis.b",
            vec![DependencyRef::analysis("a"), DependencyRef::source("shop")],
        );
        assert_eq!(
            effective_dependencies(&a),
            vec![DependencyRef::analysis("a"), DependencyRef::source("shop")]
        );
    }

    #[test]
    fn topological_order_and_cycles() {
        let mut closure = HashMap::new();
        closure.insert("a".to_string(), analysis("a", "SELECT 1", vec![]));
        closure.insert("b".to_string(), analysis("b", "SELECT * FROM analysis.a", vec![]));
        closure.insert(
            "c".to_string(),
            analysis("c", "SELECT * FROM analysis.b JOIN analysis.a USING (x)", vec![]),
        );
        assert_eq!(topological_order(&closure, "c").unwrap(), vec!["a", "b", "c"]);

        closure.insert("a".to_string(), analysis("a", "SELECT * FROM analysis.c", vec![]));
        let err = topological_order(&closure, "c").unwrap_err();
        assert!(matches!(err, AssetError::Validation(ref m) if m.contains("cycle")));
    }
}
