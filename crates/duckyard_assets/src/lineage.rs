//! Static lineage: who reads what, without executing anything.

use crate::deps::effective_dependencies;
use crate::error::Result;
use crate::planner::Planner;
use crate::types::{
    DependencyRef, Lineage, LineageGraph, LineageGraphEdge, LineageGraphNode, LineageNode, RefType,
};
use std::collections::{BTreeMap, HashMap};

impl<'a> Planner<'a> {
    /// Direct upstream and downstream neighbours of `id`.
    pub fn get_lineage(&self, id: &str) -> Result<Lineage> {
        let analysis = self.store().require(id)?;
        let all = self.store().list(None)?;
        let names: HashMap<&str, &str> = all
            .iter()
            .map(|a| (a.id.as_str(), a.name.as_str()))
            .collect();

        let upstream = effective_dependencies(&analysis)
            .into_iter()
            .map(|dep| lineage_node(&dep, &names))
            .collect();
        let me = DependencyRef::analysis(id);
        let downstream = all
            .iter()
            .filter(|other| other.id != id && effective_dependencies(other).contains(&me))
            .map(|other| lineage_node(&DependencyRef::analysis(other.id.clone()), &names))
            .collect();

        Ok(Lineage {
            analysis_id: id.to_string(),
            upstream,
            downstream,
        })
    }

    /// Every analysis with its freshness, every source and file they
    /// read, and one edge per dependency.
    pub fn get_lineage_graph(&self) -> Result<LineageGraph> {
        let analyses = self.store().list(None)?;
        let mut nodes: BTreeMap<String, LineageGraphNode> = BTreeMap::new();
        let mut edges = Vec::new();

        for analysis in &analyses {
            let freshness = self.freshness_of(analysis)?;
            let key = DependencyRef::analysis(analysis.id.clone()).full();
            nodes.insert(
                key.clone(),
                LineageGraphNode {
                    id: key.clone(),
                    node_type: RefType::Analysis,
                    name: analysis.name.clone(),
                    materialization: Some(analysis.materialization),
                    is_stale: Some(freshness.is_stale),
                    last_run_at: freshness.last_run_at,
                },
            );
            for dep in effective_dependencies(analysis) {
                let source = dep.full();
                edges.push(LineageGraphEdge {
                    source: source.clone(),
                    target: key.clone(),
                });
                if dep.ref_type != RefType::Analysis {
                    nodes.entry(source.clone()).or_insert_with(|| LineageGraphNode {
                        id: source,
                        node_type: dep.ref_type,
                        name: dep.name.clone(),
                        materialization: None,
                        is_stale: None,
                        last_run_at: None,
                    });
                }
            }
        }

        Ok(LineageGraph {
            nodes: nodes.into_values().collect(),
            edges,
        })
    }
}

fn lineage_node(dep: &DependencyRef, analysis_names: &HashMap<&str, &str>) -> LineageNode {
    let name = match dep.ref_type {
        RefType::Analysis => analysis_names.get(dep.name.as_str()).map(|n| n.to_string()),
        _ => None,
    };
    LineageNode {
        node_type: dep.ref_type,
        id: dep.name.clone(),
        name,
        full: dep.full(),
    }
}
