//! Dependency graph between modules, derived from provided/consumed capabilities.
//!
//! A consumer depends on every other module providing one of its consumed
//! capabilities. Capabilities under an allowlisted prefix need no provider.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::{PipelineInput, StageContext, StepId, ValidationStage};
use crate::config::CapabilityAllowlist;
use crate::error::Result;
use crate::manifest::{CapabilityKind, ModuleManifest};
use crate::workspace::DEPENDENCY_GRAPH_REPORT;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct MissingCapability {
    pub kind: CapabilityKind,
    pub name: String,
    pub consumer: String,
}

impl MissingCapability {
    pub fn message(&self) -> String {
        format!(
            "{} consumed without provider: {} (required by {})",
            self.kind, self.name, self.consumer
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub capability: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyReport {
    pub ok: bool,
    pub missing: Vec<MissingCapability>,
    pub cycles: Vec<Vec<String>>,
    pub edges: Vec<DependencyEdge>,
}

impl DependencyReport {
    pub fn errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self.missing.iter().map(MissingCapability::message).collect();
        errors.extend(self.cycles.iter().map(|cycle| {
            let mut path = cycle.clone();
            path.extend(cycle.first().cloned());
            format!("dependency cycle: {}", path.join(" -> "))
        }));
        errors
    }
}

/// Module dependency graph. Node `i` is `manifests[i]`.
pub struct DependencyGraph<'a> {
    manifests: &'a [ModuleManifest],
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
    edges: BTreeSet<DependencyEdge>,
    missing: BTreeSet<MissingCapability>,
}

impl<'a> DependencyGraph<'a> {
    pub fn build(manifests: &'a [ModuleManifest], allowlist: &CapabilityAllowlist) -> Self {
        let mut providers: HashMap<(CapabilityKind, &str), Vec<usize>> = HashMap::new();
        for (i, manifest) in manifests.iter().enumerate() {
            for (kind, name) in manifest.provides.iter() {
                providers.entry((kind, name)).or_default().push(i);
            }
        }

        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..manifests.len()).map(|i| graph.add_node(i)).collect();
        let mut edges = BTreeSet::new();
        let mut missing = BTreeSet::new();
        let mut linked = BTreeSet::new();

        for (consumer, manifest) in manifests.iter().enumerate() {
            for (kind, name) in manifest.consumes.iter() {
                match providers.get(&(kind, name)) {
                    Some(found) => {
                        for &provider in found.iter().filter(|&&p| p != consumer) {
                            edges.insert(DependencyEdge {
                                from: manifest.id.clone(),
                                to: manifests[provider].id.clone(),
                                capability: format!("{}:{}", kind, name),
                            });
                            if linked.insert((consumer, provider)) {
                                graph.add_edge(nodes[consumer], nodes[provider], ());
                            }
                        }
                    }
                    None if allowlist.allows(name) => {}
                    None => {
                        missing.insert(MissingCapability {
                            kind,
                            name: name.to_string(),
                            consumer: manifest.id.clone(),
                        });
                    }
                }
            }
        }

        Self {
            manifests,
            graph,
            nodes,
            edges,
            missing,
        }
    }

    /// Strongly connected groups of more than one module, ids sorted.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| {
                let mut ids: Vec<String> = scc
                    .into_iter()
                    .map(|n| self.manifests[self.graph[n]].id.clone())
                    .collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    pub fn report(&self) -> DependencyReport {
        let cycles = self.cycles();
        DependencyReport {
            ok: self.missing.is_empty() && cycles.is_empty(),
            missing: self.missing.iter().cloned().collect(),
            cycles,
            edges: self.edges.iter().cloned().collect(),
        }
    }

    /// Providers before consumers. Ties, and modules caught in a cycle, keep
    /// their input order.
    pub fn integration_order(&self) -> Vec<String> {
        let count = self.manifests.len();
        let mut placed = vec![false; count];
        let mut order = Vec::with_capacity(count);

        while order.len() < count {
            let ready = (0..count).find(|&i| {
                !placed[i]
                    && self
                        .graph
                        .neighbors(self.nodes[i])
                        .all(|dep| placed[self.graph[dep]])
            });
            // Nothing ready means the remainder is cyclic: take the first one.
            let next = match ready {
                Some(i) => i,
                None => match (0..count).find(|&i| !placed[i]) {
                    Some(i) => i,
                    None => break,
                },
            };
            placed[next] = true;
            order.push(self.manifests[next].id.clone());
        }
        order
    }
}

pub struct DependencyGraphStage {
    allowlist: CapabilityAllowlist,
}

impl DependencyGraphStage {
    pub fn new(allowlist: CapabilityAllowlist) -> Self {
        Self { allowlist }
    }
}

impl ValidationStage for DependencyGraphStage {
    fn id(&self) -> StepId {
        StepId::DependencyGraph
    }

    fn applies(&self, input: &PipelineInput<'_>) -> bool {
        !input.manifests.is_empty()
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        let report = DependencyGraph::build(&ctx.manifests, &self.allowlist).report();
        let path = ctx.workspace.write_report(DEPENDENCY_GRAPH_REPORT, &report)?;
        ctx.record_artifact("dependencyGraph", path);
        Ok(report.errors())
    }
}
