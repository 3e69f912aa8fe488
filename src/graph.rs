//! The workflow graph: stage identifiers, edges, and structural validation.
//!
//! A [`WorkflowGraph`] is a directed graph whose nodes are [`StageId`]s and
//! whose edges are either fixed or conditional. Conditional edges carry a
//! routing function plus the closed set of targets it may return, which is
//! what lets [`GraphBuilder::build`] check the graph before any run and
//! [`WorkflowGraph::to_mermaid`] draw every branch.
//!
//! ```text
//! schema              -> analyze
//! analyze             -> generate | summarize
//! generate            -> validate
//! validate            -> generate (regenerate) | execute
//! execute             -> evaluate
//! evaluate            -> check_visualization | correct
//! correct             -> execute_corrected -> check_visualization
//! check_visualization -> visualize | summarize
//! visualize           -> summarize -> END
//! ```

use crate::error::{AgentError, Result};
use crate::routing::{self, RetryPolicy};
use crate::state::RequestState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Identifier of one stage in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Schema,
    Analyze,
    Generate,
    Validate,
    Execute,
    Evaluate,
    Correct,
    ExecuteCorrected,
    CheckVisualization,
    Visualize,
    Summarize,
}

impl StageId {
    pub const ALL: [StageId; 11] = [
        StageId::Schema,
        StageId::Analyze,
        StageId::Generate,
        StageId::Validate,
        StageId::Execute,
        StageId::Evaluate,
        StageId::Correct,
        StageId::ExecuteCorrected,
        StageId::CheckVisualization,
        StageId::Visualize,
        StageId::Summarize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Schema => "schema",
            StageId::Analyze => "analyze",
            StageId::Generate => "generate",
            StageId::Validate => "validate",
            StageId::Execute => "execute",
            StageId::Evaluate => "evaluate",
            StageId::Correct => "correct",
            StageId::ExecuteCorrected => "execute_corrected",
            StageId::CheckVisualization => "check_visualization",
            StageId::Visualize => "visualize",
            StageId::Summarize => "summarize",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where control goes after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Stage(StageId),
    End,
}

impl From<StageId> for Target {
    fn from(id: StageId) -> Self {
        Target::Stage(id)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Stage(id) => id.fmt(f),
            Target::End => f.write_str("__end__"),
        }
    }
}

/// A routing function. May update bookkeeping fields (retry counters,
/// reflection) on the state it inspects.
pub type RouteFn = Arc<dyn Fn(&mut RequestState) -> Target + Send + Sync>;

#[derive(Clone)]
pub enum Edge {
    Fixed(Target),
    Conditional {
        name: &'static str,
        targets: Vec<Target>,
        route: RouteFn,
    },
}

impl Edge {
    fn targets(&self) -> Vec<Target> {
        match self {
            Edge::Fixed(t) => vec![*t],
            Edge::Conditional { targets, .. } => targets.clone(),
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Fixed(t) => f.debug_tuple("Fixed").field(t).finish(),
            Edge::Conditional { name, targets, .. } => f
                .debug_struct("Conditional")
                .field("name", name)
                .field("targets", targets)
                .finish(),
        }
    }
}

/// A validated stage graph. Build one with [`GraphBuilder`] or use
/// [`WorkflowGraph::sql_agent`].
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    entry: StageId,
    edges: BTreeMap<StageId, Edge>,
}

impl WorkflowGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// The standard NL-to-SQL workflow.
    pub fn sql_agent(policy: RetryPolicy) -> Result<Self> {
        let validate_route: RouteFn = Arc::new(move |state: &mut RequestState| policy.route(state));

        GraphBuilder::default()
            .entry(StageId::Schema)
            .edge(StageId::Schema, StageId::Analyze)
            .conditional(
                StageId::Analyze,
                "query_relevant",
                [StageId::Generate.into(), StageId::Summarize.into()],
                Arc::new(|state: &mut RequestState| routing::route_after_analyze(state)),
            )
            .edge(StageId::Generate, StageId::Validate)
            .conditional(
                StageId::Validate,
                "sql_valid",
                [StageId::Generate.into(), StageId::Execute.into()],
                validate_route,
            )
            .edge(StageId::Execute, StageId::Evaluate)
            .conditional(
                StageId::Evaluate,
                "result_relevant",
                [StageId::CheckVisualization.into(), StageId::Correct.into()],
                Arc::new(|state: &mut RequestState| routing::route_after_evaluate(state)),
            )
            .edge(StageId::Correct, StageId::ExecuteCorrected)
            .edge(StageId::ExecuteCorrected, StageId::CheckVisualization)
            .conditional(
                StageId::CheckVisualization,
                "needs_chart",
                [StageId::Visualize.into(), StageId::Summarize.into()],
                Arc::new(|state: &mut RequestState| routing::route_after_check_visualization(state)),
            )
            .edge(StageId::Visualize, StageId::Summarize)
            .edge(StageId::Summarize, Target::End)
            .build()
    }

    pub fn entry(&self) -> StageId {
        self.entry
    }

    /// Every stage that has an outgoing edge.
    pub fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.edges.keys().copied()
    }

    pub fn edge(&self, from: StageId) -> Option<&Edge> {
        self.edges.get(&from)
    }

    /// Resolve the successor of `from`, running its routing function if any.
    pub fn next(&self, from: StageId, state: &mut RequestState) -> Result<Target> {
        match self.edges.get(&from) {
            Some(Edge::Fixed(t)) => Ok(*t),
            Some(Edge::Conditional { name, targets, route }) => {
                let target = route(state);
                if !targets.contains(&target) {
                    return Err(AgentError::InvalidGraph(format!(
                        "router {name} on {from} returned undeclared target {target}"
                    )));
                }
                Ok(target)
            }
            None => Err(AgentError::InvalidGraph(format!("stage {from} has no outgoing edge"))),
        }
    }

    /// Render the graph as a Mermaid flowchart. Conditional edges are dotted
    /// and labelled with their router name.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD;\n");
        out.push_str(&format!("    __start__ --> {};\n", self.entry));
        for (from, edge) in &self.edges {
            match edge {
                Edge::Fixed(to) => out.push_str(&format!("    {from} --> {to};\n")),
                Edge::Conditional { name, targets, .. } => {
                    for to in targets {
                        out.push_str(&format!("    {from} -.{name}.-> {to};\n"));
                    }
                }
            }
        }
        out
    }
}

/// Assembles and validates a [`WorkflowGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    entry: Option<StageId>,
    edges: BTreeMap<StageId, Edge>,
    errors: Vec<String>,
}

impl GraphBuilder {
    pub fn entry(mut self, stage: StageId) -> Self {
        self.entry = Some(stage);
        self
    }

    pub fn edge(self, from: StageId, to: impl Into<Target>) -> Self {
        self.insert(from, Edge::Fixed(to.into()))
    }

    pub fn conditional(
        self,
        from: StageId,
        name: &'static str,
        targets: impl IntoIterator<Item = Target>,
        route: RouteFn,
    ) -> Self {
        let targets = targets.into_iter().collect();
        self.insert(from, Edge::Conditional { name, targets, route })
    }

    fn insert(mut self, from: StageId, edge: Edge) -> Self {
        if self.edges.insert(from, edge).is_some() {
            self.errors.push(format!("stage {from} has more than one outgoing edge"));
        }
        self
    }

    /// Check the graph:
    /// - an entry stage is set and has an outgoing edge
    /// - each stage has exactly one outgoing edge
    /// - every target is a stage with an outgoing edge, or `End`
    /// - conditional edges declare at least one target
    /// - `End` is reachable from the entry
    pub fn build(self) -> Result<WorkflowGraph> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(AgentError::InvalidGraph(first));
        }
        let entry = self
            .entry
            .ok_or_else(|| AgentError::InvalidGraph("no entry stage".into()))?;
        if !self.edges.contains_key(&entry) {
            return Err(AgentError::InvalidGraph(format!(
                "entry stage {entry} has no outgoing edge"
            )));
        }

        for (from, edge) in &self.edges {
            let targets = edge.targets();
            if targets.is_empty() {
                return Err(AgentError::InvalidGraph(format!(
                    "conditional edge on {from} declares no targets"
                )));
            }
            for target in targets {
                if let Target::Stage(to) = target {
                    if !self.edges.contains_key(&to) {
                        return Err(AgentError::InvalidGraph(format!(
                            "edge {from} -> {to} points at a stage with no outgoing edge"
                        )));
                    }
                }
            }
        }

        let mut seen = BTreeSet::new();
        let mut frontier = vec![entry];
        let mut reaches_end = false;
        while let Some(stage) = frontier.pop() {
            if !seen.insert(stage) {
                continue;
            }
            for target in self.edges.get(&stage).map(Edge::targets).unwrap_or_default() {
                match target {
                    Target::Stage(next) => frontier.push(next),
                    Target::End => reaches_end = true,
                }
            }
        }
        if !reaches_end {
            return Err(AgentError::InvalidGraph(format!(
                "no path from {entry} reaches the end"
            )));
        }

        Ok(WorkflowGraph {
            entry,
            edges: self.edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> WorkflowGraph {
        WorkflowGraph::sql_agent(RetryPolicy::default()).unwrap()
    }

    #[test]
    fn test_standard_graph_covers_all_stages() {
        let graph = standard();
        let stages: Vec<_> = graph.stages().collect();
        assert_eq!(stages.len(), StageId::ALL.len());
        assert_eq!(graph.entry(), StageId::Schema);
    }

    #[test]
    fn test_fixed_edge_next() {
        let graph = standard();
        let mut state = RequestState::new("q", "s", "r").unwrap();
        assert_eq!(
            graph.next(StageId::Generate, &mut state).unwrap(),
            Target::Stage(StageId::Validate)
        );
        assert_eq!(graph.next(StageId::Summarize, &mut state).unwrap(), Target::End);
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let err = WorkflowGraph::builder()
            .entry(StageId::Schema)
            .edge(StageId::Schema, StageId::Summarize)
            .edge(StageId::Schema, StageId::Analyze)
            .edge(StageId::Summarize, Target::End)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one outgoing edge"));
    }

    #[test]
    fn test_dangling_target_rejected() {
        let err = WorkflowGraph::builder()
            .entry(StageId::Schema)
            .edge(StageId::Schema, StageId::Analyze)
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidGraph(_)));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let err = WorkflowGraph::builder()
            .edge(StageId::Summarize, Target::End)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no entry"));
    }

    #[test]
    fn test_cycle_without_exit_rejected() {
        let err = WorkflowGraph::builder()
            .entry(StageId::Generate)
            .edge(StageId::Generate, StageId::Validate)
            .edge(StageId::Validate, StageId::Generate)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("reaches the end"));
    }

    #[test]
    fn test_undeclared_route_target_is_error() {
        let graph = WorkflowGraph::builder()
            .entry(StageId::Analyze)
            .conditional(
                StageId::Analyze,
                "broken",
                [Target::End],
                Arc::new(|_: &mut RequestState| Target::Stage(StageId::Generate)),
            )
            .build()
            .unwrap();
        let mut state = RequestState::new("q", "s", "r").unwrap();
        assert!(graph.next(StageId::Analyze, &mut state).is_err());
    }

    #[test]
    fn test_mermaid_export() {
        let mermaid = standard().to_mermaid();
        assert!(mermaid.starts_with("graph TD;"));
        assert!(mermaid.contains("__start__ --> schema;"));
        assert!(mermaid.contains("validate -.sql_valid.-> generate;"));
        assert!(mermaid.contains("correct --> execute_corrected;"));
        assert!(mermaid.contains("summarize --> __end__;"));
    }
}
