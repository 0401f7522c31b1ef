//! Causal graph — trigger → propagation → harm attribution for postmortems
//!
//! Built from the labeled trajectory and the root-cause factors:
//!
//! - a context node when SAFE turns preceded the first UNSAFE one;
//! - the trigger at the first UNSAFE turn, named after the fingerprint;
//! - one propagation node per intermediate UNSAFE turn;
//! - the harm node at the last UNSAFE turn;
//! - the bypassed safeguard, described by the primary category's
//!   detection gap;
//! - one context node per secondary root-cause factor, amplifying the
//!   trigger.
//!
//! The graph is held in `petgraph` like the taxonomy tree.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::taxonomy::{SeverityTier, Taxonomy};
use crate::trajectory::{Incident, SafetyLabel};

pub const TRIGGER_NODE: &str = "trigger";
pub const HARM_NODE: &str = "harm";
pub const SAFEGUARD_NODE: &str = "safeguard_failure";
pub const CONTEXT_NODE: &str = "context_building";
pub const NO_HARM_NODE: &str = "no_harm";

const DEFAULT_CONFIDENCE: f64 = 0.8;
const GAP_LABEL_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Propagation,
    Harm,
    Safeguard,
    Context,
}

impl NodeKind {
    /// Base attribution weight; harm is the outcome, not a cause
    fn weight(self) -> f64 {
        match self {
            Self::Trigger => 1.0,
            Self::Propagation => 0.7,
            Self::Harm => 0.0,
            Self::Safeguard => 0.8,
            Self::Context => 0.3,
        }
    }

    fn class(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Propagation => "propagation",
            Self::Harm => "harm",
            Self::Safeguard => "safeguard",
            Self::Context => "context",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Causes,
    /// Necessary but not sufficient
    Enables,
    Amplifies,
    Bypasses,
}

impl EdgeKind {
    fn arrow(self) -> &'static str {
        match self {
            Self::Causes => "-->",
            Self::Enables => "-.->",
            Self::Amplifies => "==>",
            Self::Bypasses => "--x",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
    pub severity: SeverityTier,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl CausalNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            turn: None,
            severity: SeverityTier::Medium,
            confidence: DEFAULT_CONFIDENCE,
            evidence: Vec::new(),
        }
    }

    fn at_turn(mut self, turn: u32) -> Self {
        self.turn = Some(turn);
        self
    }

    fn with_severity(mut self, severity: SeverityTier) -> Self {
        self.severity = severity;
        self
    }

    fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalEdge {
    pub kind: EdgeKind,
    pub strength: f64,
    /// "Without X, Y would not have happened"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterfactual: Option<String>,
}

impl CausalEdge {
    pub fn new(kind: EdgeKind) -> Self {
        Self {
            kind,
            strength: 1.0,
            counterfactual: None,
        }
    }

    fn with_counterfactual(mut self, text: impl Into<String>) -> Self {
        self.counterfactual = Some(text.into());
        self
    }

    fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CausalGraph {
    incident_id: String,
    graph: DiGraph<CausalNode, CausalEdge>,
    index: HashMap<String, NodeIndex>,
    primary_cause: Option<String>,
    contributing_factors: Vec<String>,
}

impl CausalGraph {
    pub fn new(incident_id: impl Into<String>) -> Self {
        Self {
            incident_id: incident_id.into(),
            graph: DiGraph::new(),
            index: HashMap::new(),
            primary_cause: None,
            contributing_factors: Vec::new(),
        }
    }

    pub fn incident_id(&self) -> &str {
        &self.incident_id
    }

    pub fn primary_cause(&self) -> Option<&str> {
        self.primary_cause.as_deref()
    }

    pub fn contributing_factors(&self) -> &[String] {
        &self.contributing_factors
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, id: &str) -> Option<&CausalNode> {
        self.index.get(id).map(|ix| &self.graph[*ix])
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &CausalNode> {
        self.graph.node_weights()
    }

    pub fn add_node(&mut self, node: CausalNode) -> GateResult<()> {
        if self.index.contains_key(&node.id) {
            return Err(GateError::malformed(format!(
                "causal node '{}' defined twice for {}",
                node.id, self.incident_id
            )));
        }
        let id = node.id.clone();
        let ix = self.graph.add_node(node);
        self.index.insert(id, ix);
        Ok(())
    }

    pub fn add_edge(&mut self, source: &str, target: &str, edge: CausalEdge) -> GateResult<()> {
        let lookup = |id: &str| {
            self.index.get(id).copied().ok_or_else(|| {
                GateError::malformed(format!("causal edge references unknown node '{id}'"))
            })
        };
        let (from, to) = (lookup(source)?, lookup(target)?);
        self.graph.add_edge(from, to, edge);
        Ok(())
    }

    /// Build the graph for one incident
    pub fn from_incident(incident: &Incident, taxonomy: &Taxonomy) -> GateResult<Self> {
        let mut graph = Self::new(incident.id());
        let trajectory = incident.trajectory();
        let unsafe_turns: Vec<u32> = trajectory
            .iter()
            .filter(|t| t.label() == Some(SafetyLabel::Unsafe))
            .map(|t| t.position())
            .collect();

        let (Some(&first), Some(&last)) = (unsafe_turns.first(), unsafe_turns.last()) else {
            graph.add_node(CausalNode::new(NO_HARM_NODE, "No harm detected", NodeKind::Context))?;
            return Ok(graph);
        };

        let opening = trajectory.iter().next().map(|t| t.position());
        if let Some(opening) = opening.filter(|p| *p < first) {
            let label = "Context building (benign pretext)";
            graph.add_node(
                CausalNode::new(CONTEXT_NODE, label, NodeKind::Context)
                    .at_turn(opening)
                    .with_evidence(format!(
                        "turns {opening}-{} established trust",
                        first - 1
                    )),
            )?;
        }

        let fingerprint = if incident.factors().is_empty() {
            None
        } else {
            Some(incident.fingerprint(taxonomy)?)
        };
        let primary = fingerprint
            .as_ref()
            .and_then(|fp| incident.factors().iter().find(|f| f.category == fp.category));

        let mut trigger = CausalNode::new(
            TRIGGER_NODE,
            match &fingerprint {
                Some(fp) => format!("{} ({})", fp.category, fp.trigger),
                None => "Initial failure".to_string(),
            },
            NodeKind::Trigger,
        )
        .at_turn(first)
        .with_severity(SeverityTier::High);
        if let Some(factor) = primary {
            trigger.confidence = factor.confidence;
            if !factor.description.is_empty() {
                trigger.evidence.push(factor.description.clone());
            }
        }
        graph.add_node(trigger)?;

        let middle = if unsafe_turns.len() > 2 {
            &unsafe_turns[1..unsafe_turns.len() - 1]
        } else {
            &[][..]
        };
        let mut previous = TRIGGER_NODE.to_string();
        for (i, turn) in middle.iter().enumerate() {
            let id = format!("prop_{}", i + 1);
            let label = format!("Failure progression (turn {turn})");
            graph.add_node(CausalNode::new(&id, label, NodeKind::Propagation).at_turn(*turn))?;
            graph.add_edge(&previous, &id, CausalEdge::new(EdgeKind::Causes))?;
            previous = id;
        }

        graph.add_node(
            CausalNode::new(HARM_NODE, "Harm materialized", NodeKind::Harm)
                .at_turn(last)
                .with_severity(SeverityTier::Critical),
        )?;
        graph.add_edge(&previous, HARM_NODE, CausalEdge::new(EdgeKind::Causes))?;

        let gap = primary
            .and_then(|f| taxonomy.get(&f.category))
            .map(|c| c.detection_gap.trim())
            .filter(|g| !g.is_empty())
            .unwrap_or("unknown safeguard gap");
        let short: String = gap.chars().take(GAP_LABEL_CHARS).collect();
        graph.add_node(
            CausalNode::new(SAFEGUARD_NODE, format!("Safeguard gap: {short}"), NodeKind::Safeguard)
                .with_severity(SeverityTier::High)
                .with_evidence(gap),
        )?;
        graph.add_edge(
            TRIGGER_NODE,
            SAFEGUARD_NODE,
            CausalEdge::new(EdgeKind::Bypasses).with_counterfactual(
                "had the safeguard detected it, the failure would have stopped",
            ),
        )?;

        graph.primary_cause = Some(TRIGGER_NODE.to_string());
        graph.contributing_factors.push(SAFEGUARD_NODE.to_string());
        if graph.index.contains_key(CONTEXT_NODE) {
            graph.add_edge(
                CONTEXT_NODE,
                TRIGGER_NODE,
                CausalEdge::new(EdgeKind::Enables).with_counterfactual(
                    "without the pretext the trigger might have been detected",
                ),
            )?;
            graph.contributing_factors.push(CONTEXT_NODE.to_string());
        }

        let secondary = incident
            .factors()
            .iter()
            .filter(|f| primary.map_or(true, |p| !std::ptr::eq(*f, p)));
        for (i, factor) in secondary.enumerate() {
            let id = format!("factor_{}", i + 1);
            let mut node = CausalNode::new(&id, factor.category.clone(), NodeKind::Context)
                .with_severity(taxonomy.severity_tier(&factor.category)?);
            node.confidence = factor.confidence;
            if !factor.description.is_empty() {
                node.evidence.push(factor.description.clone());
            }
            graph.add_node(node)?;
            graph.add_edge(
                &id,
                TRIGGER_NODE,
                CausalEdge::new(EdgeKind::Amplifies).with_strength(factor.confidence),
            )?;
            graph.contributing_factors.push(id);
        }

        Ok(graph)
    }

    /// Trigger, then each node reached over `causes` edges, ending at harm
    pub fn chain(&self) -> Vec<&CausalNode> {
        let mut chain = Vec::new();
        let mut current = self.index.get(TRIGGER_NODE).copied();
        while let Some(ix) = current {
            chain.push(&self.graph[ix]);
            current = self
                .graph
                .edges_directed(ix, Direction::Outgoing)
                .find(|e| e.weight().kind == EdgeKind::Causes)
                .map(|e| e.target());
        }
        chain
    }

    pub fn bypassed_safeguards(&self) -> Vec<&CausalNode> {
        self.graph
            .edge_references()
            .filter(|e| e.weight().kind == EdgeKind::Bypasses)
            .map(|e| &self.graph[e.target()])
            .collect()
    }

    /// `kind weight × confidence × mean outgoing strength`, to 3 decimals
    pub fn attribution_scores(&self) -> BTreeMap<String, f64> {
        self.graph
            .node_indices()
            .map(|ix| {
                let node = &self.graph[ix];
                let mut score = node.kind.weight() * node.confidence;
                let strengths: Vec<f64> = self
                    .graph
                    .edges_directed(ix, Direction::Outgoing)
                    .map(|e| e.weight().strength)
                    .collect();
                if !strengths.is_empty() {
                    score *= strengths.iter().sum::<f64>() / strengths.len() as f64;
                }
                (node.id.clone(), (score * 1000.0).round() / 1000.0)
            })
            .collect()
    }

    /// Mermaid flowchart for embedding in postmortem markdown
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart TB\n");
        for node in self.graph.node_weights() {
            let turn = node.turn.map(|t| format!(" [T{t}]")).unwrap_or_default();
            let label = node.label.replace('"', "#quot;");
            let _ = writeln!(
                out,
                "    {}[\"{label}{turn}\"]:::{}",
                node.id,
                node.kind.class()
            );
        }
        for edge in self.graph.edge_references() {
            let _ = writeln!(
                out,
                "    {} {} {}",
                self.graph[edge.source()].id,
                edge.weight().kind.arrow(),
                self.graph[edge.target()].id
            );
        }
        out.push('\n');
        for (class, style) in [
            ("trigger", "fill:#ff6b6b,stroke:#c92a2a"),
            ("propagation", "fill:#ffd43b,stroke:#fab005"),
            ("harm", "fill:#e64980,stroke:#a61e4d"),
            ("safeguard", "fill:#69db7c,stroke:#2f9e44"),
            ("context", "fill:#74c0fc,stroke:#1971c2"),
        ] {
            let _ = writeln!(out, "    classDef {class} {style}");
        }
        out
    }

    pub fn export(&self) -> CausalGraphExport {
        CausalGraphExport {
            incident_id: self.incident_id.clone(),
            nodes: self.graph.node_weights().cloned().collect(),
            edges: self
                .graph
                .edge_references()
                .map(|e| CausalEdgeExport {
                    source: self.graph[e.source()].id.clone(),
                    target: self.graph[e.target()].id.clone(),
                    edge: e.weight().clone(),
                })
                .collect(),
            primary_cause: self.primary_cause.clone(),
            contributing_factors: self.contributing_factors.clone(),
            attribution_scores: self.attribution_scores(),
            chain: self.chain().iter().map(|n| n.id.clone()).collect(),
            bypassed_safeguards: self
                .bypassed_safeguards()
                .iter()
                .map(|n| n.id.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalEdgeExport {
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub edge: CausalEdge,
}

/// JSON shape written by `incident-lab causal-graph --json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalGraphExport {
    pub incident_id: String,
    pub nodes: Vec<CausalNode>,
    pub edges: Vec<CausalEdgeExport>,
    pub primary_cause: Option<String>,
    pub contributing_factors: Vec<String>,
    pub attribution_scores: BTreeMap<String, f64>,
    pub chain: Vec<String>,
    pub bypassed_safeguards: Vec<String>,
}
