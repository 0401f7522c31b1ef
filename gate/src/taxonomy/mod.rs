//! Taxonomy & Scoring — frozen failure-category tree with calibrated weights
//!
//! The taxonomy is a directed tree (group → leaf) held in a `petgraph` graph
//! and validated once at construction. Severity scoring is deterministic:
//!
//! ```text
//! severity = 1 - Π (1 - confidence_i × weight_i / max_weight)
//! ```
//!
//! A noisy-OR combination: several weak factors can still add up to a high
//! score, while one low-confidence factor cannot dominate. Categories are
//! never inferred at runtime; an unknown name is a hard `UnknownCategory`.

mod builtin;

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::trajectory::RootCauseFactor;

pub use builtin::{map_failure_type, BUILTIN_TAXONOMY_VERSION};

/// One taxonomy entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCategory {
    pub name: String,
    /// `None` for top-level groups
    #[serde(default)]
    pub parent: Option<String>,
    /// Multiplicative severity weight, strictly positive
    pub weight: f64,
    /// What the safeguard stack failed to detect
    #[serde(default)]
    pub detection_gap: String,
}

impl FailureCategory {
    pub fn new(
        name: impl Into<String>,
        parent: Option<&str>,
        weight: f64,
        detection_gap: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent: parent.map(str::to_string),
            weight,
            detection_gap: detection_gap.into(),
        }
    }
}

/// Serializable taxonomy file format (versioned)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyDefinition {
    pub version: String,
    pub categories: Vec<FailureCategory>,
}

/// Severity bucket derived from a category weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityTier {
    Critical,
    High,
    Medium,
    Low,
}

impl SeverityTier {
    fn from_weight(weight: f64) -> Self {
        if weight >= 1.7 {
            Self::Critical
        } else if weight >= 1.4 {
            Self::High
        } else if weight >= 1.1 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for SeverityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Frozen, validated taxonomy tree
#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: String,
    categories: Vec<FailureCategory>,
    index: HashMap<String, NodeIndex>,
    graph: DiGraph<usize, ()>,
    max_weight: f64,
}

impl Taxonomy {
    /// Build and validate a taxonomy.
    ///
    /// Rejects duplicate names, non-positive weights, dangling parents and
    /// cycles with `InvalidConfiguration`.
    pub fn new(version: impl Into<String>, categories: Vec<FailureCategory>) -> GateResult<Self> {
        let version = version.into();
        if categories.is_empty() {
            return Err(GateError::invalid_config(format!(
                "taxonomy {version} has no categories"
            )));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(categories.len());
        for (pos, cat) in categories.iter().enumerate() {
            if !cat.weight.is_finite() || cat.weight <= 0.0 {
                return Err(GateError::invalid_config(format!(
                    "category '{}' has non-positive weight {}",
                    cat.name, cat.weight
                )));
            }
            let node = graph.add_node(pos);
            if index.insert(cat.name.clone(), node).is_some() {
                return Err(GateError::invalid_config(format!(
                    "category '{}' defined twice",
                    cat.name
                )));
            }
        }

        for cat in &categories {
            if let Some(parent) = &cat.parent {
                let parent_node = index.get(parent).ok_or_else(|| {
                    GateError::invalid_config(format!(
                        "category '{}' references unknown parent '{parent}'",
                        cat.name
                    ))
                })?;
                graph.add_edge(*parent_node, index[&cat.name], ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(GateError::invalid_config(format!(
                "taxonomy {version} contains a cycle"
            )));
        }

        let max_weight = categories
            .iter()
            .map(|c| c.weight)
            .fold(f64::MIN, f64::max);

        Ok(Self {
            version,
            categories,
            index,
            graph,
            max_weight,
        })
    }

    /// Build from a parsed definition file
    pub fn from_definition(def: TaxonomyDefinition) -> GateResult<Self> {
        Self::new(def.version, def.categories)
    }

    /// The built-in calibrated taxonomy
    pub fn builtin() -> Self {
        builtin::taxonomy()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn max_weight(&self) -> f64 {
        self.max_weight
    }

    pub fn categories(&self) -> &[FailureCategory] {
        &self.categories
    }

    /// Lookup a category by name
    pub fn get(&self, name: &str) -> Option<&FailureCategory> {
        self.index
            .get(name)
            .map(|node| &self.categories[self.graph[*node]])
    }

    fn require(&self, name: &str) -> GateResult<&FailureCategory> {
        self.get(name).ok_or_else(|| GateError::UnknownCategory {
            category: name.to_string(),
            taxonomy_version: self.version.clone(),
        })
    }

    /// Weight of the category a factor references
    pub fn classify(&self, factor: &RootCauseFactor) -> GateResult<f64> {
        Ok(self.require(&factor.category)?.weight)
    }

    /// Noisy-OR severity in [0, 1]; zero for no factors
    pub fn severity_score(&self, factors: &[RootCauseFactor]) -> GateResult<f64> {
        let mut survival = 1.0;
        for factor in factors {
            let weight = self.classify(factor)?;
            let contribution = (factor.confidence * weight / self.max_weight).clamp(0.0, 1.0);
            survival *= 1.0 - contribution;
        }
        Ok((1.0 - survival).clamp(0.0, 1.0))
    }

    /// Severity bucket for a category
    pub fn severity_tier(&self, name: &str) -> GateResult<SeverityTier> {
        Ok(SeverityTier::from_weight(self.require(name)?.weight))
    }

    /// Summed confidence per category, keyed by name
    pub fn summarize(&self, factors: &[RootCauseFactor]) -> GateResult<BTreeMap<String, f64>> {
        let mut summary = BTreeMap::new();
        for factor in factors {
            self.require(&factor.category)?;
            *summary.entry(factor.category.clone()).or_insert(0.0) += factor.confidence;
        }
        Ok(summary)
    }

    /// Group factors by severity tier of their category
    pub fn categorize(
        &self,
        factors: &[RootCauseFactor],
    ) -> GateResult<BTreeMap<SeverityTier, Vec<RootCauseFactor>>> {
        let mut tiers: BTreeMap<SeverityTier, Vec<RootCauseFactor>> = BTreeMap::new();
        for factor in factors {
            let tier = self.severity_tier(&factor.category)?;
            tiers.entry(tier).or_default().push(factor.clone());
        }
        Ok(tiers)
    }

    /// Chain of parents from nearest to root
    pub fn ancestors(&self, name: &str) -> GateResult<Vec<&str>> {
        self.require(name)?;
        let mut chain = Vec::new();
        let mut node = self.index[name];
        while let Some(parent) = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .next()
        {
            chain.push(self.categories[self.graph[parent]].name.as_str());
            node = parent;
        }
        Ok(chain)
    }

    /// Top-level group a category belongs to (itself for a group)
    pub fn group_of(&self, name: &str) -> GateResult<&str> {
        let ancestors = self.ancestors(name)?;
        Ok(ancestors
            .last()
            .copied()
            .unwrap_or_else(|| self.categories[self.graph[self.index[name]]].name.as_str()))
    }
}
