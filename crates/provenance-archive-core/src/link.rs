use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

const CALCULATION_NODE_PREFIX: &str = "process.calculation.";
const WORKFLOW_NODE_PREFIX: &str = "process.workflow.";
const DATA_NODE_PREFIX: &str = "data.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Create,
    Return,
    InputCalc,
    InputWork,
    CallCalc,
    CallWork,
}

/// How many edges of one link type a node may carry in one direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// At most one edge of the type.
    Unique,
    /// At most one edge of the type per label.
    UniquePair,
    /// Only exact duplicates are forbidden.
    UniqueTriple,
}

/// Endpoint classes and degree limits for one link type.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LinkRule {
    pub source_prefix: &'static str,
    pub target_prefix: &'static str,
    pub outdegree: Cardinality,
    pub indegree: Cardinality,
}

impl LinkType {
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Return,
        Self::InputCalc,
        Self::InputWork,
        Self::CallCalc,
        Self::CallWork,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Return => "return",
            Self::InputCalc => "input_calc",
            Self::InputWork => "input_work",
            Self::CallCalc => "call_calc",
            Self::CallWork => "call_work",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "return" => Some(Self::Return),
            "input_calc" => Some(Self::InputCalc),
            "input_work" => Some(Self::InputWork),
            "call_calc" => Some(Self::CallCalc),
            "call_work" => Some(Self::CallWork),
            _ => None,
        }
    }

    #[must_use]
    pub fn rule(self) -> LinkRule {
        use Cardinality::{Unique, UniquePair, UniqueTriple};

        let (source_prefix, target_prefix, outdegree, indegree) = match self {
            Self::CallCalc => (WORKFLOW_NODE_PREFIX, CALCULATION_NODE_PREFIX, UniqueTriple, Unique),
            Self::CallWork => (WORKFLOW_NODE_PREFIX, WORKFLOW_NODE_PREFIX, UniqueTriple, Unique),
            Self::Create => (CALCULATION_NODE_PREFIX, DATA_NODE_PREFIX, UniquePair, Unique),
            Self::InputCalc => (DATA_NODE_PREFIX, CALCULATION_NODE_PREFIX, UniqueTriple, UniquePair),
            Self::InputWork => (DATA_NODE_PREFIX, WORKFLOW_NODE_PREFIX, UniqueTriple, UniquePair),
            Self::Return => (WORKFLOW_NODE_PREFIX, DATA_NODE_PREFIX, UniquePair, UniqueTriple),
        };
        LinkRule { source_prefix, target_prefix, outdegree, indegree }
    }
}

impl Display for LinkType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One edge as serialized in the archive, keyed by node UUIDs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct LinkRecord {
    pub input: String,
    pub output: String,
    pub label: String,
    #[serde(rename = "type")]
    pub link_type: LinkType,
}

impl Display for LinkRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "in_uuid={}, out_uuid={}, label={}, type={}",
            self.input, self.output, self.label, self.link_type
        )
    }
}

/// Check that a link label is non-empty, alphanumeric plus underscores, and
/// neither starts nor ends with an underscore.
///
/// # Errors
/// Returns a message describing the first rule the label breaks.
pub fn validate_link_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("link label cannot be empty".to_string());
    }
    if label.starts_with('_') {
        return Err(format!("invalid link label `{label}`: cannot start with an underscore"));
    }
    if label.ends_with('_') {
        return Err(format!("invalid link label `{label}`: cannot end with an underscore"));
    }
    if let Some(bad) = label.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(format!(
            "invalid link label `{label}`: only alphanumeric characters and underscores are allowed, found `{bad}`"
        ));
    }
    Ok(())
}
