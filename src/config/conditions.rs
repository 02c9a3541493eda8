use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::provider::metadata::lookup_case_insensitive;
use crate::types::Metadata;

/// Boolean combination of metadata predicates, configured per migration.
///
/// ```json
/// {"and": [{"key": "class", "value": "gold"},
///          {"not": {"key": "state", "value": "draft"}}]}
/// ```
///
/// A bare `{"key": ..., "value": ...}` leaf matches when the remote object
/// carries that metadata key with exactly that value (keys compare
/// case-insensitively, values byte-exact). A leaf without `value` matches
/// on key presence alone.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub enum MetadataCondition {
    #[serde(rename = "and")]
    And(Vec<MetadataCondition>),
    #[serde(rename = "or")]
    Or(Vec<MetadataCondition>),
    #[serde(rename = "not")]
    Not(Box<MetadataCondition>),
    #[serde(untagged)]
    Predicate {
        key: String,
        #[serde(default)]
        value: Option<String>,
    },
}

impl MetadataCondition {
    pub fn parse(raw: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| anyhow!("invalid metadata_conditions: {e}"))
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            MetadataCondition::And(children) => children.iter().all(|c| c.matches(metadata)),
            MetadataCondition::Or(children) => children.iter().any(|c| c.matches(metadata)),
            MetadataCondition::Not(child) => !child.matches(metadata),
            MetadataCondition::Predicate { key, value } => {
                match lookup_case_insensitive(metadata, key) {
                    Some(found) => value.as_ref().is_none_or(|want| found == want),
                    None => false,
                }
            }
        }
    }
}
