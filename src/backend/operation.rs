//! Operation descriptors, one shape per backend kind.

use serde::{Deserialize, Serialize};

use super::BackendType;

const SUMMARY_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Relational(RelationalOp),
    Pipeline(PipelineOp),
    KeyValue(KeyValueOp),
}

impl Operation {
    pub fn sql(statement: impl Into<String>) -> Self {
        Self::Relational(RelationalOp {
            statement: statement.into(),
            params: Vec::new(),
        })
    }

    pub fn pipeline(collection: impl Into<String>, stages: Vec<PipelineStage>) -> Self {
        Self::Pipeline(PipelineOp {
            collection: collection.into(),
            stages,
        })
    }

    pub fn command<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::KeyValue(KeyValueOp {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Backend type this operation shape runs against.
    pub fn backend_type(&self) -> BackendType {
        match self {
            Self::Relational(_) => BackendType::Relational,
            Self::Pipeline(_) => BackendType::Document,
            Self::KeyValue(_) => BackendType::KeyValue,
        }
    }

    /// Short single-line description for logs.
    pub fn summary(&self) -> String {
        let full = match self {
            Self::Relational(op) => op.statement.split_whitespace().collect::<Vec<_>>().join(" "),
            Self::Pipeline(op) => format!("{} [{} stages]", op.collection, op.stages.len()),
            Self::KeyValue(op) => op.command.to_uppercase(),
        };
        if full.chars().count() > SUMMARY_MAX_CHARS {
            let truncated: String = full.chars().take(SUMMARY_MAX_CHARS).collect();
            format!("{}...", truncated)
        } else {
            full
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalOp {
    pub statement: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<serde_json::Value>,
}

impl RelationalOp {
    pub fn bind(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOp {
    pub collection: String,
    pub stages: Vec<PipelineStage>,
}

/// One stage of an aggregation-style pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PipelineStage {
    Match,
    Project,
    Group,
    Sort,
    Limit { count: u64 },
    Skip { count: u64 },
    /// Join against another collection.
    Lookup { from: String },
    /// Expands an array field into one document per element.
    Unwind { path: String },
    /// Recursive cross-collection traversal; `None` depth is unbounded.
    GraphLookup {
        from: String,
        max_depth: Option<u32>,
    },
    Facet { branches: u32 },
    UnionWith { collection: String },
    Other { name: String },
}

impl PipelineStage {
    pub fn name(&self) -> &str {
        match self {
            Self::Match => "match",
            Self::Project => "project",
            Self::Group => "group",
            Self::Sort => "sort",
            Self::Limit { .. } => "limit",
            Self::Skip { .. } => "skip",
            Self::Lookup { .. } => "lookup",
            Self::Unwind { .. } => "unwind",
            Self::GraphLookup { .. } => "graph_lookup",
            Self::Facet { .. } => "facet",
            Self::UnionWith { .. } => "union_with",
            Self::Other { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValueOp {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_backend_type() {
        assert_eq!(
            Operation::sql("SELECT 1").backend_type(),
            BackendType::Relational
        );
        assert_eq!(
            Operation::pipeline("orders", vec![PipelineStage::Match]).backend_type(),
            BackendType::Document
        );
        assert_eq!(
            Operation::command("GET", ["user:1"]).backend_type(),
            BackendType::KeyValue
        );
    }

    #[test]
    fn test_summary_is_truncated() {
        let long = format!("SELECT {} FROM t", "col, ".repeat(50));
        let summary = Operation::sql(long).summary();
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 3);
    }

    #[test]
    fn test_pipeline_deserialize() {
        let json = r#"{
            "kind": "pipeline",
            "collection": "orders",
            "stages": [
                {"stage": "match"},
                {"stage": "lookup", "from": "customers"},
                {"stage": "graph_lookup", "from": "edges", "max_depth": null},
                {"stage": "limit", "count": 10}
            ]
        }"#;
        let op: Operation = serde_json::from_str(json).unwrap();
        match op {
            Operation::Pipeline(p) => {
                assert_eq!(p.stages.len(), 4);
                assert_eq!(p.stages[2].name(), "graph_lookup");
            }
            other => panic!("Expected pipeline, got {:?}", other),
        }
    }
}
