//! JSON request files accepted by the CLI

use std::path::Path;

use anyhow::{Context, Result};
use facetgraph_memory::{EdgeSpec, FacetVectors, IngestRequest, Metadata, NodeId, QueryRequest};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// A single object or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Memory to ingest. Facet vectors may be given directly, or listed in
/// `embed` to be computed from `content`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestInput {
    #[serde(default)]
    pub id: Option<NodeId>,
    pub content: String,
    #[serde(default)]
    pub facets: FacetVectors,
    #[serde(default)]
    pub embed: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub importance: Option<f32>,
}

impl IngestInput {
    /// Request with the embedded facets merged in; explicit vectors win
    pub fn into_request(self, embedded: FacetVectors) -> IngestRequest {
        let mut facets = embedded;
        facets.extend(self.facets);
        IngestRequest {
            id: self.id,
            content: self.content,
            facets,
            metadata: self.metadata,
            edges: self.edges,
            importance: self.importance,
        }
    }
}

/// Query with explicit vectors and/or text to embed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInput {
    #[serde(default)]
    pub facets: FacetVectors,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub embed: Vec<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub depth: Option<usize>,
    #[serde(default)]
    pub lambda: Option<f32>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

fn default_k() -> usize {
    10
}

impl QueryInput {
    pub fn into_request(self, embedded: FacetVectors) -> QueryRequest {
        let mut facets = embedded;
        facets.extend(self.facets);
        QueryRequest {
            facets,
            k: self.k,
            depth: self.depth,
            lambda: self.lambda,
            relation: self.relation,
            deadline_ms: self.deadline_ms,
        }
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid request in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_single_and_batch_ingest_files() {
        let one: OneOrMany<IngestInput> =
            serde_json::from_str(r#"{"content": "a", "embed": ["topic"]}"#).unwrap();
        assert_eq!(one.into_vec().len(), 1);

        let many: OneOrMany<IngestInput> = serde_json::from_str(
            r#"[{"content": "a", "facets": {"topic": [1.0, 0.0]}}, {"content": "b", "importance": 0.4}]"#,
        )
        .unwrap();
        let items = many.into_vec();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].importance, Some(0.4));
    }

    #[test]
    fn test_explicit_vectors_override_embedded() {
        let input: IngestInput =
            serde_json::from_str(r#"{"content": "a", "facets": {"topic": [1.0, 0.0]}}"#).unwrap();
        let embedded = FacetVectors::from([
            ("topic".to_string(), vec![0.0, 1.0]),
            ("tone".to_string(), vec![0.5, 0.5]),
        ]);
        let request = input.into_request(embedded);
        assert_eq!(request.facets["topic"], vec![1.0, 0.0]);
        assert_eq!(request.facets["tone"], vec![0.5, 0.5]);
    }

    #[test]
    fn test_query_defaults() {
        let input: QueryInput =
            serde_json::from_str(r#"{"text": "disk full", "embed": ["topic"], "deadlineMs": 50}"#)
                .unwrap();
        assert_eq!(input.k, 10);
        let request = input.into_request(FacetVectors::new());
        assert_eq!(request.deadline_ms, Some(50));
        assert!(request.depth.is_none());
    }

    #[test]
    fn test_read_json_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = read_json::<QueryInput>(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid request"));
    }
}
