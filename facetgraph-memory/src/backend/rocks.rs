//! RocksDB backend
//!
//! Persistent storage with LZ4 compression. The whole store is mirrored in a
//! [`GraphCache`] loaded at open; every mutation is written to RocksDB before
//! the cache changes.
//!
//! Key layout:
//! - `node:{id}`                       MessagePack `MemoryNode`
//! - `edge:{source}:{target}:{relation}` bincode `Edge`
//! - `vec:{facet}:{id}`                bincode `Vec<f32>`
//! - `_layout_version`                 u32 little endian

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{ErrorKind, IteratorMode, Options, WriteBatch, DB};

use super::cache::GraphCache;
use super::BackendAdapter;
use crate::error::{MemoryError, Result};
use crate::node::{Edge, EdgeKey, MemoryNode, NodeId};

const LAYOUT_VERSION_KEY: &[u8] = b"_layout_version";
const CURRENT_LAYOUT: u32 = 1;

const NODE_PREFIX: &str = "node:";
const EDGE_PREFIX: &str = "edge:";
const VEC_PREFIX: &str = "vec:";

fn node_key(id: &NodeId) -> String {
    format!("{}{}", NODE_PREFIX, id)
}

fn edge_key(key: &EdgeKey) -> String {
    format!("{}{}:{}:{}", EDGE_PREFIX, key.source, key.target, key.relation)
}

fn vec_key(facet: &str, id: &NodeId) -> String {
    format!("{}{}:{}", VEC_PREFIX, facet, id)
}

/// Busy or timed-out RocksDB calls are worth retrying; everything else is not
fn storage_error(e: rocksdb::Error) -> MemoryError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut | ErrorKind::Incomplete => {
            MemoryError::unavailable(e.to_string())
        }
        _ => MemoryError::Storage(e),
    }
}

/// RocksDB-backed adapter
pub struct RocksDbAdapter {
    db: Arc<DB>,
    cache: GraphCache,
}

impl RocksDbAdapter {
    /// Open (creating if missing) the database at `path` and load it into memory
    pub fn open(path: impl AsRef<Path>, exact_search_threshold: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(storage_error)?;
        check_layout(&db)?;

        log::info!("RocksDB backend opened at: {}", path.display());

        let adapter = Self {
            db: Arc::new(db),
            cache: GraphCache::new(exact_search_threshold),
        };
        adapter.load_cache()?;
        Ok(adapter)
    }

    /// Load every record into the cache. Undecodable records are skipped.
    fn load_cache(&self) -> Result<()> {
        let mut nodes = 0;
        let mut edges = Vec::new();
        let mut vectors = 0;
        let mut skipped = 0;

        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item.map_err(storage_error)?;
            let key_str = String::from_utf8_lossy(&key);

            if key_str.starts_with(NODE_PREFIX) {
                match rmp_serde::from_slice::<MemoryNode>(&value) {
                    Ok(node) => {
                        self.cache.load_node(node);
                        nodes += 1;
                    }
                    Err(e) => {
                        log::warn!("Failed to decode {}: {}. Skipping.", key_str, e);
                        skipped += 1;
                    }
                }
            } else if key_str.starts_with(EDGE_PREFIX) {
                match bincode::deserialize::<Edge>(&value) {
                    Ok(edge) => edges.push(edge),
                    Err(e) => {
                        log::warn!("Failed to decode {}: {}. Skipping.", key_str, e);
                        skipped += 1;
                    }
                }
            } else if let Some(rest) = key_str.strip_prefix(VEC_PREFIX) {
                // Node ids never contain ':', facet names may
                let parsed = rest
                    .rsplit_once(':')
                    .and_then(|(facet, id)| id.parse::<NodeId>().ok().map(|id| (facet, id)));
                match (parsed, bincode::deserialize::<Vec<f32>>(&value)) {
                    (Some((facet, id)), Ok(vector)) => {
                        self.cache.load_vector(facet, id, vector);
                        vectors += 1;
                    }
                    _ => {
                        log::warn!("Failed to decode {}. Skipping.", key_str);
                        skipped += 1;
                    }
                }
            }
        }

        // Edges last so both endpoints are known
        let mut edge_total = 0;
        let mut dangling = WriteBatch::default();
        for edge in edges {
            let key = edge_key(&edge.key());
            if self.cache.load_edge(edge) {
                edge_total += 1;
            } else {
                log::warn!("Dropping {}: endpoint missing", key);
                dangling.delete(key.as_bytes());
            }
        }
        if !dangling.is_empty() {
            log::warn!("Removed {} dangling edges", dangling.len());
            self.db.write(dangling).map_err(storage_error)?;
        }

        if nodes + edge_total + vectors > 0 {
            log::info!(
                "Loaded {} nodes, {} edges and {} vectors from disk",
                nodes,
                edge_total,
                vectors
            );
        }
        if skipped > 0 {
            log::warn!("Skipped {} records due to decode errors", skipped);
        }
        Ok(())
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_error)
    }
}

/// Stamp a fresh database with the current layout, refuse newer ones
fn check_layout(db: &DB) -> Result<()> {
    match db.get(LAYOUT_VERSION_KEY).map_err(storage_error)? {
        Some(bytes) => {
            let version_bytes: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| MemoryError::validation("invalid layout version record"))?;
            let version = u32::from_le_bytes(version_bytes);
            log::debug!("Storage layout version {}", version);
            if version > CURRENT_LAYOUT {
                return Err(MemoryError::validation(format!(
                    "storage layout v{} is newer than supported v{}",
                    version, CURRENT_LAYOUT
                )));
            }
            Ok(())
        }
        None => {
            db.put(LAYOUT_VERSION_KEY, CURRENT_LAYOUT.to_le_bytes())
                .map_err(storage_error)?;
            Ok(())
        }
    }
}

#[async_trait]
impl BackendAdapter for RocksDbAdapter {
    fn name(&self) -> &str {
        "rocksdb"
    }

    async fn put_node(&self, node: &MemoryNode, expected_version: Option<u64>) -> Result<u64> {
        self.cache.put_node(node, expected_version, |stored| {
            let bytes = rmp_serde::to_vec_named(stored)?;
            self.db
                .put(node_key(&stored.id).as_bytes(), bytes)
                .map_err(storage_error)
        })
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<MemoryNode>> {
        Ok(self.cache.get_node(id))
    }

    async fn delete_node(
        &self,
        id: &NodeId,
        expected_version: Option<u64>,
    ) -> Result<Option<MemoryNode>> {
        self.cache.delete_node(id, expected_version, |id| {
            self.db
                .delete(node_key(id).as_bytes())
                .map_err(storage_error)
        })
    }

    async fn list_node_ids(&self) -> Result<Vec<NodeId>> {
        Ok(self.cache.node_ids())
    }

    async fn node_count(&self) -> Result<usize> {
        Ok(self.cache.node_count())
    }

    async fn put_edge(&self, edge: &Edge) -> Result<Option<Edge>> {
        self.cache.put_edge(
            edge,
            |edge| {
                let bytes = bincode::serialize(edge)?;
                self.db
                    .put(edge_key(&edge.key()).as_bytes(), bytes)
                    .map_err(storage_error)
            },
            |key| {
                self.db
                    .delete(edge_key(key).as_bytes())
                    .map_err(storage_error)
            },
        )
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        self.cache.delete_edge(key, |key| {
            self.db
                .delete(edge_key(key).as_bytes())
                .map_err(storage_error)
        })
    }

    async fn edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        Ok(self.cache.edges_of(id))
    }

    async fn delete_edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        self.cache.delete_edges_of(id, |edges| {
            let mut batch = WriteBatch::default();
            for edge in edges {
                batch.delete(edge_key(&edge.key()).as_bytes());
            }
            self.db.write(batch).map_err(storage_error)
        })
    }

    async fn edge_count(&self) -> Result<usize> {
        Ok(self.cache.edge_count())
    }

    async fn put_vector(
        &self,
        facet: &str,
        id: &NodeId,
        vector: &[f32],
    ) -> Result<Option<Vec<f32>>> {
        self.cache.put_vector(facet, id, vector, || {
            let bytes = bincode::serialize(vector)?;
            self.db
                .put(vec_key(facet, id).as_bytes(), bytes)
                .map_err(storage_error)
        })
    }

    async fn get_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        Ok(self.cache.get_vector(facet, id))
    }

    async fn delete_vector(&self, facet: &str, id: &NodeId) -> Result<Option<Vec<f32>>> {
        self.cache.delete_vector(facet, id, || {
            self.db
                .delete(vec_key(facet, id).as_bytes())
                .map_err(storage_error)
        })
    }

    async fn vector_search(
        &self,
        facet: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>> {
        Ok(self.cache.vector_search(facet, query, k))
    }

    async fn vector_count(&self, facet: &str) -> Result<usize> {
        Ok(self.cache.vector_count(facet))
    }

    async fn batch_put(&self, nodes: &[MemoryNode]) -> Result<Vec<u64>> {
        let mut versions = Vec::with_capacity(nodes.len());
        for node in nodes {
            versions.push(self.put_node(node, None).await?);
        }
        self.flush()?;
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reopen_restores_graph_and_vectors() {
        let dir = TempDir::new().unwrap();
        let a = MemoryNode::builder()
            .content("Alice is a backend engineer")
            .facet("role:eng", vec![1.0, 0.0])
            .meta("team", serde_json::json!("infra"))
            .build()
            .unwrap();
        let b = MemoryNode::builder().content("Bob").build().unwrap();

        {
            let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
            adapter.put_node(&a, None).await.unwrap();
            adapter.put_node(&b, None).await.unwrap();
            adapter
                .put_edge(&Edge::new(a.id, b.id, "mentors", 0.7))
                .await
                .unwrap();
            adapter
                .put_vector("role:eng", &a.id, &[1.0, 0.0])
                .await
                .unwrap();
            adapter.flush().unwrap();
        }

        let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
        let restored = adapter.get_node(&a.id).await.unwrap().unwrap();
        assert_eq!(restored.content, a.content);
        assert_eq!(restored.version, 1);
        assert_eq!(restored.metadata.get("team"), Some(&serde_json::json!("infra")));
        assert_eq!(adapter.edges_of(&b.id).await.unwrap().len(), 1);
        assert_eq!(
            adapter.get_vector("role:eng", &a.id).await.unwrap(),
            Some(vec![1.0, 0.0])
        );
    }

    #[tokio::test]
    async fn test_deletes_are_durable() {
        let dir = TempDir::new().unwrap();
        let a = MemoryNode::builder().content("a").build().unwrap();
        let b = MemoryNode::builder().content("b").build().unwrap();

        {
            let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
            adapter.put_node(&a, None).await.unwrap();
            adapter.put_node(&b, None).await.unwrap();
            adapter
                .put_edge(&Edge::new(a.id, b.id, "knows", 0.5))
                .await
                .unwrap();
            adapter.put_vector("topic", &a.id, &[0.5]).await.unwrap();

            adapter.delete_edges_of(&a.id).await.unwrap();
            adapter.delete_vector("topic", &a.id).await.unwrap();
            adapter.delete_node(&a.id, Some(1)).await.unwrap();
        }

        let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
        assert!(adapter.get_node(&a.id).await.unwrap().is_none());
        assert_eq!(adapter.node_count().await.unwrap(), 1);
        assert_eq!(adapter.edge_count().await.unwrap(), 0);
        assert_eq!(adapter.vector_count("topic").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dangling_edge_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let a = MemoryNode::builder().content("a").build().unwrap();
        let gone = NodeId::new();
        let dangling = Edge::new(a.id, gone, "knows", 0.5);

        {
            let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
            adapter.put_node(&a, None).await.unwrap();
            // Left behind by a writer that lost the race with a delete
            adapter
                .db
                .put(
                    edge_key(&dangling.key()).as_bytes(),
                    bincode::serialize(&dangling).unwrap(),
                )
                .unwrap();
        }

        let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
        assert_eq!(adapter.edge_count().await.unwrap(), 0);
        assert!(adapter.edges_of(&a.id).await.unwrap().is_empty());
        assert!(adapter
            .db
            .get(edge_key(&dangling.key()).as_bytes())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lost_endpoint_race_removes_persisted_edge() {
        let dir = TempDir::new().unwrap();
        let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
        let a = MemoryNode::builder().content("a").build().unwrap();
        let b = MemoryNode::builder().content("b").build().unwrap();
        adapter.put_node(&a, None).await.unwrap();
        adapter.put_node(&b, None).await.unwrap();
        let edge = Edge::new(a.id, b.id, "knows", 0.5);

        // The endpoint disappears after the persist hook has run
        let err = adapter
            .cache
            .put_edge(
                &edge,
                |edge| {
                    adapter
                        .db
                        .put(
                            edge_key(&edge.key()).as_bytes(),
                            bincode::serialize(edge).unwrap(),
                        )
                        .unwrap();
                    adapter.cache.delete_node(&b.id, None, |_| Ok(())).unwrap();
                    Ok(())
                },
                |key| {
                    adapter
                        .db
                        .delete(edge_key(key).as_bytes())
                        .map_err(storage_error)
                },
            )
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
        assert_eq!(adapter.edge_count().await.unwrap(), 0);
        assert!(adapter
            .db
            .get(edge_key(&edge.key()).as_bytes())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_batch_put_versions_in_order_and_durable() {
        let dir = TempDir::new().unwrap();
        let existing = MemoryNode::builder().content("existing").build().unwrap();
        let fresh: Vec<MemoryNode> = ["one", "two"]
            .iter()
            .map(|c| MemoryNode::builder().content(*c).build().unwrap())
            .collect();

        {
            let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
            adapter.put_node(&existing, None).await.unwrap();
            let batch = vec![existing.clone(), fresh[0].clone(), fresh[1].clone()];
            assert_eq!(adapter.batch_put(&batch).await.unwrap(), vec![2, 1, 1]);
        }

        let adapter = RocksDbAdapter::open(dir.path(), 16).unwrap();
        assert_eq!(adapter.node_count().await.unwrap(), 3);
        let restored = adapter.get_node(&existing.id).await.unwrap().unwrap();
        assert_eq!(restored.version, 2);
        assert!(adapter.get_node(&fresh[1].id).await.unwrap().is_some());
    }

    #[test]
    fn test_newer_layout_refused() {
        let dir = TempDir::new().unwrap();
        {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            let db = DB::open(&opts, dir.path()).unwrap();
            db.put(LAYOUT_VERSION_KEY, (CURRENT_LAYOUT + 1).to_le_bytes())
                .unwrap();
        }
        assert!(RocksDbAdapter::open(dir.path(), 16).is_err());
    }
}
