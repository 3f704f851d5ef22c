use crate::{
    error::{ApiError, Result},
    ml::{Embedder, FlatL2Index, Neighbor},
    models::{IndexReport, ProductVariant},
    services::{
        catalog_repository::CatalogQueries,
        index_repository::{SnapshotStore, StoredSnapshot},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Texts embedded per progress tick during a rebuild.
const EMBED_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SemanticHit {
    pub product_id: i64,
    pub variant_id: i64,
    pub distance: f32,
}

/// A loaded index together with the pair behind each position.
#[derive(Debug)]
pub struct ActiveIndex {
    pub snapshot_id: i64,
    pub model_name: String,
    index: FlatL2Index,
    id_map: Vec<(i64, i64)>,
}

impl ActiveIndex {
    fn new(
        snapshot_id: i64,
        model_name: String,
        index: FlatL2Index,
        id_map: Vec<(i64, i64)>,
    ) -> Result<Self> {
        if index.len() != id_map.len() {
            return Err(ApiError::IndexError(format!(
                "Snapshot {} holds {} vectors but maps {} positions",
                snapshot_id,
                index.len(),
                id_map.len()
            )));
        }

        Ok(Self {
            snapshot_id,
            model_name,
            index,
            id_map,
        })
    }

    fn from_snapshot(snapshot: StoredSnapshot) -> Result<Self> {
        let index = FlatL2Index::from_bytes(&snapshot.blob)?;
        Self::new(
            snapshot.info.id,
            snapshot.info.model_name,
            index,
            snapshot.id_map,
        )
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SemanticHit>> {
        let neighbors = self.index.search(query, k)?;
        resolve_hits(&neighbors, &self.id_map)
    }
}

/// Map index positions back to catalog pairs.
fn resolve_hits(neighbors: &[Neighbor], id_map: &[(i64, i64)]) -> Result<Vec<SemanticHit>> {
    neighbors
        .iter()
        .map(|n| {
            let (product_id, variant_id) = id_map.get(n.position).copied().ok_or_else(|| {
                ApiError::IndexError(format!(
                    "Index position {} has no entry in the id map ({} entries)",
                    n.position,
                    id_map.len()
                ))
            })?;
            Ok(SemanticHit {
                product_id,
                variant_id,
                distance: n.distance,
            })
        })
        .collect()
}

/// Builds, stores and serves the semantic index over the catalog.
#[derive(Clone)]
pub struct SemanticIndexService {
    embedder: Arc<dyn Embedder>,
    catalog: Arc<dyn CatalogQueries>,
    snapshots: Arc<dyn SnapshotStore>,
    active: Arc<RwLock<Option<Arc<ActiveIndex>>>>,
}

impl SemanticIndexService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        catalog: Arc<dyn CatalogQueries>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            embedder,
            catalog,
            snapshots,
            active: Arc::new(RwLock::new(None)),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    pub async fn rebuild(&self) -> Result<IndexReport> {
        self.rebuild_with_progress(|_, _| {}).await
    }

    /// Re-embed the whole catalog and store a new snapshot. `progress` is
    /// called with `(embedded, total)` after every chunk.
    #[instrument(skip_all)]
    pub async fn rebuild_with_progress<F>(&self, progress: F) -> Result<IndexReport>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let pairs = self.catalog.products_with_variants().await?;
        if pairs.is_empty() {
            return Err(ApiError::InvalidInput(
                "Catalog is empty; sync products before building the index".to_string(),
            ));
        }

        let texts: Vec<String> = pairs.iter().map(ProductVariant::search_text).collect();
        let id_map: Vec<(i64, i64)> = pairs.iter().map(|p| (p.product_id, p.variant_id)).collect();
        info!("Embedding {} product variants", texts.len());

        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(EMBED_CHUNK) {
            embeddings.extend(self.embedder.embed_batch(chunk).await?);
            progress(embeddings.len(), texts.len());
        }

        let index = FlatL2Index::from_embeddings(&embeddings)?;
        let blob = index.to_bytes()?;
        let model_name = self.embedder.model_name().to_string();

        let snapshot_id = self
            .snapshots
            .save_snapshot(&model_name, index.dimension(), &blob, &id_map)
            .await?;

        let report = IndexReport {
            snapshot_id,
            vectors: index.len(),
            dimension: index.dimension(),
            model: model_name.clone(),
        };

        let active = ActiveIndex::new(snapshot_id, model_name, index, id_map)?;
        *self.active.write().await = Some(Arc::new(active));

        info!(
            snapshot_id,
            vectors = report.vectors,
            dimension = report.dimension,
            "Semantic index rebuilt"
        );
        Ok(report)
    }

    /// The index of the latest stored snapshot, loading it on first use or
    /// when a newer snapshot has been written.
    pub async fn active(&self) -> Result<Arc<ActiveIndex>> {
        let latest_id = self.snapshots.latest_snapshot_id().await?.ok_or_else(|| {
            ApiError::IndexError("No semantic index has been built yet".to_string())
        })?;

        if let Some(current) = self.active.read().await.as_ref() {
            if current.snapshot_id == latest_id {
                return Ok(Arc::clone(current));
            }
        }

        let mut guard = self.active.write().await;
        if let Some(current) = guard.as_ref() {
            if current.snapshot_id == latest_id {
                return Ok(Arc::clone(current));
            }
        }

        let snapshot = self.snapshots.load_latest().await?.ok_or_else(|| {
            ApiError::IndexError("No semantic index has been built yet".to_string())
        })?;
        let loaded = Arc::new(ActiveIndex::from_snapshot(snapshot)?);
        debug!(
            snapshot_id = loaded.snapshot_id,
            vectors = loaded.len(),
            "Loaded semantic index"
        );

        *guard = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    #[instrument(skip(self))]
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SemanticHit>> {
        let index = self.active().await?;
        if index.model_name != self.embedder.model_name() {
            warn!(
                index_model = %index.model_name,
                embedder_model = %self.embedder.model_name(),
                "Index was built with a different embedding model"
            );
        }

        let embedding = self.embedder.embed(query).await?;
        index.search(&embedding, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::embedder::test_support::{vector_for, HashEmbedder};
    use crate::models::sample_pair;
    use crate::services::{
        catalog_repository::test_support::InMemoryCatalog,
        index_repository::test_support::InMemorySnapshots,
    };

    fn catalog_pairs() -> Vec<ProductVariant> {
        // Deliberately unsorted; positions follow (product id, variant id).
        vec![
            sample_pair(3, 30, "Wool Hat", 25.0),
            sample_pair(1, 11, "Trail Runner", 95.0),
            sample_pair(2, 20, "Court Classic", 45.0),
            sample_pair(1, 10, "Trail Runner", 90.0),
        ]
    }

    fn service_over(pairs: Vec<ProductVariant>) -> (SemanticIndexService, Arc<InMemorySnapshots>) {
        let snapshots = Arc::new(InMemorySnapshots::default());
        let service = SemanticIndexService::new(
            Arc::new(HashEmbedder::new()),
            Arc::new(InMemoryCatalog::new(Vec::new()).with_pairs(pairs)),
            snapshots.clone(),
        );
        (service, snapshots)
    }

    #[tokio::test]
    async fn test_rebuild_stores_map_in_embedding_order() {
        let (service, snapshots) = service_over(catalog_pairs());
        let report = service.rebuild().await.unwrap();

        assert_eq!(report.snapshot_id, 1);
        assert_eq!(report.vectors, 4);
        assert_eq!(report.dimension, 4);
        assert_eq!(report.model, "hash-test");

        let stored = snapshots.load_latest().await.unwrap().unwrap();
        assert_eq!(stored.id_map, vec![(1, 10), (1, 11), (2, 20), (3, 30)]);
        assert_eq!(stored.info.vector_count, 4);
    }

    #[tokio::test]
    async fn test_search_after_rebuild_resolves_each_pair() {
        let (service, _) = service_over(catalog_pairs());
        service.rebuild().await.unwrap();

        for pair in catalog_pairs() {
            let hits = service.search(&pair.search_text(), 1).await.unwrap();
            assert_eq!(
                (hits[0].product_id, hits[0].variant_id),
                (pair.product_id, pair.variant_id)
            );
            assert_eq!(hits[0].distance, 0.0);
        }
    }

    #[tokio::test]
    async fn test_fresh_service_loads_stored_snapshot() {
        let (builder, snapshots) = service_over(catalog_pairs());
        builder.rebuild().await.unwrap();

        // A second instance sharing only the snapshot store, as after a restart.
        let reader = SemanticIndexService::new(
            Arc::new(HashEmbedder::new()),
            Arc::new(InMemoryCatalog::new(Vec::new())),
            snapshots,
        );
        let active = reader.active().await.unwrap();
        assert_eq!(active.snapshot_id, 1);

        let target = sample_pair(2, 20, "Court Classic", 45.0);
        let hits = active.search(&vector_for(&target.search_text()), 1).unwrap();
        assert_eq!((hits[0].product_id, hits[0].variant_id), (2, 20));
    }

    #[tokio::test]
    async fn test_newer_snapshot_replaces_cached_index() {
        let (service, _) = service_over(catalog_pairs());
        service.rebuild().await.unwrap();
        assert_eq!(service.active().await.unwrap().snapshot_id, 1);

        service.rebuild().await.unwrap();
        assert_eq!(service.active().await.unwrap().snapshot_id, 2);
    }

    #[tokio::test]
    async fn test_empty_catalog_and_missing_index() {
        let (service, _) = service_over(Vec::new());
        assert!(matches!(
            service.rebuild().await,
            Err(ApiError::InvalidInput(_))
        ));
        assert!(matches!(
            service.search("hat", 3).await,
            Err(ApiError::IndexError(_))
        ));
    }

    fn sample_index() -> ActiveIndex {
        let index = FlatL2Index::from_embeddings(&[
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![5.0, 5.0],
        ])
        .unwrap();
        ActiveIndex::new(7, "test".into(), index, vec![(1, 10), (1, 11), (2, 20)]).unwrap()
    }

    #[test]
    fn test_search_resolves_pairs_in_distance_order() {
        let hits = sample_index().search(&[0.9, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].product_id, hits[0].variant_id), (1, 11));
        assert_eq!((hits[1].product_id, hits[1].variant_id), (1, 10));
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn test_position_outside_map_is_index_error() {
        let neighbors = [Neighbor {
            position: 3,
            distance: 0.5,
        }];
        let result = resolve_hits(&neighbors, &[(1, 10)]);
        assert!(matches!(result, Err(ApiError::IndexError(_))));
    }

    #[test]
    fn test_map_length_must_match_index() {
        let index = FlatL2Index::from_embeddings(&[vec![0.0, 1.0]]).unwrap();
        let result = ActiveIndex::new(1, "test".into(), index, vec![]);
        assert!(matches!(result, Err(ApiError::IndexError(_))));
    }

    #[test]
    fn test_snapshot_roundtrip_through_blob() {
        use crate::services::index_repository::SnapshotInfo;

        let index = FlatL2Index::from_embeddings(&[vec![0.0, 1.0], vec![2.0, 3.0]]).unwrap();
        let snapshot = StoredSnapshot {
            info: SnapshotInfo {
                id: 3,
                model_name: "all-minilm".into(),
                dimension: 2,
                vector_count: 2,
                inserted_at: chrono::Utc::now(),
            },
            blob: index.to_bytes().unwrap(),
            id_map: vec![(5, 50), (6, 60)],
        };

        let active = ActiveIndex::from_snapshot(snapshot).unwrap();
        assert_eq!(active.snapshot_id, 3);
        let hits = active.search(&[2.0, 3.0], 1).unwrap();
        assert_eq!((hits[0].product_id, hits[0].variant_id), (6, 60));
        assert_eq!(hits[0].distance, 0.0);
    }
}
