//! Exact nearest-neighbor index over squared L2 distance.
//!
//! Positions are assigned in insertion order and never change, so a search
//! result position can be resolved through the id map that was written
//! alongside the index.

use crate::error::{ApiError, Result};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dimension: usize,
    vectors: Array2<f32>,
}

/// On-disk (in-database) shape of the index blob.
#[derive(Serialize, Deserialize)]
struct StoredIndex {
    version: u32,
    dimension: usize,
    count: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(ApiError::IndexError(
                "Index dimension must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            dimension,
            vectors: Array2::zeros((0, dimension)),
        })
    }

    /// Build an index from embeddings, taking the dimension from the first one.
    pub fn from_embeddings(embeddings: &[Vec<f32>]) -> Result<Self> {
        let dimension = embeddings
            .first()
            .map(Vec::len)
            .ok_or_else(|| ApiError::IndexError("No embeddings to index".to_string()))?;

        let mut index = Self::new(dimension)?;
        index.add(embeddings)?;
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, embeddings: &[Vec<f32>]) -> Result<()> {
        for (offset, embedding) in embeddings.iter().enumerate() {
            if embedding.len() != self.dimension {
                return Err(ApiError::IndexError(format!(
                    "Embedding {} has dimension {}, index expects {}",
                    self.len() + offset,
                    embedding.len(),
                    self.dimension
                )));
            }
        }

        for embedding in embeddings {
            self.vectors.push_row(ArrayView1::from(embedding.as_slice()))?;
        }

        Ok(())
    }

    /// The `k` nearest stored vectors, closest first. Equal distances are
    /// ordered by position.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(ApiError::IndexError(format!(
                "Query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }

        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let query = ArrayView1::from(query);
        let mut neighbors: Vec<Neighbor> = self
            .vectors
            .rows()
            .into_iter()
            .enumerate()
            .map(|(position, row)| {
                let distance = row
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>();
                Neighbor { position, distance }
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        neighbors.truncate(k);

        Ok(neighbors)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let stored = StoredIndex {
            version: FORMAT_VERSION,
            dimension: self.dimension,
            count: self.len(),
            data: self.vectors.iter().copied().collect(),
        };

        let mut out = Vec::with_capacity(stored.data.len() * 5 + 32);
        ciborium::ser::into_writer(&stored, &mut out)
            .map_err(|e| ApiError::SerializationError(format!("Failed to encode index: {}", e)))?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let stored: StoredIndex = ciborium::de::from_reader(bytes)
            .map_err(|e| ApiError::IndexError(format!("Failed to decode index blob: {}", e)))?;

        if stored.version != FORMAT_VERSION {
            return Err(ApiError::IndexError(format!(
                "Unsupported index format version {}",
                stored.version
            )));
        }

        if stored.dimension == 0 || stored.data.len() != stored.dimension * stored.count {
            return Err(ApiError::IndexError(format!(
                "Index blob holds {} values, expected {} x {}",
                stored.data.len(),
                stored.count,
                stored.dimension
            )));
        }

        let vectors = Array2::from_shape_vec((stored.count, stored.dimension), stored.data)?;
        Ok(Self {
            dimension: stored.dimension,
            vectors,
        })
    }
}
