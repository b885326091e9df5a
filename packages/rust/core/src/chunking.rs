//! Deterministic partitioning of stale keys into chunks.
//!
//! Chunks are contiguous slices of the stale-key sequence in its natural
//! order. Each carries the criteria a worker hands to extraction so that it
//! sees exactly its own keys, plus a fingerprint that lets a coordinator
//! confirm two planners produced the same split.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use matbuild_shared::{Criteria, Key, MatbuildError, Result};

/// One unit of distributable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the plan (0-based).
    pub index: usize,
    /// Number of chunks in the plan.
    pub total: usize,
    /// Keys owned by this chunk, in stale-key order.
    pub keys: Vec<Key>,
    /// `key_field ∈ keys`.
    pub criteria: Criteria,
    /// SHA-256 over the chunk's keys.
    pub fingerprint: String,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The full partition of a stale-key set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.chunks.iter().map(Chunk::len).collect()
    }

    /// The chunk a given worker should process.
    pub fn select(&self, index: usize) -> Result<&Chunk> {
        self.chunks.get(index).ok_or_else(|| {
            MatbuildError::chunk_planning(format!(
                "chunk index {index} out of range for a plan of {} chunks",
                self.chunks.len()
            ))
        })
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }
}

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Split `keys` into at most `n` chunks of `ceil(len / n)` keys; the last
    /// chunk takes the remainder. `n == 0` or no keys yields an empty plan.
    pub fn plan(keys: &[Key], n: usize, key_field: &str) -> Result<ChunkPlan> {
        if key_field.trim().is_empty() {
            return Err(MatbuildError::chunk_planning("key field name is empty"));
        }
        if n == 0 || keys.is_empty() {
            return Ok(ChunkPlan::default());
        }

        let size = keys.len().div_ceil(n);
        let slices: Vec<&[Key]> = keys.chunks(size).collect();
        let total = slices.len();

        let chunks = slices
            .into_iter()
            .enumerate()
            .map(|(index, slice)| Chunk {
                index,
                total,
                keys: slice.to_vec(),
                criteria: Criteria::is_in(key_field, slice.iter().map(Key::to_value).collect()),
                fingerprint: fingerprint(slice),
            })
            .collect();

        tracing::debug!(keys = keys.len(), requested = n, total, size, "chunks planned");
        Ok(ChunkPlan { chunks })
    }
}

/// Stable digest of a key sequence.
pub fn fingerprint(keys: &[Key]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.to_value().to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matbuild_shared::Record;
    use serde_json::json;

    fn keys(n: usize) -> Vec<Key> {
        (1..=n).map(|i| Key::from(format!("k{i}"))).collect()
    }

    #[test]
    fn ten_keys_three_chunks() {
        let plan = ChunkPlanner::plan(&keys(10), 3, "task_id").unwrap();
        assert_eq!(plan.sizes(), vec![4, 4, 2]);
        assert!(plan.chunks.iter().all(|c| c.total == 3));
        assert_eq!(plan.chunks[2].keys, vec![Key::from("k9"), Key::from("k10")]);
    }

    #[test]
    fn chunks_are_disjoint_and_cover_input() {
        let input = keys(17);
        for n in 1..=20 {
            let plan = ChunkPlanner::plan(&input, n, "task_id").unwrap();
            assert!(plan.len() <= n);
            let flat: Vec<Key> = plan.chunks.iter().flat_map(|c| c.keys.clone()).collect();
            assert_eq!(flat, input, "n = {n}");
        }
    }

    #[test]
    fn fewer_keys_than_chunks() {
        let plan = ChunkPlanner::plan(&keys(2), 5, "task_id").unwrap();
        assert_eq!(plan.sizes(), vec![1, 1]);
    }

    #[test]
    fn empty_inputs() {
        assert!(ChunkPlanner::plan(&[], 4, "task_id").unwrap().is_empty());
        assert!(ChunkPlanner::plan(&keys(3), 0, "task_id").unwrap().is_empty());
    }

    #[test]
    fn invalid_arguments() {
        let err = ChunkPlanner::plan(&keys(3), 2, " ").unwrap_err();
        assert!(matches!(err, MatbuildError::ChunkPlanning { .. }));

        let plan = ChunkPlanner::plan(&keys(3), 2, "task_id").unwrap();
        assert!(plan.select(1).is_ok());
        assert!(matches!(plan.select(2), Err(MatbuildError::ChunkPlanning { .. })));
    }

    #[test]
    fn criteria_selects_exactly_the_chunk() {
        let plan = ChunkPlanner::plan(&keys(5), 2, "task_id").unwrap();
        let chunk = plan.select(0).unwrap();
        let inside = Record::from_value(json!({"task_id": "k2"})).unwrap();
        let outside = Record::from_value(json!({"task_id": "k4"})).unwrap();
        assert!(chunk.criteria.matches(&inside));
        assert!(!chunk.criteria.matches(&outside));
    }

    #[test]
    fn replanning_is_deterministic() {
        let a = ChunkPlanner::plan(&keys(9), 4, "task_id").unwrap();
        let b = ChunkPlanner::plan(&keys(9), 4, "task_id").unwrap();
        assert_eq!(a, b);
        assert_ne!(a.chunks[0].fingerprint, a.chunks[1].fingerprint);
    }
}
