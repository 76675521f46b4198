//! In-process vector index backed by a hash map per project.

use super::{check_dimension, score_candidates, IndexError, IndexHit, IndexResult, VectorIndex};
use crate::model::memory::FragmentId;
use crate::model::project::ProjectId;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Partitions = HashMap<ProjectId, HashMap<FragmentId, Vec<f32>>>;

/// Brute-force cosine index kept entirely in memory.
pub struct InMemoryVectorIndex {
    dimension: usize,
    partitions: RwLock<Partitions>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self, project_id: ProjectId) -> IndexResult<RwLockReadGuard<'_, Partitions>> {
        self.partitions
            .read()
            .map_err(|_| IndexError::unavailable(Some(project_id), "index lock poisoned"))
    }

    fn write(&self, project_id: ProjectId) -> IndexResult<RwLockWriteGuard<'_, Partitions>> {
        self.partitions
            .write()
            .map_err(|_| IndexError::unavailable(Some(project_id), "index lock poisoned"))
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn upsert(
        &self,
        project_id: ProjectId,
        fragment_id: FragmentId,
        vector: &[f32],
    ) -> IndexResult<()> {
        check_dimension(self.dimension, vector)?;
        self.write(project_id)?
            .entry(project_id)
            .or_default()
            .insert(fragment_id, vector.to_vec());
        Ok(())
    }

    fn delete(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool> {
        let mut partitions = self.write(project_id)?;
        let Some(partition) = partitions.get_mut(&project_id) else {
            return Ok(false);
        };
        let removed = partition.remove(&fragment_id).is_some();
        if partition.is_empty() {
            partitions.remove(&project_id);
        }
        Ok(removed)
    }

    fn search(
        &self,
        project_id: ProjectId,
        query: &[f32],
        k: usize,
    ) -> IndexResult<Vec<IndexHit>> {
        check_dimension(self.dimension, query)?;
        let partitions = self.read(project_id)?;
        let Some(partition) = partitions.get(&project_id) else {
            return Ok(Vec::new());
        };
        Ok(score_candidates(
            query,
            partition.iter().map(|(id, vector)| (*id, vector.as_slice())),
            k,
        ))
    }

    fn contains(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool> {
        Ok(self
            .read(project_id)?
            .get(&project_id)
            .is_some_and(|partition| partition.contains_key(&fragment_id)))
    }

    fn ids(&self, project_id: ProjectId) -> IndexResult<Vec<FragmentId>> {
        let partitions = self.read(project_id)?;
        let mut ids: Vec<FragmentId> = partitions
            .get(&project_id)
            .map(|partition| partition.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    fn drop_project(&self, project_id: ProjectId) -> IndexResult<usize> {
        Ok(self
            .write(project_id)?
            .remove(&project_id)
            .map_or(0, |partition| partition.len()))
    }
}
