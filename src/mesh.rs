//! Minimal mesh/vertex-partition facts.
//!
//! Mesh geometry, connectivity, and spatial mapping are external
//! collaborators. This module carries only the opaque facts the core needs:
//! how many vertices a mesh has (to size value vectors) and, for
//! distributed runs, the vertex offset table a process group's M2N
//! partition and L2-norm reduction rely on.

use crate::MeshId;

/// A mesh, known to the core only by id, vertex count, and (for distributed
/// runs) a partition of those vertices across ranks.
#[derive(Debug, Clone)]
pub struct Mesh {
    id: MeshId,
    vertex_count: usize,
    /// Exclusive prefix-sum of per-rank vertex counts; rank `r` owns vertices
    /// `[vertex_offsets[r], vertex_offsets[r + 1])`. Length `ranks + 1`.
    vertex_offsets: Vec<usize>,
}

impl Mesh {
    /// A single-rank mesh with `vertex_count` vertices.
    pub fn new(id: MeshId, vertex_count: usize) -> Self {
        Self {
            id,
            vertex_count,
            vertex_offsets: vec![0, vertex_count],
        }
    }

    /// A mesh partitioned across several ranks.
    pub fn partitioned(id: MeshId, vertex_offsets: Vec<usize>) -> Self {
        let vertex_count = *vertex_offsets.last().unwrap_or(&0);
        Self {
            id,
            vertex_count,
            vertex_offsets,
        }
    }

    /// The mesh id.
    pub fn id(&self) -> MeshId {
        self.id
    }

    /// Total vertex count across all ranks.
    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// The exclusive prefix-sum of per-rank vertex counts.
    pub fn vertex_offsets(&self) -> &[usize] {
        &self.vertex_offsets
    }

    /// Number of ranks this mesh is partitioned across.
    pub fn rank_count(&self) -> usize {
        self.vertex_offsets.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_rank_mesh_offsets() {
        let m = Mesh::new(MeshId(0), 10);
        assert_eq!(m.vertex_count(), 10);
        assert_eq!(m.rank_count(), 1);
    }

    #[test]
    fn partitioned_mesh_total_is_last_offset() {
        let m = Mesh::partitioned(MeshId(1), vec![0, 4, 10, 12]);
        assert_eq!(m.vertex_count(), 12);
        assert_eq!(m.rank_count(), 3);
    }
}
