use std::collections::HashMap;

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector};
use tracing::warn;

use crate::mapping::MappingRegistry;
use crate::simulator::Simulator;

/// The three matrices recorded for one mapping across a rollout window.
#[derive(Debug, Clone)]
struct MappingColumns {
    poses: DMatrix<f64>,
    vels: DMatrix<f64>,
    forces: DMatrix<f64>,
}

/// A materialized trajectory: poses/velocities/forces for every registered
/// mapping over a fixed-length window of `T` timesteps, plus a mass vector
/// and string-keyed auxiliary metadata (§3).
#[derive(Debug, Clone)]
pub struct OwnedRollout {
    cols: usize,
    per_mapping: HashMap<String, MappingColumns>,
    masses: DVector<f64>,
    metadata: HashMap<String, DMatrix<f64>>,
}

impl OwnedRollout {
    /// Allocates a zero-filled rollout sized from every mapping currently
    /// registered, for a window of `cols` timesteps.
    pub fn new(registry: &MappingRegistry, sim: &dyn Simulator, cols: usize) -> Self {
        let mut per_mapping = HashMap::new();
        for name in registry.names() {
            let mapping = registry.get(name);
            per_mapping.insert(
                name.to_string(),
                MappingColumns {
                    poses: DMatrix::zeros(mapping.pos_dim(sim), cols),
                    vels: DMatrix::zeros(mapping.vel_dim(sim), cols),
                    forces: DMatrix::zeros(mapping.force_dim(sim), cols),
                },
            );
        }
        Self {
            cols,
            per_mapping,
            masses: DVector::zeros(sim.num_mass_params()),
            metadata: HashMap::new(),
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn columns(&self, name: &str) -> &MappingColumns {
        self.per_mapping
            .get(name)
            .unwrap_or_else(|| panic!("unknown mapping {name:?} — fatal program-contract violation"))
    }

    fn columns_mut(&mut self, name: &str) -> &mut MappingColumns {
        self.per_mapping
            .get_mut(name)
            .unwrap_or_else(|| panic!("unknown mapping {name:?} — fatal program-contract violation"))
    }

    pub fn poses(&self, name: &str) -> &DMatrix<f64> {
        &self.columns(name).poses
    }
    pub fn vels(&self, name: &str) -> &DMatrix<f64> {
        &self.columns(name).vels
    }
    pub fn forces(&self, name: &str) -> &DMatrix<f64> {
        &self.columns(name).forces
    }
    pub fn poses_mut(&mut self, name: &str) -> &mut DMatrix<f64> {
        &mut self.columns_mut(name).poses
    }
    pub fn vels_mut(&mut self, name: &str) -> &mut DMatrix<f64> {
        &mut self.columns_mut(name).vels
    }
    pub fn forces_mut(&mut self, name: &str) -> &mut DMatrix<f64> {
        &mut self.columns_mut(name).forces
    }

    pub fn masses(&self) -> &DVector<f64> {
        &self.masses
    }
    pub fn masses_mut(&mut self) -> &mut DVector<f64> {
        &mut self.masses
    }

    /// Missing metadata returns a zero matrix and emits a diagnostic — this
    /// is the one lookup-by-name failure that is *not* fatal (§7).
    pub fn metadata(&self, key: &str) -> DMatrix<f64> {
        self.metadata.get(key).cloned().unwrap_or_else(|| {
            warn!(key, "metadata lookup missed; returning zero matrix");
            DMatrix::zeros(0, 0)
        })
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: DMatrix<f64>) {
        self.metadata.insert(key.into(), value);
    }

    /// Duplicates every matrix by value.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    pub fn slice(&self, start: usize, len: usize) -> SlicedRollout<'_> {
        debug_assert!(
            start + len <= self.cols,
            "slice [{start}, {start}+{len}) exceeds rollout of {} columns",
            self.cols
        );
        SlicedRollout {
            backing: self,
            start,
            len,
        }
    }

    pub fn slice_mut(&mut self, start: usize, len: usize) -> SlicedRolloutMut<'_> {
        debug_assert!(
            start + len <= self.cols,
            "slice [{start}, {start}+{len}) exceeds rollout of {} columns",
            self.cols
        );
        SlicedRolloutMut {
            backing: self,
            start,
            len,
        }
    }
}

/// A lightweight, read-only borrowing view over a column range of a backing
/// rollout. Its lifetime must not exceed the backing rollout (§4.2). Write
/// entry points are deliberately absent from this type, rather than present
/// as invariant-violation stubs — see `DESIGN.md`'s resolution of the
/// corresponding Open Question in spec §9.
pub struct SlicedRollout<'a> {
    backing: &'a OwnedRollout,
    start: usize,
    len: usize,
}

impl<'a> SlicedRollout<'a> {
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn poses(&self, name: &str) -> DMatrixView<'_, f64> {
        self.backing.poses(name).columns(self.start, self.len)
    }
    pub fn vels(&self, name: &str) -> DMatrixView<'_, f64> {
        self.backing.vels(name).columns(self.start, self.len)
    }
    pub fn forces(&self, name: &str) -> DMatrixView<'_, f64> {
        self.backing.forces(name).columns(self.start, self.len)
    }
    pub fn masses(&self) -> &DVector<f64> {
        self.backing.masses()
    }
    pub fn metadata(&self, key: &str) -> DMatrix<f64> {
        self.backing.metadata(key)
    }
}

/// A mutable borrowing view over a column range of a backing rollout.
pub struct SlicedRolloutMut<'a> {
    backing: &'a mut OwnedRollout,
    start: usize,
    len: usize,
}

impl<'a> SlicedRolloutMut<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn poses(&self, name: &str) -> DMatrixView<'_, f64> {
        self.backing.poses(name).columns(self.start, self.len)
    }
    pub fn vels(&self, name: &str) -> DMatrixView<'_, f64> {
        self.backing.vels(name).columns(self.start, self.len)
    }
    pub fn forces(&self, name: &str) -> DMatrixView<'_, f64> {
        self.backing.forces(name).columns(self.start, self.len)
    }
    pub fn poses_mut(&mut self, name: &str) -> DMatrixViewMut<'_, f64> {
        self.backing.poses_mut(name).columns_mut(self.start, self.len)
    }
    pub fn vels_mut(&mut self, name: &str) -> DMatrixViewMut<'_, f64> {
        self.backing.vels_mut(name).columns_mut(self.start, self.len)
    }
    pub fn forces_mut(&mut self, name: &str) -> DMatrixViewMut<'_, f64> {
        self.backing.forces_mut(name).columns_mut(self.start, self.len)
    }
    pub fn masses(&self) -> &DVector<f64> {
        self.backing.masses()
    }
}

/// Tagged sum over the read-only rollout variants (§9: "one polymorphic
/// interface with three variants" rather than a trait object), used by
/// anything that consumes a rollout without caring whether it owns, slices,
/// or const-slices its backing storage.
pub enum Rollout<'a> {
    Owned(&'a OwnedRollout),
    Sliced(SlicedRollout<'a>),
}

impl<'a> Rollout<'a> {
    pub fn cols(&self) -> usize {
        match self {
            Rollout::Owned(r) => r.cols(),
            Rollout::Sliced(r) => r.len(),
        }
    }
    pub fn poses(&self, name: &str) -> DMatrixView<'_, f64> {
        match self {
            Rollout::Owned(r) => r.poses(name).columns(0, r.cols()),
            Rollout::Sliced(r) => r.poses(name),
        }
    }
    pub fn vels(&self, name: &str) -> DMatrixView<'_, f64> {
        match self {
            Rollout::Owned(r) => r.vels(name).columns(0, r.cols()),
            Rollout::Sliced(r) => r.vels(name),
        }
    }
    pub fn forces(&self, name: &str) -> DMatrixView<'_, f64> {
        match self {
            Rollout::Owned(r) => r.forces(name).columns(0, r.cols()),
            Rollout::Sliced(r) => r.forces(name),
        }
    }
    pub fn masses(&self) -> &DVector<f64> {
        match self {
            Rollout::Owned(r) => r.masses(),
            Rollout::Sliced(r) => r.masses(),
        }
    }
    pub fn metadata(&self, key: &str) -> DMatrix<f64> {
        match self {
            Rollout::Owned(r) => r.metadata(key),
            Rollout::Sliced(r) => r.metadata(key),
        }
    }
}

impl<'a> From<&'a OwnedRollout> for Rollout<'a> {
    fn from(r: &'a OwnedRollout) -> Self {
        Rollout::Owned(r)
    }
}

impl<'a> From<SlicedRollout<'a>> for Rollout<'a> {
    fn from(r: SlicedRollout<'a>) -> Self {
        Rollout::Sliced(r)
    }
}

/// Tagged sum over the writable rollout variants. The const-slice variant
/// has no counterpart here — see the Open Question resolution above.
pub enum RolloutMut<'a> {
    Owned(&'a mut OwnedRollout),
    Sliced(SlicedRolloutMut<'a>),
}

impl<'a> RolloutMut<'a> {
    pub fn poses_mut(&mut self, name: &str) -> DMatrixViewMut<'_, f64> {
        match self {
            RolloutMut::Owned(r) => {
                let cols = r.cols();
                r.poses_mut(name).columns_mut(0, cols)
            }
            RolloutMut::Sliced(r) => r.poses_mut(name),
        }
    }
    pub fn vels_mut(&mut self, name: &str) -> DMatrixViewMut<'_, f64> {
        match self {
            RolloutMut::Owned(r) => {
                let cols = r.cols();
                r.vels_mut(name).columns_mut(0, cols)
            }
            RolloutMut::Sliced(r) => r.vels_mut(name),
        }
    }
    pub fn forces_mut(&mut self, name: &str) -> DMatrixViewMut<'_, f64> {
        match self {
            RolloutMut::Owned(r) => {
                let cols = r.cols();
                r.forces_mut(name).columns_mut(0, cols)
            }
            RolloutMut::Sliced(r) => r.forces_mut(name),
        }
    }
}
