use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{DVector, Vector6};

use crate::simulator::{BodyPose, Simulator};

/// A named, invertible view over the simulator's state. Dimensions are
/// constant for the lifetime of a problem; reading a mapping is
/// deterministic given world state (§3).
pub trait Mapping: Send + Sync {
    fn name(&self) -> &str;
    fn pos_dim(&self, sim: &dyn Simulator) -> usize;
    fn vel_dim(&self, sim: &dyn Simulator) -> usize;
    fn force_dim(&self, sim: &dyn Simulator) -> usize;

    fn read_pos(&self, sim: &dyn Simulator) -> DVector<f64>;
    fn read_vel(&self, sim: &dyn Simulator) -> DVector<f64>;
    fn read_force(&self, sim: &dyn Simulator) -> DVector<f64>;

    fn write_pos(&self, sim: &mut dyn Simulator, pos: &DVector<f64>);
    fn write_vel(&self, sim: &mut dyn Simulator, vel: &DVector<f64>);
    fn write_force(&self, sim: &mut dyn Simulator, force: &DVector<f64>);

    /// Whether this mapping spans the simulator's full raw-DOF state. A
    /// reduced-dimension mapping is still usable for rollout recording and
    /// loss functions, but cannot be used as a shooting *representation*
    /// (see `DESIGN.md`'s resolution of the forceDim-vs-representation
    /// ambiguity in spec §4.4).
    fn is_full_state(&self, sim: &dyn Simulator) -> bool;
}

/// The required mapping: raw joint-space position/velocity/force vectors,
/// read and written with no transformation.
pub struct IdentityMapping;

impl Mapping for IdentityMapping {
    fn name(&self) -> &str {
        "identity"
    }
    fn pos_dim(&self, sim: &dyn Simulator) -> usize {
        sim.num_dofs()
    }
    fn vel_dim(&self, sim: &dyn Simulator) -> usize {
        sim.num_dofs()
    }
    fn force_dim(&self, sim: &dyn Simulator) -> usize {
        sim.num_dofs()
    }
    fn read_pos(&self, sim: &dyn Simulator) -> DVector<f64> {
        sim.positions()
    }
    fn read_vel(&self, sim: &dyn Simulator) -> DVector<f64> {
        sim.velocities()
    }
    fn read_force(&self, sim: &dyn Simulator) -> DVector<f64> {
        sim.forces()
    }
    fn write_pos(&self, sim: &mut dyn Simulator, pos: &DVector<f64>) {
        sim.set_positions(pos);
    }
    fn write_vel(&self, sim: &mut dyn Simulator, vel: &DVector<f64>) {
        sim.set_velocities(vel);
    }
    fn write_force(&self, sim: &mut dyn Simulator, force: &DVector<f64>) {
        sim.set_forces(force);
    }
    fn is_full_state(&self, _sim: &dyn Simulator) -> bool {
        true
    }
}

/// An inverse-kinematics mapping: a subset of body nodes, each contributing
/// a 6-dimensional spatial pose / velocity / wrench. Forward/inverse
/// kinematics themselves are pure functions supplied by the `Simulator`
/// (§1 Out of scope); this mapping only names which bodies participate.
pub struct IkMapping {
    mapping_name: String,
    bodies: Vec<String>,
}

impl IkMapping {
    pub fn new(mapping_name: impl Into<String>, bodies: Vec<String>) -> Self {
        Self {
            mapping_name: mapping_name.into(),
            bodies,
        }
    }

    fn pose_to_vec6(pose: &BodyPose) -> Vector6<f64> {
        Vector6::new(
            pose.translation.x,
            pose.translation.y,
            pose.translation.z,
            pose.euler_xyz.x,
            pose.euler_xyz.y,
            pose.euler_xyz.z,
        )
    }

    fn vec6_to_pose(v: nalgebra::VectorView6<f64>) -> BodyPose {
        BodyPose {
            translation: nalgebra::Vector3::new(v[0], v[1], v[2]),
            euler_xyz: nalgebra::Vector3::new(v[3], v[4], v[5]),
        }
    }
}

const DIM_PER_BODY: usize = 6;

impl Mapping for IkMapping {
    fn name(&self) -> &str {
        &self.mapping_name
    }
    fn pos_dim(&self, _sim: &dyn Simulator) -> usize {
        self.bodies.len() * DIM_PER_BODY
    }
    fn vel_dim(&self, _sim: &dyn Simulator) -> usize {
        self.bodies.len() * DIM_PER_BODY
    }
    fn force_dim(&self, _sim: &dyn Simulator) -> usize {
        self.bodies.len() * DIM_PER_BODY
    }

    fn read_pos(&self, sim: &dyn Simulator) -> DVector<f64> {
        let mut out = DVector::zeros(self.bodies.len() * DIM_PER_BODY);
        for (i, body) in self.bodies.iter().enumerate() {
            let pose = sim.forward_kinematics_pose(body);
            out.rows_mut(i * DIM_PER_BODY, DIM_PER_BODY)
                .copy_from(&Self::pose_to_vec6(&pose));
        }
        out
    }

    fn read_vel(&self, sim: &dyn Simulator) -> DVector<f64> {
        let mut out = DVector::zeros(self.bodies.len() * DIM_PER_BODY);
        for (i, body) in self.bodies.iter().enumerate() {
            let v = sim.ik_body_spatial_velocity(body);
            out.rows_mut(i * DIM_PER_BODY, DIM_PER_BODY).copy_from(&v);
        }
        out
    }

    fn read_force(&self, sim: &dyn Simulator) -> DVector<f64> {
        let mut out = DVector::zeros(self.bodies.len() * DIM_PER_BODY);
        for (i, body) in self.bodies.iter().enumerate() {
            let w = sim.ik_body_wrench(body);
            out.rows_mut(i * DIM_PER_BODY, DIM_PER_BODY).copy_from(&w);
        }
        out
    }

    fn write_pos(&self, sim: &mut dyn Simulator, pos: &DVector<f64>) {
        debug_assert_eq!(pos.len(), self.bodies.len() * DIM_PER_BODY);
        for (i, body) in self.bodies.iter().enumerate() {
            let pose = Self::vec6_to_pose(pos.fixed_rows::<6>(i * DIM_PER_BODY));
            sim.ik_set_body_pose(body, &pose);
        }
    }

    fn write_vel(&self, sim: &mut dyn Simulator, vel: &DVector<f64>) {
        debug_assert_eq!(vel.len(), self.bodies.len() * DIM_PER_BODY);
        for (i, body) in self.bodies.iter().enumerate() {
            let v: Vector6<f64> = vel.fixed_rows::<6>(i * DIM_PER_BODY).into_owned();
            sim.ik_set_body_spatial_velocity(body, &v);
        }
    }

    fn write_force(&self, sim: &mut dyn Simulator, force: &DVector<f64>) {
        debug_assert_eq!(force.len(), self.bodies.len() * DIM_PER_BODY);
        for (i, body) in self.bodies.iter().enumerate() {
            let w: Vector6<f64> = force.fixed_rows::<6>(i * DIM_PER_BODY).into_owned();
            sim.ik_set_body_wrench(body, &w);
        }
    }

    fn is_full_state(&self, sim: &dyn Simulator) -> bool {
        self.bodies.len() == sim.body_node_names().len()
            && self.bodies.iter().all(|b| sim.body_node_names().contains(b))
    }
}

/// Name-keyed lookup of mappings, plus a designated representation mapping
/// that dictates the vector space for start states and defect constraints
/// (§4.1). Kept as a registry rather than an inheritance hierarchy so new
/// mapping variants are swappable without touching the problem core (§9).
pub struct MappingRegistry {
    mappings: HashMap<String, Arc<dyn Mapping>>,
    representation: String,
}

impl MappingRegistry {
    pub fn new_with_identity() -> Self {
        let mut mappings: HashMap<String, Arc<dyn Mapping>> = HashMap::new();
        mappings.insert("identity".to_string(), Arc::new(IdentityMapping));
        Self {
            mappings,
            representation: "identity".to_string(),
        }
    }

    pub fn register(&mut self, mapping: Arc<dyn Mapping>) {
        self.mappings.insert(mapping.name().to_string(), mapping);
    }

    pub fn get(&self, name: &str) -> Arc<dyn Mapping> {
        self.mappings
            .get(name)
            .unwrap_or_else(|| panic!("unknown mapping {name:?} — missing mappings are a fatal program-contract violation"))
            .clone()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(String::as_str)
    }

    pub fn representation_name(&self) -> &str {
        &self.representation
    }

    pub fn representation(&self) -> Arc<dyn Mapping> {
        self.get(&self.representation)
    }

    /// Switches the representation mapping. For every time column already
    /// materialized by a caller this is a pure relabeling of future problem
    /// construction; switching does not retroactively rewrite existing
    /// rollouts. Warning (§4.1): if the new mapping has strictly lower
    /// intrinsic dimension than the old one, information is lost and the
    /// operation is not guaranteed to round-trip.
    ///
    /// Unlike `unroll`/JSON emission, this mutation is *not* scoped: the
    /// world is meant to end up in the newly-read-out state, not restored.
    pub fn switch_representation(&mut self, sim: &mut dyn Simulator, new_name: &str) {
        let new_mapping = self.get(new_name);

        // The world already holds the old mapping's coordinates; read the
        // same world state back out through the new mapping and write it
        // back in (a round trip through the new coordinate system).
        let new_pos = new_mapping.read_pos(sim);
        let new_vel = new_mapping.read_vel(sim);
        let new_force = new_mapping.read_force(sim);
        new_mapping.write_pos(sim, &new_pos);
        new_mapping.write_vel(sim, &new_vel);
        new_mapping.write_force(sim, &new_force);

        self.representation = new_name.to_string();
    }
}
