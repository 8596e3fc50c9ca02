use serde_json::{Map, Value, json};

use crate::rollout::Rollout;
use crate::simulator::{ScopedSimulatorState, Simulator};

/// Emits the external Rollout JSON format (§6): one key per body-node name,
/// each holding `pos_x/pos_y/pos_z/rot_x/rot_y/rot_z` arrays of length `T`,
/// computed by replaying the identity-mapping position columns through
/// forward kinematics. Scopes a simulator state restoration, so the world
/// the caller sees afterward is unchanged.
pub fn emit_rollout_json(sim: &mut dyn Simulator, rollout: &Rollout<'_>) -> Value {
    let identity_positions = rollout.poses("identity");
    let cols = rollout.cols();

    let mut guard = ScopedSimulatorState::new(sim);
    let mut bodies: Map<String, Value> = Map::new();

    for body in guard.sim().body_node_names().to_vec() {
        bodies.insert(
            body.clone(),
            json!({
                "pos_x": Vec::<f64>::with_capacity(cols),
                "pos_y": Vec::<f64>::with_capacity(cols),
                "pos_z": Vec::<f64>::with_capacity(cols),
                "rot_x": Vec::<f64>::with_capacity(cols),
                "rot_y": Vec::<f64>::with_capacity(cols),
                "rot_z": Vec::<f64>::with_capacity(cols),
            }),
        );
    }

    for t in 0..cols {
        let pos_t = identity_positions.column(t).into_owned();
        guard.sim_mut().set_positions(&pos_t);

        for body in guard.sim().body_node_names().to_vec() {
            let pose = guard.sim().forward_kinematics_pose(&body);
            let entry = bodies.get_mut(&body).expect("body registered above");
            push(entry, "pos_x", pose.translation.x);
            push(entry, "pos_y", pose.translation.y);
            push(entry, "pos_z", pose.translation.z);
            push(entry, "rot_x", pose.euler_xyz.x);
            push(entry, "rot_y", pose.euler_xyz.y);
            push(entry, "rot_z", pose.euler_xyz.z);
        }
    }

    Value::Object(bodies)
}

fn push(entry: &mut Value, key: &str, value: f64) {
    entry[key]
        .as_array_mut()
        .expect("emit_rollout_json initializes every key as an array")
        .push(json!(value));
}
