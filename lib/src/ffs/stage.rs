use serde::{Deserialize, Serialize};

/// Predicted performance of one stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_number: i32,

    /// Cost of the parts dropped when this stage is done, at ignition.
    pub cost: f64,
    /// Mass of the parts dropped when this stage is done, at ignition
    /// (tons).
    pub mass: f64,
    /// Vessel mass at ignition (tons)
    pub start_mass: f64,
    /// Vessel mass at burnout (tons)
    pub end_mass: f64,

    /// Thrust of all active engines at ignition (kN)
    pub thrust: f64,
    /// Flow-weighted specific impulse at ignition (s)
    pub isp: f64,
    pub thrust_to_weight: f64,
    /// Thrust-to-weight at burnout.
    pub max_thrust_to_weight: f64,
    /// m/s
    pub delta_v: f64,
    /// s
    pub burn_time: f64,

    pub total_cost: f64,
    pub total_mass: f64,
    pub total_delta_v: f64,
    pub total_burn_time: f64,
    /// Delta-v of this stage and every stage fired after it.
    pub inverse_total_delta_v: f64,

    /// The drain loop hit its iteration limit before the stage could
    /// fire, so the figures are partial.
    pub drain_capped: bool,
}

/// Fills in the cumulative fields of `stages`, which must be ordered by
/// ascending stage number.
pub fn rollup(stages: &mut [StageResult]) {
    let (mut cost, mut mass, mut delta_v, mut burn_time) = (0.0, 0.0, 0.0, 0.0);
    for stage in stages.iter_mut() {
        cost += stage.cost;
        mass += stage.mass;
        delta_v += stage.delta_v;
        burn_time += stage.burn_time;
        stage.total_cost = cost;
        stage.total_mass = mass;
        stage.total_delta_v = delta_v;
        stage.total_burn_time = burn_time;
    }

    let mut remaining = 0.0;
    for stage in stages.iter_mut().rev() {
        remaining += stage.delta_v;
        stage.inverse_total_delta_v = remaining;
    }
}
