//! Fuel flow simulation. Predicts thrust, ISP, burn time and delta-v of
//! every stage by draining propellant through the part graph one stage
//! at a time, before any stage is actually activated.

use std::collections::BTreeSet;

use color_eyre::eyre::{self, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    resource::{ResourceId, ResourceTable},
    vessel::{PartId, Vessel},
};

pub mod engine;
pub mod graph;
pub mod stage;

pub use engine::Engine;
pub use graph::{ActiveEngine, SimPart, SimVessel, SupplySet};
pub use stage::{rollup, StageResult};

pub const G0: f64 = 9.80665;

/// Simulation conditions and drain loop tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    /// Surface gravity used for thrust-to-weight (m/s^2)
    pub gravity: f64,
    /// Ambient pressure for ISP in atmospheres, 0 for vacuum.
    pub atm_pressure: f64,
    /// Amount at or below which a tank counts as drained.
    pub empty_threshold: f64,
    /// Drain steps allowed per stage before giving up on it.
    pub max_iterations: usize,
    /// Use the vector sum of thrust transforms instead of scalar thrust.
    pub cosine_losses: bool,
    /// Log every drain step.
    pub verbose: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            gravity: 9.81,
            atm_pressure: 0.0,
            empty_threshold: 0.01,
            max_iterations: 1000,
            cosine_losses: false,
            verbose: false,
        }
    }
}

impl Environment {
    /// Rejects conditions the drain loop cannot make progress under.
    pub fn validate(&self) -> eyre::Result<()> {
        if !self.empty_threshold.is_finite() || self.empty_threshold < 0.0 {
            bail!("Invalid empty threshold {}", self.empty_threshold);
        }
        if !self.gravity.is_finite() || self.gravity <= 0.0 {
            bail!("Invalid gravity {}", self.gravity);
        }
        if !self.atm_pressure.is_finite() || self.atm_pressure < 0.0 {
            bail!("Invalid atmospheric pressure {}", self.atm_pressure);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DrainStep {
    pub dt: f64,
    pub mass_before: f64,
    pub mass_after: f64,
    pub delta_v: f64,
}

/// Runs the stage loop over one snapshot of a vessel.
pub struct StageSimulator<'a> {
    table: &'a ResourceTable,
    env: &'a Environment,
    vessel: SimVessel,
    top_stage: i32,
}

impl<'a> StageSimulator<'a> {
    pub fn new(
        vessel: &Vessel,
        table: &'a ResourceTable,
        env: &'a Environment,
    ) -> eyre::Result<Self> {
        env.validate()?;
        let top_stage = vessel.top_stage();
        Ok(Self {
            table,
            env,
            vessel: SimVessel::build(vessel, table, env, top_stage)?,
            top_stage,
        })
    }

    /// Simulates every stage from the top down to 0. The results are
    /// ordered by ascending stage number and rolled up.
    pub fn run(mut self) -> Vec<StageResult> {
        let mut stages = Vec::with_capacity(self.top_stage as usize + 1);
        for stage in (0..=self.top_stage).rev() {
            let result = self.simulate_stage(stage);
            debug!(
                stage,
                delta_v = result.delta_v,
                burn_time = result.burn_time,
                thrust = result.thrust,
                "stage simulated"
            );
            stages.push(result);
            self.fire_stage(stage);
        }
        stages.reverse();
        rollup(&mut stages);
        stages
    }

    fn active_engines(&self, stage: i32) -> Vec<ActiveEngine> {
        self.vessel
            .active_engines(stage, self.table, self.env.empty_threshold)
    }

    fn boundary_parts(&self, stage: i32) -> impl Iterator<Item = (PartId, &SimPart)> {
        self.vessel
            .parts
            .iter()
            .filter(move |(_, x)| x.decoupled_in_stage == stage - 1)
    }

    /// Thrust and mass flow of `active`.
    fn thrust_and_flow(&self, active: &[ActiveEngine]) -> (f64, f64) {
        let engines = move || active.iter().map(move |x| &self.vessel.engines[x.engine]);
        let thrust = if self.env.cosine_losses {
            engines()
                .map(Engine::vector_thrust)
                .sum::<nalgebra::Vector3<f64>>()
                .norm()
        } else {
            engines().fold(0.0, |acc, x| acc + x.thrust())
        };
        let flow = engines().fold(0.0, |acc, x| acc + x.mass_flow_rate);
        (thrust, flow)
    }

    fn simulate_stage(&mut self, stage: i32) -> StageResult {
        let mut active = self.active_engines(stage);

        let start_mass = self.vessel.mass(self.table);
        let (thrust, flow) = self.thrust_and_flow(&active);
        let (mass, cost) = self
            .boundary_parts(stage)
            .fold((0.0, 0.0), |(mass, cost), (_, part)| {
                (mass + part.mass(self.table), cost + part.cost(self.table))
            });

        let mut result = StageResult {
            stage_number: stage,
            cost,
            mass,
            start_mass,
            thrust,
            isp: if flow > 0.0 { thrust / (G0 * flow) } else { 0.0 },
            thrust_to_weight: ratio(thrust, start_mass * self.env.gravity),
            ..StageResult::default()
        };

        let mut iterations = 0;
        while !self.allowed_to_stage(stage, &active) {
            if iterations == self.env.max_iterations {
                warn!(
                    stage,
                    iterations, "drain loop did not converge, stage figures are partial"
                );
                result.drain_capped = true;
                break;
            }
            iterations += 1;

            let step = self.drain_step(&active);
            if self.env.verbose {
                debug!(
                    stage,
                    iteration = iterations,
                    dt = step.dt,
                    mass_before = step.mass_before,
                    mass_after = step.mass_after,
                    delta_v = step.delta_v,
                    engines = active.len(),
                    "drain step"
                );
            }
            result.burn_time += step.dt;
            result.delta_v += step.delta_v;

            active = self.active_engines(stage);
        }
        self.vessel.clear_drains();

        result.end_mass = self.vessel.mass(self.table);
        result.max_thrust_to_weight = ratio(thrust, result.end_mass * self.env.gravity);
        result
    }

    /// Drains the supply of `active` until the first drained tank runs
    /// out.
    pub fn drain_step(&mut self, active: &[ActiveEngine]) -> DrainStep {
        self.vessel.set_drains(active);
        let dt = self.vessel.time_to_drain();
        let dt = if dt.is_finite() { dt } else { 0.0 };

        let mass_before = self.vessel.mass(self.table);
        self.vessel.apply_drains(dt);
        let mass_after = self.vessel.mass(self.table);

        let (thrust, flow) = self.thrust_and_flow(active);
        let delta_v = if flow > 0.0 && mass_before > mass_after && mass_after > 0.0 {
            thrust / flow * libm::log(mass_before / mass_after)
        } else {
            0.0
        };

        DrainStep {
            dt,
            mass_before,
            mass_after,
            delta_v,
        }
    }

    /// Whether the burn of `stage` is over: nothing is thrusting, or every
    /// part dropped at its end is out of the propellants still being
    /// burned and hosts no running engine.
    pub fn allowed_to_stage(&self, stage: i32, active: &[ActiveEngine]) -> bool {
        if active.is_empty() {
            return true;
        }

        let burning: BTreeSet<ResourceId> = active
            .iter()
            .flat_map(|x| x.supply.iter().map(|(res, _, _)| *res))
            .collect();
        let engine_parts: BTreeSet<PartId> = active
            .iter()
            .map(|x| self.vessel.engines[x.engine].part)
            .collect();

        self.boundary_parts(stage)
            .filter(|(_, part)| !part.is_sepratron)
            .all(|(id, part)| {
                !engine_parts.contains(&id)
                    && part
                        .resources
                        .is_effectively_empty_of(burning.iter().copied(), self.env.empty_threshold)
            })
    }

    /// Drops the parts that separate once `stage` is done.
    pub fn fire_stage(&mut self, stage: i32) {
        let names: Vec<_> = self
            .boundary_parts(stage)
            .map(|(_, part)| part.name.clone())
            .collect();
        self.vessel
            .remove_parts(|part| part.decoupled_in_stage == stage - 1);
        debug!(stage, parts = ?names, "stage fired");
    }
}

fn ratio(x: f64, y: f64) -> f64 {
    if y > 0.0 {
        x / y
    } else {
        0.0
    }
}

/// Builds a snapshot of `vessel` and runs the stage loop over it.
pub fn simulate(
    vessel: &Vessel,
    table: &ResourceTable,
    env: &Environment,
) -> eyre::Result<Vec<StageResult>> {
    Ok(StageSimulator::new(vessel, table, env)?.run())
}
