use std::collections::BTreeMap;

use color_eyre::eyre;
use nalgebra::Vector3;

use super::{Environment, G0};
use crate::{
    math::H1,
    resource::{ResourceId, ResourceTable},
    vessel::{EngineModule, LiveState, Part, PartId},
};

/// Lowest flow rate a landed engine reports, so an idle throttle on the
/// pad does not read as a dead engine.
const LANDED_MIN_FLOW: f64 = 1e-6;

/// One propulsion module on a part, with its thrust, ISP and consumption
/// evaluated for the simulation conditions.
#[derive(Clone, Debug, PartialEq)]
pub struct Engine {
    pub part: PartId,
    pub inverse_stage: i32,
    pub is_sepratron: bool,

    /// kN.
    pub max_thrust: f64,
    /// 0 if the engine is disabled, else thrust percentage / 100.
    pub throttle_limiter: f64,
    pub throttle_locked: bool,
    pub requested_thrust: f64,
    pub atmosphere_curve: H1,
    /// Non-free propellants and their mix ratios.
    pub propellants: Vec<(ResourceId, f64)>,
    pub thrust_transforms: Vec<(Vector3<f64>, f64)>,

    pub isp: f64,
    /// Tons per second.
    pub mass_flow_rate: f64,
    /// Units per second of each propellant.
    pub resource_consumptions: BTreeMap<ResourceId, f64>,
}

impl Engine {
    /// Builds the models for the engine modules of `part` that are usable
    /// in its active mode.
    pub fn new(id: PartId, part: &Part, table: &ResourceTable) -> eyre::Result<Vec<Self>> {
        part.engines
            .iter()
            .filter(|module| {
                module.mode.is_none() || module.mode.as_deref() == part.active_mode.as_deref()
            })
            .map(|module| Self::from_module(id, part, module, table))
            .collect()
    }

    fn from_module(
        id: PartId,
        part: &Part,
        module: &EngineModule,
        table: &ResourceTable,
    ) -> eyre::Result<Self> {
        let mut propellants = vec![];
        for propellant in &module.propellants {
            let res = table.resolve(&propellant.resource)?;
            if table.is_free(res) || propellant.ratio <= 0.0 {
                continue;
            }
            propellants.push((res, propellant.ratio));
        }

        let atmosphere_curve = module
            .atmosphere_curve
            .iter()
            .fold(H1::new(), |mut curve, key| {
                match key.tangents {
                    Some((in_tangent, out_tangent)) => {
                        curve.add_with_tangents(key.pressure, key.isp, in_tangent, out_tangent);
                    }
                    None => curve.add(key.pressure, key.isp),
                }
                curve
            });

        let thrust_transforms = module
            .thrust_transforms
            .iter()
            .map(|x| {
                let [dx, dy, dz] = x.direction;
                let direction = Vector3::new(dx, dy, dz);
                let direction = direction.try_normalize(0.0).unwrap_or_else(Vector3::z);
                (direction, x.multiplier)
            })
            .collect();

        Ok(Self {
            part: id,
            inverse_stage: part.inverse_stage,
            is_sepratron: part.is_sepratron,
            max_thrust: module.max_thrust,
            throttle_limiter: if module.enabled {
                module.thrust_percentage / 100.0
            } else {
                0.0
            },
            throttle_locked: module.throttle_locked,
            requested_thrust: module.requested_thrust,
            atmosphere_curve,
            propellants,
            thrust_transforms,
            isp: 0.0,
            mass_flow_rate: 0.0,
            resource_consumptions: BTreeMap::new(),
        })
    }

    /// Evaluates ISP, flow rate and consumption. `live` is the flight
    /// state of an already flying vessel, `static_pressure` the pressure
    /// at the hosting part.
    pub fn update(
        &mut self,
        env: &Environment,
        live: Option<LiveState>,
        static_pressure: f64,
        table: &ResourceTable,
    ) {
        self.resource_consumptions.clear();
        self.mass_flow_rate = 0.0;

        self.isp = self.atmosphere_curve.evaluate(if live.is_some() {
            static_pressure
        } else {
            env.atm_pressure
        });
        if self.isp <= 0.0 || !self.isp.is_finite() {
            self.isp = 0.0;
            return;
        }

        let exhaust_velocity = self.isp * G0;
        self.mass_flow_rate = match live {
            Some(live) if !self.throttle_locked => {
                if live.landed {
                    (self.rated_thrust() * live.main_throttle / exhaust_velocity)
                        .max(LANDED_MIN_FLOW)
                } else {
                    self.requested_thrust / exhaust_velocity
                }
            }
            _ => self.rated_thrust() / exhaust_velocity,
        };

        self.set_consumption_rates(table);
    }

    fn set_consumption_rates(&mut self, table: &ResourceTable) {
        let total_density: f64 = self
            .propellants
            .iter()
            .map(|&(res, ratio)| ratio * table.density(res))
            .sum();

        if total_density <= 0.0 {
            return;
        }

        let volume_flow_rate = self.mass_flow_rate / total_density;
        for &(res, ratio) in &self.propellants {
            *self.resource_consumptions.entry(res).or_insert(0.0) += ratio * volume_flow_rate;
        }
    }

    pub fn rated_thrust(&self) -> f64 {
        self.max_thrust * self.throttle_limiter
    }

    /// Thrust at the current flow rate, or the rated thrust at the current
    /// limiter if the engine is not flowing.
    pub fn thrust(&self) -> f64 {
        let actual = self.mass_flow_rate * self.isp * G0;
        if actual > 0.0 {
            actual
        } else {
            self.rated_thrust()
        }
    }

    /// [`Self::thrust`] split over the thrust transforms.
    pub fn vector_thrust(&self) -> Vector3<f64> {
        let thrust = self.thrust();
        self.thrust_transforms
            .iter()
            .map(|(direction, multiplier)| direction * (thrust * multiplier))
            .sum()
    }

    /// Can this engine run at all, given fuel?
    pub fn is_operational(&self) -> bool {
        self.mass_flow_rate > 0.0 && !self.resource_consumptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vessel::{CurveKey, Propellant, ThrustTransform};

    fn terrier() -> Part {
        Part {
            name: "terrier".into(),
            dry_mass: 0.5,
            engines: vec![EngineModule {
                mode: None,
                max_thrust: 60.0,
                thrust_percentage: 100.0,
                enabled: true,
                throttle_locked: false,
                requested_thrust: 30.0,
                atmosphere_curve: vec![
                    CurveKey {
                        pressure: 0.0,
                        isp: 345.0,
                        tangents: None,
                    },
                    CurveKey {
                        pressure: 1.0,
                        isp: 85.0,
                        tangents: None,
                    },
                ],
                propellants: vec![
                    Propellant {
                        resource: "LiquidFuel".into(),
                        ratio: 0.9,
                    },
                    Propellant {
                        resource: "Oxidizer".into(),
                        ratio: 1.1,
                    },
                    Propellant {
                        resource: "ElectricCharge".into(),
                        ratio: 0.5,
                    },
                ],
                thrust_transforms: vec![ThrustTransform::default()],
            }],
            ..Part::default()
        }
    }

    fn engine(part: &Part, env: &Environment, live: Option<LiveState>) -> Engine {
        let table = ResourceTable::stock();
        let mut engines = Engine::new(PartId(0), part, &table).unwrap();
        assert_eq!(engines.len(), 1);
        let mut engine = engines.remove(0);
        engine.update(env, live, part.static_pressure, &table);
        engine
    }

    #[test]
    fn vacuum_prediction() {
        let env = Environment::default();
        let engine = engine(&terrier(), &env, None);
        let table = ResourceTable::stock();
        let lf = table.resolve("LiquidFuel").unwrap();
        let ox = table.resolve("Oxidizer").unwrap();

        assert_eq!(engine.isp, 345.0);
        let flow = 60.0 / (345.0 * G0);
        assert!((engine.mass_flow_rate - flow).abs() < 1e-12);
        assert!((engine.thrust() - 60.0).abs() < 1e-9);

        // electric charge is free and not consumed
        assert_eq!(engine.resource_consumptions.len(), 2);
        let mass_rate = engine.resource_consumptions[&lf] * 0.005
            + engine.resource_consumptions[&ox] * 0.005;
        assert!((mass_rate - flow).abs() < 1e-12);
        assert!(
            (engine.resource_consumptions[&ox] / engine.resource_consumptions[&lf] - 1.1 / 0.9)
                .abs()
                < 1e-12
        );
    }

    #[test]
    fn limiter_and_disabled() {
        let env = Environment::default();
        let mut part = terrier();
        part.engines[0].thrust_percentage = 50.0;
        let limited = engine(&part, &env, None);
        assert!((limited.thrust() - 30.0).abs() < 1e-9);

        part.engines[0].enabled = false;
        let disabled = engine(&part, &env, None);
        assert_eq!(disabled.mass_flow_rate, 0.0);
        assert_eq!(disabled.thrust(), 0.0);
        assert!(!disabled.is_operational());
    }

    #[test]
    fn live_uses_requested_thrust_and_static_pressure() {
        let env = Environment::default();
        let mut part = terrier();
        part.static_pressure = 1.0;
        let live = LiveState {
            landed: false,
            main_throttle: 0.5,
        };
        let engine = engine(&part, &env, Some(live));

        assert_eq!(engine.isp, 85.0);
        assert!((engine.mass_flow_rate - 30.0 / (85.0 * G0)).abs() < 1e-12);
        assert!((engine.thrust() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn landed_engine_has_minimum_flow() {
        let env = Environment::default();
        let live = LiveState {
            landed: true,
            main_throttle: 0.0,
        };
        let engine = engine(&terrier(), &env, Some(live));

        assert_eq!(engine.mass_flow_rate, LANDED_MIN_FLOW);
        assert!(engine.is_operational());
    }

    #[test]
    fn throttle_locked_ignores_requested_thrust() {
        let env = Environment::default();
        let mut part = terrier();
        part.engines[0].throttle_locked = true;
        part.engines[0].requested_thrust = 0.0;
        let live = LiveState {
            landed: false,
            main_throttle: 0.0,
        };
        let engine = engine(&part, &env, Some(live));

        assert!((engine.thrust() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn zero_isp_means_no_flow() {
        let env = Environment {
            atm_pressure: 5.0,
            ..Environment::default()
        };
        let mut part = terrier();
        part.engines[0].atmosphere_curve[1].isp = 0.0;
        part.engines[0].atmosphere_curve[1].pressure = 2.0;
        let engine = engine(&part, &env, None);

        assert_eq!(engine.isp, 0.0);
        assert_eq!(engine.mass_flow_rate, 0.0);
        assert!(!engine.is_operational());
    }

    #[test]
    fn mode_selection_and_vector_thrust() {
        let table = ResourceTable::stock();
        let mut part = terrier();
        let mut closed = part.engines[0].clone();
        closed.mode = Some("ClosedCycle".into());
        closed.max_thrust = 90.0;
        closed.thrust_transforms = vec![
            ThrustTransform {
                direction: [1.0, 0.0, 1.0],
                multiplier: 0.5,
            },
            ThrustTransform {
                direction: [-1.0, 0.0, 1.0],
                multiplier: 0.5,
            },
        ];
        part.engines[0].mode = Some("AirBreathing".into());
        part.engines.push(closed);
        part.active_mode = Some("ClosedCycle".into());

        let mut engines = Engine::new(PartId(0), &part, &table).unwrap();
        assert_eq!(engines.len(), 1);
        let engine = &mut engines[0];
        engine.update(&Environment::default(), None, 0.0, &table);

        assert!((engine.thrust() - 90.0).abs() < 1e-9);
        let cos45 = std::f64::consts::FRAC_1_SQRT_2;
        assert!((engine.vector_thrust().norm() - 90.0 * cos45).abs() < 1e-9);
    }
}
