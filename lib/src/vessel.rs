//! The part list handed to the simulation: everything it needs to know
//! about a vessel, as plain data. Vessel files are stored as RON.

use std::{collections::BTreeMap, path::Path};

use color_eyre::eyre::{self, bail, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{arena::IdLike, resource::ResourceTable};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vessel {
    pub name: String,
    /// Present when the vessel is already flying. Engines then use the
    /// requested thrust and static pressure reported for each part.
    #[serde(default)]
    pub live: Option<LiveState>,
    pub parts: Vec<Part>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub landed: bool,
    /// Main throttle input, 0 to 1.
    pub main_throttle: f64,
}

impl Vessel {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read vessel file {}", path.display()))?;
        Self::from_ron_str(&text).wrap_err_with(|| format!("Invalid vessel file {}", path.display()))
    }

    pub fn from_ron_str(s: &str) -> eyre::Result<Self> {
        Ok(ron::from_str(s)?)
    }

    pub fn to_ron_string(&self) -> eyre::Result<String> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    /// The highest stage index any part activates in, or 0 for a vessel
    /// without staging.
    pub fn top_stage(&self) -> i32 {
        self.parts
            .iter()
            .map(|x| x.inverse_stage)
            .max()
            .unwrap_or(0)
            .max(0)
    }

    pub fn part(&self, id: PartId) -> Option<&Part> {
        self.parts.get(id.into_raw())
    }

    pub fn parts(&self) -> impl Iterator<Item = (PartId, &Part)> {
        self.parts
            .iter()
            .enumerate()
            .map(|(i, x)| (PartId::from_raw(i), x))
    }

    /// Checks references between parts and every number the simulation
    /// relies on.
    pub fn validate(&self, table: &ResourceTable) -> eyre::Result<()> {
        if self.parts.is_empty() {
            bail!("Vessel {:?} has no parts", self.name);
        }

        let check_ref = |from: PartId, to: PartId, what: &str| -> eyre::Result<()> {
            if to == from || self.part(to).is_none() {
                bail!("Part {} has an invalid {what} reference {}", from.0, to.0);
            }
            Ok(())
        };
        let check_num = |id: PartId, x: f64, what: &str| -> eyre::Result<()> {
            if !x.is_finite() || x < 0.0 {
                bail!("Part {} has an invalid {what}: {x}", id.0);
            }
            Ok(())
        };

        for (id, part) in self.parts() {
            if let Some(parent) = part.parent {
                check_ref(id, parent, "parent")?;
            }
            if let Some(target) = part.fuel_line_target {
                check_ref(id, target, "fuel line target")?;
            }
            for node in &part.nodes {
                if let Some(attached) = node.attached {
                    check_ref(id, attached, "attach node")?;
                }
            }

            check_num(id, part.dry_mass, "dry mass")?;
            check_num(id, part.dry_cost, "cost")?;
            for (name, &amount) in &part.resources {
                table.resolve(name)?;
                check_num(id, amount, "resource amount")?;
            }

            for engine in &part.engines {
                check_num(id, engine.max_thrust, "max thrust")?;
                check_num(id, engine.thrust_percentage, "thrust limiter")?;
                check_num(id, engine.requested_thrust, "requested thrust")?;
                if engine.atmosphere_curve.is_empty() {
                    bail!("Engine on part {} has an empty atmosphere curve", id.0);
                }
                for key in &engine.atmosphere_curve {
                    if !key.pressure.is_finite() || !key.isp.is_finite() {
                        bail!("Engine on part {} has a non-finite curve key", id.0);
                    }
                }
                for propellant in &engine.propellants {
                    table.resolve(&propellant.resource)?;
                    check_num(id, propellant.ratio, "propellant ratio")?;
                }
            }
        }

        let mut seen = vec![false; self.parts.len()];
        for (id, _) in self.parts() {
            seen.iter_mut().for_each(|x| *x = false);
            let mut cur = Some(id);
            while let Some(p) = cur {
                if std::mem::replace(&mut seen[p.into_raw()], true) {
                    bail!("Part {} has a cyclic parent chain", id.0);
                }
                cur = self.parts[p.into_raw()].parent;
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    /// Tons.
    pub dry_mass: f64,
    #[serde(default)]
    pub dry_cost: f64,
    /// Parts without physical significance have their mass carried by
    /// their parent.
    #[serde(default = "default_true")]
    pub physically_significant: bool,
    /// Stage in which this part is activated.
    #[serde(default)]
    pub inverse_stage: i32,
    #[serde(default)]
    pub parent: Option<PartId>,
    /// How this part is attached to its parent.
    #[serde(default)]
    pub attachment: Attachment,
    #[serde(default)]
    pub nodes: Vec<AttachNode>,
    /// Stack nodes whose id contains this key do not cross-feed.
    #[serde(default)]
    pub no_crossfeed_key: Option<String>,
    #[serde(default = "default_true")]
    pub crossfeed: bool,
    /// If this part is a fuel line, the part it feeds.
    #[serde(default)]
    pub fuel_line_target: Option<PartId>,
    #[serde(default)]
    pub is_decoupler: bool,
    #[serde(default)]
    pub is_launch_clamp: bool,
    #[serde(default)]
    pub is_sepratron: bool,
    /// Resource name to amount held.
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
    #[serde(default)]
    pub engines: Vec<EngineModule>,
    /// Selected mode for parts with several exclusive engine modules.
    #[serde(default)]
    pub active_mode: Option<String>,
    /// Atmospheres, only meaningful on a live vessel.
    #[serde(default)]
    pub static_pressure: f64,
}

impl Default for Part {
    fn default() -> Self {
        Self {
            name: String::new(),
            dry_mass: 0.0,
            dry_cost: 0.0,
            physically_significant: true,
            inverse_stage: 0,
            parent: None,
            attachment: Attachment::None,
            nodes: vec![],
            no_crossfeed_key: None,
            crossfeed: true,
            fuel_line_target: None,
            is_decoupler: false,
            is_launch_clamp: false,
            is_sepratron: false,
            resources: BTreeMap::new(),
            engines: vec![],
            active_mode: None,
            static_pressure: 0.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    Radial,
    Axial,
    #[default]
    None,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    #[default]
    Stack,
    Surface,
    Dock,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachNode {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default = "default_true")]
    pub crossfeed: bool,
    #[serde(default)]
    pub attached: Option<PartId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineModule {
    #[serde(default)]
    pub mode: Option<String>,
    /// kN.
    pub max_thrust: f64,
    #[serde(default = "default_thrust_percentage")]
    pub thrust_percentage: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub throttle_locked: bool,
    /// Thrust currently requested by the throttle, kN. Live vessels only.
    #[serde(default)]
    pub requested_thrust: f64,
    pub atmosphere_curve: Vec<CurveKey>,
    pub propellants: Vec<Propellant>,
    #[serde(default = "default_thrust_transforms")]
    pub thrust_transforms: Vec<ThrustTransform>,
}

/// One key of an atmosphere-pressure to ISP curve.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurveKey {
    pub pressure: f64,
    pub isp: f64,
    #[serde(default)]
    pub tangents: Option<(f64, f64)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Propellant {
    pub resource: String,
    pub ratio: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrustTransform {
    pub direction: [f64; 3],
    pub multiplier: f64,
}

impl Default for ThrustTransform {
    fn default() -> Self {
        Self {
            direction: [0.0, 0.0, 1.0],
            multiplier: 1.0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_thrust_percentage() -> f64 {
    100.0
}

fn default_thrust_transforms() -> Vec<ThrustTransform> {
    vec![ThrustTransform::default()]
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct PartId(pub u32);

impl IdLike for PartId {
    fn from_raw(index: usize) -> Self {
        Self(index as u32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}
