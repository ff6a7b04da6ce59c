//! The working part graph of one simulation run and propellant supply
//! resolution over it.

use std::{cmp, collections::BTreeMap};

use color_eyre::eyre;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use tracing::trace;

use super::{engine::Engine, Environment};
use crate::{
    arena::{Arena, IdLike},
    resource::{FlowMode, ResourceId, ResourceLedger, ResourceTable},
    vessel::{LiveState, NodeKind, PartId, Vessel},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// A fuel line feeding this part.
    FuelLine,
    /// A part on one of this part's cross-feeding stack nodes.
    StackNode,
    /// The structural parent.
    Parent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SourceLink {
    pub part: PartId,
    pub kind: LinkKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimPart {
    pub name: String,
    pub dry_mass: f64,
    pub dry_cost: f64,
    pub resources: ResourceLedger,
    pub resource_drains: BTreeMap<ResourceId, f64>,

    pub decoupled_in_stage: i32,
    pub crossfeed: bool,
    pub is_launch_clamp: bool,
    pub is_sepratron: bool,
    pub source_candidates: Vec<SourceLink>,
}

impl SimPart {
    pub fn mass(&self, table: &ResourceTable) -> f64 {
        if self.is_launch_clamp {
            return 0.0;
        }
        self.dry_mass + self.resources.mass(table)
    }

    pub fn cost(&self, table: &ResourceTable) -> f64 {
        if self.is_launch_clamp {
            return 0.0;
        }
        self.dry_cost + self.resources.cost(table)
    }

    fn add_drain(&mut self, res: ResourceId, consumption: f64) {
        *self.resource_drains.entry(res).or_insert(0.0) += consumption;
    }

    fn apply_drains(&mut self, dt: f64) {
        for (&res, &drain) in &self.resource_drains {
            self.resources.drain(res, drain * dt);
        }
    }

    /// Time until the first drained resource in this part runs out.
    fn max_time(&self) -> f64 {
        let mut max_time = f64::INFINITY;
        for (&res, &drain) in &self.resource_drains {
            if drain <= 0.0 {
                continue;
            }
            let dt = self.resources.get(res) / drain;
            max_time = cmp::min(OrderedFloat(max_time), OrderedFloat(dt)).0;
        }
        max_time
    }
}

/// Parts that together supply one resource to one engine, in id order.
pub type SupplySet = Vec<PartId>;

/// An engine that can currently draw every propellant it needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveEngine {
    /// Index into [`SimVessel::engines`].
    pub engine: usize,
    pub supply: Vec<(ResourceId, f64, SupplySet)>,
}

/// The part graph of one run. Parts are removed as stages fire.
#[derive(Clone, Debug)]
pub struct SimVessel {
    pub parts: Arena<PartId, SimPart>,
    pub engines: Vec<Engine>,
    pub live: Option<LiveState>,
}

impl SimVessel {
    /// Builds the graph for `vessel`, keeping only parts still attached
    /// once `top_stage` has been activated.
    pub fn build(
        vessel: &Vessel,
        table: &ResourceTable,
        env: &Environment,
        top_stage: i32,
    ) -> eyre::Result<Self> {
        vessel.validate(table)?;

        let decoupled = decoupled_in_stage(vessel);
        let dry_masses = carried_dry_masses(vessel);

        let mut parts = Arena::with_capacity(vessel.parts.len());
        let mut engines = vec![];
        for (id, part) in vessel.parts() {
            let resources = part
                .resources
                .iter()
                .map(|(name, &amount)| Ok((table.resolve(name)?, amount)))
                .collect::<eyre::Result<ResourceLedger>>()?;

            for mut engine in Engine::new(id, part, table)? {
                engine.update(env, vessel.live, part.static_pressure, table);
                engines.push(engine);
            }

            let pushed = parts.push(SimPart {
                name: part.name.clone(),
                dry_mass: dry_masses[id.into_raw()],
                dry_cost: part.dry_cost,
                resources,
                resource_drains: BTreeMap::new(),
                decoupled_in_stage: decoupled[id.into_raw()],
                crossfeed: part.crossfeed,
                is_launch_clamp: part.is_launch_clamp,
                is_sepratron: part.is_sepratron,
                source_candidates: vec![],
            });
            debug_assert_eq!(pushed, id);
        }

        for (id, part) in vessel.parts() {
            let mut candidates: Vec<SourceLink> = vec![];
            let mut push = |link: SourceLink| {
                if link.part != id && !candidates.iter().any(|x| x.part == link.part) {
                    candidates.push(link);
                }
            };

            for (source, other) in vessel.parts() {
                if other.fuel_line_target == Some(id) {
                    push(SourceLink {
                        part: source,
                        kind: LinkKind::FuelLine,
                    });
                }
            }

            for node in &part.nodes {
                let excluded = part
                    .no_crossfeed_key
                    .as_deref()
                    .is_some_and(|key| !key.is_empty() && node.id.contains(key));
                if node.kind != NodeKind::Stack || !node.crossfeed || excluded {
                    continue;
                }
                if let Some(attached) = node.attached {
                    push(SourceLink {
                        part: attached,
                        kind: LinkKind::StackNode,
                    });
                }
            }

            if let Some(parent) = part.parent {
                if !vessel.parts[parent.into_raw()].is_decoupler {
                    push(SourceLink {
                        part: parent,
                        kind: LinkKind::Parent,
                    });
                }
            }

            parts[id].source_candidates = candidates;
        }

        let mut sim = Self {
            parts,
            engines,
            live: vessel.live,
        };
        sim.remove_parts(|part| part.decoupled_in_stage >= top_stage);
        Ok(sim)
    }

    /// Removes every part matching `f` along with its engines and any
    /// links to it.
    pub fn remove_parts(&mut self, f: impl Fn(&SimPart) -> bool) {
        let removed = self.parts.retain(|_, part| !f(part));
        if removed.is_empty() {
            return;
        }

        self.engines.retain(|x| !removed.contains(&x.part));
        for (_, part) in self.parts.iter_mut() {
            part.source_candidates
                .retain(|link| !removed.contains(&link.part));
        }
    }

    pub fn mass(&self, table: &ResourceTable) -> f64 {
        self.parts
            .iter()
            .fold(0.0, |acc, (_, x)| acc + x.mass(table))
    }

    /// Finds the parts that can supply `res` to an engine on `part`.
    /// `None` means the resource is out of reach.
    pub fn resolve_supply(
        &self,
        part: PartId,
        res: ResourceId,
        table: &ResourceTable,
        threshold: f64,
    ) -> Option<SupplySet> {
        match table.flow_mode(res) {
            FlowMode::NoFlow => {
                (self.parts.get(part)?.resources.get(res) > threshold).then(|| vec![part])
            }
            FlowMode::AllVessel => {
                let mut best = i32::MIN;
                let mut set = vec![];
                for (id, p) in self.parts.iter() {
                    if p.resources.get(res) <= threshold {
                        continue;
                    }
                    if p.decoupled_in_stage > best {
                        best = p.decoupled_in_stage;
                        set.clear();
                    }
                    if p.decoupled_in_stage == best {
                        set.push(id);
                    }
                }
                (!set.is_empty()).then_some(set)
            }
            FlowMode::StackPriority => {
                let mut visited = vec![false; self.parts.capacity()];
                let set = self.stack_search(part, res, threshold, &mut visited)?;
                Some(set.into_iter().sorted_unstable().dedup().collect())
            }
        }
    }

    fn stack_search(
        &self,
        id: PartId,
        res: ResourceId,
        threshold: f64,
        visited: &mut [bool],
    ) -> Option<SupplySet> {
        let part = self.parts.get(id)?;
        if std::mem::replace(&mut visited[id.into_raw()], true) {
            return None;
        }

        let own = part.resources.get(res);
        if own > threshold {
            return Some(vec![id]);
        }
        if !part.crossfeed {
            return None;
        }

        let mut from_lines = vec![];
        for link in part
            .source_candidates
            .iter()
            .filter(|x| x.kind == LinkKind::FuelLine)
        {
            if let Some(set) = self.stack_search(link.part, res, threshold, visited) {
                from_lines.extend(set);
            }
        }
        if !from_lines.is_empty() {
            return Some(from_lines);
        }

        let mut from_structure = vec![];
        for link in part
            .source_candidates
            .iter()
            .filter(|x| x.kind != LinkKind::FuelLine)
        {
            if let Some(set) = self.stack_search(link.part, res, threshold, visited) {
                from_structure.extend(set);
            }
        }
        (!from_structure.is_empty()).then_some(from_structure)
    }

    /// Engines that may fire in `stage` and can reach all their
    /// propellants, with the supply set for each. Sepratrons push the
    /// dropped section away rather than the vessel, so they never count.
    pub fn active_engines(
        &self,
        stage: i32,
        table: &ResourceTable,
        threshold: f64,
    ) -> Vec<ActiveEngine> {
        let mut active = vec![];
        'engines: for (i, engine) in self.engines.iter().enumerate() {
            if engine.inverse_stage < stage
                || engine.is_sepratron
                || !engine.is_operational()
                || !self.parts.contains(engine.part)
            {
                continue;
            }

            let mut supply = vec![];
            for (&res, &consumption) in &engine.resource_consumptions {
                let Some(set) = self.resolve_supply(engine.part, res, table, threshold) else {
                    trace!(part = engine.part.0, resource = res.0, "no supply, engine inactive");
                    continue 'engines;
                };
                supply.push((res, consumption, set));
            }
            active.push(ActiveEngine { engine: i, supply });
        }
        active
    }

    pub fn clear_drains(&mut self) {
        for (_, part) in self.parts.iter_mut() {
            part.resource_drains.clear();
        }
    }

    /// Sets the drain rates for `active`, splitting each consumption
    /// evenly over its supply set.
    pub fn set_drains(&mut self, active: &[ActiveEngine]) {
        self.clear_drains();
        for engine in active {
            for (res, consumption, set) in &engine.supply {
                let share = consumption / set.len() as f64;
                for &id in set {
                    self.parts[id].add_drain(*res, share);
                }
            }
        }
    }

    /// Time until the first drained resource runs out.
    pub fn time_to_drain(&self) -> f64 {
        self.parts
            .iter()
            .map(|(_, x)| OrderedFloat(x.max_time()))
            .min()
            .map_or(f64::INFINITY, |x| x.0)
    }

    pub fn apply_drains(&mut self, dt: f64) {
        for (_, part) in self.parts.iter_mut() {
            part.apply_drains(dt);
        }
    }
}

/// For every part, the highest stage of a decoupler or launch clamp on
/// its parent chain (itself included), or -1 if it never separates.
pub fn decoupled_in_stage(vessel: &Vessel) -> Vec<i32> {
    vessel
        .parts()
        .map(|(id, _)| {
            let mut stage = -1;
            let mut cur = Some(id);
            let mut steps = 0;
            while let Some(p) = cur {
                let part = &vessel.parts[p.into_raw()];
                if part.is_decoupler || part.is_launch_clamp {
                    stage = stage.max(part.inverse_stage);
                }
                cur = part.parent;
                steps += 1;
                if steps > vessel.parts.len() {
                    break;
                }
            }
            stage
        })
        .collect()
}

/// Dry masses with the mass of non-physically-significant parts moved
/// onto their nearest significant ancestor.
fn carried_dry_masses(vessel: &Vessel) -> Vec<f64> {
    let mut masses: Vec<f64> = vessel.parts.iter().map(|x| x.dry_mass).collect();
    for (id, part) in vessel.parts() {
        if part.physically_significant {
            continue;
        }
        let mut carrier = part.parent;
        while let Some(p) = carrier {
            let candidate = &vessel.parts[p.into_raw()];
            if candidate.physically_significant {
                break;
            }
            carrier = candidate.parent;
        }
        if let Some(carrier) = carrier {
            masses[carrier.into_raw()] += part.dry_mass;
            masses[id.into_raw()] = 0.0;
        }
    }
    masses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vessel::{AttachNode, Attachment, Part};

    fn tank(name: &str, lf: f64) -> Part {
        Part {
            name: name.into(),
            dry_mass: 0.1,
            resources: [("LiquidFuel".to_string(), lf)].into_iter().collect(),
            ..Part::default()
        }
    }

    fn stack(id: &str, attached: u32) -> AttachNode {
        AttachNode {
            id: id.into(),
            kind: NodeKind::Stack,
            crossfeed: true,
            attached: Some(PartId(attached)),
        }
    }

    fn build(vessel: &Vessel) -> SimVessel {
        let table = ResourceTable::stock();
        SimVessel::build(vessel, &table, &Environment::default(), vessel.top_stage()).unwrap()
    }

    fn lf() -> ResourceId {
        ResourceTable::stock().resolve("LiquidFuel").unwrap()
    }

    #[test]
    fn decoupled_in_stage_takes_highest_on_chain() {
        let vessel = Vessel {
            name: "chain".into(),
            live: None,
            parts: vec![
                Part::default(),
                Part {
                    parent: Some(PartId(0)),
                    is_decoupler: true,
                    inverse_stage: 1,
                    ..Part::default()
                },
                Part {
                    parent: Some(PartId(1)),
                    ..Part::default()
                },
                Part {
                    parent: Some(PartId(2)),
                    is_decoupler: true,
                    inverse_stage: 3,
                    ..Part::default()
                },
                Part {
                    parent: Some(PartId(3)),
                    ..Part::default()
                },
            ],
        };

        assert_eq!(decoupled_in_stage(&vessel), vec![-1, 1, 1, 3, 3]);
    }

    #[test]
    fn source_candidates_follow_links() {
        let mut parts = vec![tank("top", 100.0), tank("bottom", 100.0), tank("line", 0.0)];
        parts[0].nodes = vec![stack("bottom", 1)];
        parts[1].parent = Some(PartId(0));
        parts[1].attachment = Attachment::Axial;
        parts[1].nodes = vec![stack("top", 0)];
        parts[2].parent = Some(PartId(0));
        parts[2].attachment = Attachment::Radial;
        parts[2].fuel_line_target = Some(PartId(1));
        let vessel = Vessel {
            name: "links".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);

        assert_eq!(
            sim.parts[PartId(1)].source_candidates,
            vec![
                SourceLink {
                    part: PartId(2),
                    kind: LinkKind::FuelLine
                },
                SourceLink {
                    part: PartId(0),
                    kind: LinkKind::StackNode
                },
            ]
        );
        assert_eq!(
            sim.parts[PartId(0)].source_candidates,
            vec![SourceLink {
                part: PartId(1),
                kind: LinkKind::StackNode
            }]
        );
    }

    #[test]
    fn excluded_nodes_and_decoupler_parents_do_not_feed() {
        let mut parts = vec![tank("tank", 100.0), Part::default(), tank("engine", 0.0)];
        parts[0].inverse_stage = 1;
        parts[1].parent = Some(PartId(0));
        parts[1].is_decoupler = true;
        parts[2].parent = Some(PartId(1));
        parts[2].attachment = Attachment::Axial;
        parts[2].nodes = vec![stack("top", 0)];
        parts[2].no_crossfeed_key = Some("top".into());
        let vessel = Vessel {
            name: "excluded".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);

        assert!(sim.parts[PartId(2)].source_candidates.is_empty());
        assert_eq!(
            sim.resolve_supply(PartId(2), lf(), &ResourceTable::stock(), 0.01),
            None
        );
    }

    #[test]
    fn stack_search_survives_cycles() {
        let mut parts = vec![tank("a", 0.0), tank("b", 0.0), tank("c", 50.0)];
        parts[0].fuel_line_target = Some(PartId(1));
        parts[1].fuel_line_target = Some(PartId(0));
        parts[1].parent = Some(PartId(2));
        let vessel = Vessel {
            name: "cycle".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);
        let table = ResourceTable::stock();

        assert_eq!(
            sim.resolve_supply(PartId(0), lf(), &table, 0.01),
            Some(vec![PartId(2)])
        );
    }

    #[test]
    fn non_crossfeed_part_only_supplies_itself() {
        let mut parts = vec![tank("tank", 100.0), tank("engine", 0.0)];
        parts[1].parent = Some(PartId(0));
        parts[1].attachment = Attachment::Axial;
        parts[1].crossfeed = false;
        let vessel = Vessel {
            name: "no crossfeed".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);

        assert_eq!(
            sim.resolve_supply(PartId(1), lf(), &ResourceTable::stock(), 0.01),
            None
        );
    }

    #[test]
    fn child_at_threshold_draws_from_parent() {
        let mut parts = vec![tank("tank", 100.0), tank("engine", 0.01)];
        parts[1].parent = Some(PartId(0));
        parts[1].attachment = Attachment::Radial;
        let vessel = Vessel {
            name: "threshold".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);

        assert_eq!(
            sim.resolve_supply(PartId(1), lf(), &ResourceTable::stock(), 0.01),
            Some(vec![PartId(0)])
        );
    }

    #[test]
    fn all_vessel_prefers_parts_dropped_first() {
        let table = ResourceTable::stock();
        let mono = table.resolve("MonoPropellant").unwrap();
        let mut parts = vec![Part::default(), Part::default(), Part::default(), Part::default()];
        parts[0].resources.insert("MonoPropellant".into(), 10.0);
        parts[1].parent = Some(PartId(0));
        parts[1].is_decoupler = true;
        parts[1].inverse_stage = 1;
        parts[2].parent = Some(PartId(1));
        parts[2].resources.insert("MonoPropellant".into(), 5.0);
        parts[3].parent = Some(PartId(1));
        parts[3].resources.insert("MonoPropellant".into(), 0.001);
        let vessel = Vessel {
            name: "all vessel".into(),
            live: None,
            parts,
        };
        let sim = SimVessel::build(&vessel, &table, &Environment::default(), 2).unwrap();

        assert_eq!(
            sim.resolve_supply(PartId(0), mono, &table, 0.01),
            Some(vec![PartId(2)])
        );
    }

    #[test]
    fn initial_build_drops_parts_released_by_top_stage() {
        let mut parts = vec![tank("rocket", 10.0), Part::default()];
        parts[0].inverse_stage = 1;
        parts[1].parent = Some(PartId(0));
        parts[1].is_launch_clamp = true;
        parts[1].inverse_stage = 1;
        parts[1].dry_mass = 2.0;
        let vessel = Vessel {
            name: "clamped".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);

        assert!(sim.parts.contains(PartId(0)));
        assert!(!sim.parts.contains(PartId(1)));
    }

    #[test]
    fn massless_parts_are_carried_by_parent() {
        let mut parts = vec![tank("tank", 0.0), Part::default()];
        parts[1].parent = Some(PartId(0));
        parts[1].dry_mass = 0.05;
        parts[1].physically_significant = false;
        let vessel = Vessel {
            name: "strut".into(),
            live: None,
            parts,
        };
        let sim = build(&vessel);

        assert!((sim.parts[PartId(0)].dry_mass - 0.15).abs() < 1e-12);
        assert_eq!(sim.parts[PartId(1)].dry_mass, 0.0);
        assert!((sim.mass(&ResourceTable::stock()) - 0.15).abs() < 1e-12);
    }
}
