//! Resource definitions and per-part resource ledgers.

use std::collections::BTreeMap;

use color_eyre::eyre::{self, bail};
use serde::{Deserialize, Serialize};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub struct ResourceId(pub i32);

/// Where is a resource allowed to come from?
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FlowMode {
    /// Only the consuming part itself.
    NoFlow,
    /// Any part on the vessel, preferring the ones dropped soonest.
    AllVessel,
    /// Recursive search upstream through fuel lines and stack nodes.
    #[default]
    StackPriority,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResourceDefinition {
    pub id: ResourceId,
    pub name: String,
    /// Tons per unit.
    pub density: f64,
    #[serde(default)]
    pub flow_mode: FlowMode,
    /// Funds per unit.
    #[serde(default)]
    pub unit_cost: f64,
    /// Free resources never limit an engine and are never drained.
    #[serde(default)]
    pub free: bool,
}

impl ResourceDefinition {
    pub fn is_free(&self) -> bool {
        self.free || self.density <= 0.0
    }
}

/// Static lookup table for resource metadata, passed by reference into
/// the simulation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceTable {
    defs: BTreeMap<ResourceId, ResourceDefinition>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock resources.
    pub fn stock() -> Self {
        use FlowMode::{AllVessel, NoFlow, StackPriority};

        let stock = [
            ("LiquidFuel", 0.005, StackPriority, 0.8, false),
            ("Oxidizer", 0.005, StackPriority, 0.18, false),
            ("SolidFuel", 0.0075, NoFlow, 0.6, false),
            ("MonoPropellant", 0.004, AllVessel, 1.2, false),
            ("XenonGas", 0.0001, AllVessel, 4.0, false),
            ("ElectricCharge", 0.0, AllVessel, 0.0, true),
            ("IntakeAir", 0.005, AllVessel, 0.0, true),
        ];

        let mut table = Self::new();
        for (id, (name, density, flow_mode, unit_cost, free)) in (0..).zip(stock) {
            table.insert(ResourceDefinition {
                id: ResourceId(id),
                name: name.into(),
                density,
                flow_mode,
                unit_cost,
                free,
            });
        }
        table
    }

    /// Adds a definition, replacing any existing one with the same id or
    /// the same name.
    pub fn insert(&mut self, def: ResourceDefinition) -> Option<ResourceDefinition> {
        let stale = self
            .defs
            .values()
            .find(|x| x.name == def.name && x.id != def.id)
            .map(|x| x.id);
        if let Some(stale) = stale {
            self.defs.remove(&stale);
        }
        self.defs.insert(def.id, def)
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceDefinition> {
        self.defs.get(&id)
    }

    pub fn density(&self, id: ResourceId) -> f64 {
        self.get(id).map_or(0.0, |x| x.density)
    }

    pub fn flow_mode(&self, id: ResourceId) -> FlowMode {
        self.get(id).map_or(FlowMode::NoFlow, |x| x.flow_mode)
    }

    pub fn unit_cost(&self, id: ResourceId) -> f64 {
        self.get(id).map_or(0.0, |x| x.unit_cost)
    }

    /// Unknown resources count as free.
    pub fn is_free(&self, id: ResourceId) -> bool {
        self.get(id).map_or(true, ResourceDefinition::is_free)
    }

    pub fn resolve(&self, name: &str) -> eyre::Result<ResourceId> {
        match self.defs.values().find(|x| x.name == name) {
            Some(def) => Ok(def.id),
            None => bail!("Unknown resource {name:?}"),
        }
    }
}

/// Quantity held per resource type. Iterates in resource id order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceLedger {
    amounts: BTreeMap<ResourceId, f64>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ResourceId) -> f64 {
        self.amounts.get(&id).copied().unwrap_or(0.0)
    }

    pub fn add(&mut self, id: ResourceId, delta: f64) {
        *self.amounts.entry(id).or_insert(0.0) += delta;
    }

    /// Removes up to `amount`, never leaving a negative quantity.
    pub fn drain(&mut self, id: ResourceId, amount: f64) {
        if let Some(x) = self.amounts.get_mut(&id) {
            *x = (*x - amount).max(0.0);
        }
    }

    pub fn is_effectively_empty(&self, threshold: f64) -> bool {
        self.amounts.values().all(|&x| x <= threshold)
    }

    /// Like [`Self::is_effectively_empty`], but only looks at `ids`.
    pub fn is_effectively_empty_of(
        &self,
        ids: impl IntoIterator<Item = ResourceId>,
        threshold: f64,
    ) -> bool {
        ids.into_iter().all(|id| self.get(id) <= threshold)
    }

    /// Mass of the held resources, in tons.
    pub fn mass(&self, table: &ResourceTable) -> f64 {
        self.amounts
            .iter()
            .fold(0.0, |acc, (&id, &amount)| acc + amount * table.density(id))
    }

    pub fn cost(&self, table: &ResourceTable) -> f64 {
        self.amounts
            .iter()
            .fold(0.0, |acc, (&id, &amount)| acc + amount * table.unit_cost(id))
    }
}

impl FromIterator<(ResourceId, f64)> for ResourceLedger {
    fn from_iter<I: IntoIterator<Item = (ResourceId, f64)>>(iter: I) -> Self {
        let mut ledger = Self::new();
        for (id, amount) in iter {
            ledger.add(id, amount);
        }
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_get_add_drain() {
        let lf = ResourceId(0);
        let mut ledger = ResourceLedger::new();
        assert_eq!(ledger.get(lf), 0.0);

        ledger.add(lf, 10.0);
        ledger.add(lf, 5.0);
        assert_eq!(ledger.get(lf), 15.0);

        ledger.drain(lf, 20.0);
        assert_eq!(ledger.get(lf), 0.0);
    }

    #[test]
    fn emptiness_uses_threshold() {
        let table = ResourceTable::stock();
        let lf = table.resolve("LiquidFuel").unwrap();
        let ec = table.resolve("ElectricCharge").unwrap();

        let ledger: ResourceLedger = [(lf, 0.005), (ec, 50.0)].into_iter().collect();
        assert!(!ledger.is_effectively_empty(0.01));
        assert!(ledger.is_effectively_empty(100.0));
        assert!(ledger.is_effectively_empty_of([lf], 0.01));
        assert!(!ledger.is_effectively_empty_of([lf, ec], 0.01));
    }

    #[test]
    fn ledger_mass_and_cost() {
        let table = ResourceTable::stock();
        let lf = table.resolve("LiquidFuel").unwrap();
        let ox = table.resolve("Oxidizer").unwrap();
        let ledger: ResourceLedger = [(lf, 180.0), (ox, 220.0)].into_iter().collect();

        assert!((ledger.mass(&table) - 2.0).abs() < 1e-12);
        assert!((ledger.cost(&table) - (180.0 * 0.8 + 220.0 * 0.18)).abs() < 1e-9);
    }

    #[test]
    fn stock_table_lookups() {
        let mut table = ResourceTable::stock();
        let sf = table.resolve("SolidFuel").unwrap();
        assert_eq!(table.flow_mode(sf), FlowMode::NoFlow);
        assert!(table.is_free(table.resolve("ElectricCharge").unwrap()));
        assert!(table.is_free(table.resolve("IntakeAir").unwrap()));
        assert!(!table.is_free(sf));
        assert!(table.resolve("Unobtainium").is_err());

        table.insert(ResourceDefinition {
            id: ResourceId(42),
            name: "SolidFuel".into(),
            density: 0.01,
            flow_mode: FlowMode::AllVessel,
            unit_cost: 0.0,
            free: false,
        });
        assert_eq!(table.resolve("SolidFuel").unwrap(), ResourceId(42));
        assert!(table.get(sf).is_none());
        assert_eq!(table.density(ResourceId(42)), 0.01);
    }
}
