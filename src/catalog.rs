//! ERD catalog: which ERDs to probe during discovery.
//!
//! Every appliance is probed for the `common` and `energy` lists, then for
//! the list belonging to its appliance type. Row 0 of `appliances` doubles as
//! the fallback for types the catalog does not know.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::erd::Erd;
use crate::error::BridgeError;

#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub erds: Vec<Erd>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErdCatalog {
    #[serde(default)]
    common: Vec<Erd>,
    #[serde(default)]
    energy: Vec<Erd>,
    appliances: Vec<ApplianceEntry>,
}

fn erds(values: &[u16]) -> Vec<Erd> {
    values.iter().copied().map(Erd).collect()
}

fn entry(name: &str, values: &[u16]) -> ApplianceEntry {
    ApplianceEntry {
        name: name.to_string(),
        erds: erds(values),
    }
}

impl ErdCatalog {
    #[cfg(test)]
    pub fn new(common: Vec<Erd>, energy: Vec<Erd>, appliances: Vec<ApplianceEntry>) -> Self {
        Self {
            common,
            energy,
            appliances,
        }
    }

    /// Catalog compiled into the binary, indexed by appliance type byte.
    pub fn builtin() -> Self {
        Self {
            common: erds(&[
                0x0001, 0x0002, 0x0003, 0x0004, 0x0005, 0x0006, 0x0007, 0x0008, 0x0030,
                0x0031, 0x0032, 0x0035, 0x0099,
            ]),
            energy: erds(&[0xD001, 0xD002, 0xD003, 0xD004]),
            appliances: vec![
                entry("water_heater", &[0x4000, 0x4001, 0x4002, 0x4003, 0x4004, 0x4007, 0x4009]),
                entry("dryer", &[0x2000, 0x2001, 0x2002, 0x2007, 0x200A, 0x2041, 0x2044]),
                entry("washer", &[0x2000, 0x2001, 0x2002, 0x2007, 0x200A, 0x2010, 0x2015]),
                entry("refrigerator", &[0x1004, 0x1005, 0x1007, 0x1009, 0x100A, 0x101C, 0x1020]),
                entry("microwave", &[0x5700, 0x5701, 0x5703, 0x5705]),
                entry("advantium", &[0x5000, 0x5001, 0x5002, 0x5003]),
                entry("dishwasher", &[0x3001, 0x3003, 0x3004, 0x3005, 0x3007, 0x3009, 0x300B]),
                entry("oven", &[0x5100, 0x5101, 0x5102, 0x5104, 0x5105, 0x5108, 0x510A]),
                entry("electric_range", &[0x5100, 0x5101, 0x5102, 0x5104, 0x5105, 0x5200]),
                entry("gas_range", &[0x5100, 0x5101, 0x5102, 0x5104, 0x5105, 0x5201]),
                entry("air_conditioner", &[0x7A00, 0x7A01, 0x7A02, 0x7A0F, 0x7B00]),
                entry("electric_cooktop", &[0x5400, 0x5401, 0x5402]),
            ],
        }
    }

    /// Load a catalog from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let catalog: ErdCatalog = serde_yaml::from_str(&contents)?;
        Ok(catalog)
    }

    pub fn common(&self) -> &[Erd] {
        &self.common
    }

    pub fn energy(&self) -> &[Erd] {
        &self.energy
    }

    pub fn appliance_count(&self) -> usize {
        self.appliances.len()
    }

    /// Map a raw appliance type byte onto a catalog row; unknown types use row 0.
    pub fn clamp_appliance_type(&self, raw: u8) -> u8 {
        if (raw as usize) < self.appliances.len() {
            raw
        } else {
            0
        }
    }

    pub fn appliance_erds(&self, appliance_type: u8) -> &[Erd] {
        let index = self.clamp_appliance_type(appliance_type) as usize;
        self.appliances
            .get(index)
            .map(|e| e.erds.as_slice())
            .unwrap_or(&[])
    }

    pub fn appliance_name(&self, appliance_type: u8) -> &str {
        let index = self.clamp_appliance_type(appliance_type) as usize;
        self.appliances
            .get(index)
            .map(|e| e.name.as_str())
            .unwrap_or("")
    }

    /// Check that discovery of any appliance type fits in `capacity` ERDs.
    pub fn validate(&self, capacity: usize) -> Result<(), BridgeError> {
        if self.appliances.is_empty() {
            return Err(BridgeError::EmptyCatalog);
        }
        for (index, appliance) in self.appliances.iter().enumerate() {
            let distinct: HashSet<Erd> = self
                .common
                .iter()
                .chain(self.energy.iter())
                .chain(appliance.erds.iter())
                .copied()
                .collect();
            if distinct.len() > capacity {
                return Err(BridgeError::CatalogTooLarge {
                    appliance_type: index,
                    count: distinct.len(),
                    capacity,
                });
            }
        }
        Ok(())
    }
}
