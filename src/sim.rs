//! In-memory tester.
//!
//! `SimTester` models the parts of a tester the engine talks to: per-site pattern outcomes,
//! per-site pattern memory regions, DC readings, pin groups and limit tables. It records every
//! hardware-visible action as a [`SimEvent`] so callers can check the sequencing.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::TesterError;
use crate::limits::LimitSpec;
use crate::measurement::{DcMode, DcRequest, RelayState};
use crate::platform::{
    LimitModel, OverlayDirection, PatternMemory, PinResolver, ReceiveChannel, Rdi, SiteScope,
    TestContext,
};
use crate::sites::Site;

/// Hardware-visible actions, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    BeginTransaction,
    Pattern { id: String, label: String },
    RelayEngage(RelayState),
    Force { pin: String, mode: DcMode, value: f64 },
    Settle(f64),
    Measure { id: String, pin: String },
    RelayRelease(RelayState),
    EndTransaction,
    Write { label: String, pin: String, scope: SiteScope, offset: usize, word: u64 },
    Subroutine { name: String, pin: String, scope: SiteScope, word: u64 },
}

// A pattern memory region: one bit per vector per site, slot 0 unused.
#[derive(Debug, Clone)]
struct Region {
    len: usize,
    bits: Vec<Vec<bool>>,
}

#[derive(Debug, Clone)]
pub struct SimTester {
    pub configured_sites: usize,
    pub active_sites: Vec<Site>,
    pub test_suite: String,
    pub primary_label: String,
    pins: BTreeSet<String>,
    pin_groups: BTreeMap<String, String>,
    // Pattern label -> sites on which it fails.
    patterns: BTreeMap<String, BTreeSet<Site>>,
    regions: BTreeMap<(String, String), Region>,
    dc_readings: BTreeMap<(String, Site), Vec<f64>>,
    limits: BTreeMap<String, LimitSpec>,
    // --- Internal state of the current/last transaction ---
    in_transaction: bool,
    pass_fail: BTreeMap<(String, Site), bool>,
    values: BTreeMap<(String, Site), Vec<f64>>,
    events: Vec<SimEvent>,
}

impl SimTester {
    /// Creates a tester with `configured_sites` sites, all of them active.
    pub fn new(configured_sites: usize) -> Self {
        Self {
            configured_sites,
            active_sites: (1..=configured_sites).collect(),
            test_suite: String::from("DC_Measurement"),
            primary_label: String::from("dc_meas"),
            pins: BTreeSet::new(),
            pin_groups: BTreeMap::new(),
            patterns: BTreeMap::new(),
            regions: BTreeMap::new(),
            dc_readings: BTreeMap::new(),
            limits: BTreeMap::new(),
            in_transaction: false,
            pass_fail: BTreeMap::new(),
            values: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn set_active_sites(&mut self, sites: impl IntoIterator<Item = Site>) {
        self.active_sites = sites.into_iter().collect();
    }

    pub fn set_test_suite(&mut self, suite: impl Into<String>, primary_label: impl Into<String>) {
        self.test_suite = suite.into();
        self.primary_label = primary_label.into();
    }

    pub fn add_pin(&mut self, pin: impl Into<String>) {
        self.pins.insert(pin.into());
    }

    pub fn add_pin_group(&mut self, group: impl Into<String>, pin: impl Into<String>) {
        let pin = pin.into();
        self.pins.insert(pin.clone());
        self.pin_groups.insert(group.into(), pin);
    }

    pub fn add_pattern(&mut self, label: impl Into<String>) {
        self.patterns.entry(label.into()).or_default();
    }

    /// Makes `label` fail on `site`, registering the pattern if needed.
    pub fn fail_pattern_on(&mut self, label: impl Into<String>, site: Site) {
        self.patterns.entry(label.into()).or_default().insert(site);
    }

    pub fn add_region(&mut self, label: impl Into<String>, pin: impl Into<String>, len: usize) {
        let pin = pin.into();
        self.pins.insert(pin.clone());
        let bits = vec![vec![false; len]; self.configured_sites + 1];
        self.regions.insert((label.into(), pin), Region { len, bits });
    }

    pub fn set_dc_reading(&mut self, pin: impl Into<String>, site: Site, samples: Vec<f64>) {
        let pin = pin.into();
        self.pins.insert(pin.clone());
        self.dc_readings.insert((pin, site), samples);
    }

    pub fn set_limit(&mut self, suite: impl Into<String>, limits: LimitSpec) {
        self.limits.insert(suite.into(), limits);
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Loads what the DUT would return into a region, without recording an event.
    pub fn load_capture(
        &mut self,
        label: &str,
        pin: &str,
        site: Site,
        offset: usize,
        bits: u32,
        word: u64,
    ) -> Result<(), TesterError> {
        self.store_word(label, pin, SiteScope::Site(site), offset, bits, word)
    }

    /// Reads `bits` vectors of a region on one site as a number, most significant first.
    pub fn read_bits(&self, label: &str, pin: &str, site: Site, offset: usize, bits: u32) -> Option<u64> {
        let region = self.regions.get(&(label.to_string(), pin.to_string()))?;
        let lane = region.bits.get(site)?;
        let slice = lane.get(offset..offset + bits as usize)?;
        Some(slice.iter().fold(0u64, |acc, &bit| (acc << 1) | u64::from(bit)))
    }

    fn region_mut(&mut self, label: &str, pin: &str) -> Result<&mut Region, TesterError> {
        self.regions
            .get_mut(&(label.to_string(), pin.to_string()))
            .ok_or_else(|| TesterError::UnknownLabel(label.to_string()))
    }

    fn store_word(
        &mut self,
        label: &str,
        pin: &str,
        scope: SiteScope,
        offset: usize,
        bits: u32,
        word: u64,
    ) -> Result<(), TesterError> {
        let configured = self.configured_sites;
        let region = self.region_mut(label, pin)?;
        let end = offset + bits as usize;
        if end > region.len {
            return Err(TesterError::OutOfRegion {
                label: label.to_string(),
                offset: end,
            });
        }
        let lanes: Vec<Site> = match scope {
            SiteScope::All => (1..=configured).collect(),
            SiteScope::Site(site) if site >= 1 && site <= configured => vec![site],
            SiteScope::Site(site) => {
                return Err(TesterError::Hardware(format!("site {} is not configured", site)))
            }
        };
        for site in lanes {
            for i in 0..bits {
                let bit = (word >> (bits - 1 - i)) & 1 == 1;
                region.bits[site][offset + i as usize] = bit;
            }
        }
        Ok(())
    }

    fn require_transaction(&self) -> Result<(), TesterError> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(TesterError::NoTransaction)
        }
    }
}

impl TestContext for SimTester {
    fn active_sites(&self) -> Vec<Site> {
        self.active_sites.clone()
    }

    fn configured_sites(&self) -> usize {
        self.configured_sites
    }

    fn test_suite_name(&self) -> String {
        self.test_suite.clone()
    }

    fn primary_label(&self) -> String {
        self.primary_label.clone()
    }
}

impl PinResolver for SimTester {
    fn extract_pins_from_group(&self, name: &str) -> Option<String> {
        if let Some(pin) = self.pin_groups.get(name) {
            return Some(pin.clone());
        }
        self.pins.get(name).cloned()
    }
}

impl LimitModel for SimTester {
    fn fetch_limit(&self, suite: &str) -> Option<LimitSpec> {
        self.limits.get(suite).cloned()
    }
}

impl Rdi for SimTester {
    fn begin_transaction(&mut self) -> Result<(), TesterError> {
        if self.in_transaction {
            return Err(TesterError::TransactionOpen);
        }
        self.in_transaction = true;
        self.pass_fail.clear();
        self.values.clear();
        self.events.push(SimEvent::BeginTransaction);
        Ok(())
    }

    fn run_pattern(&mut self, id: &str, label: &str) -> Result<(), TesterError> {
        self.require_transaction()?;
        let failing = self
            .patterns
            .get(label)
            .ok_or_else(|| TesterError::UnknownLabel(label.to_string()))?;
        for &site in &self.active_sites {
            self.pass_fail
                .insert((id.to_string(), site), !failing.contains(&site));
        }
        self.events.push(SimEvent::Pattern {
            id: id.to_string(),
            label: label.to_string(),
        });
        Ok(())
    }

    fn dc_measure(&mut self, request: &DcRequest) -> Result<(), TesterError> {
        self.require_transaction()?;
        if !self.pins.contains(&request.pin) {
            return Err(TesterError::UnknownPin(request.pin.clone()));
        }
        self.events.push(SimEvent::RelayEngage(request.relay.engage));
        self.events.push(SimEvent::Force {
            pin: request.pin.clone(),
            mode: request.mode,
            value: request.force_value,
        });
        self.events.push(SimEvent::Settle(request.settling_time));
        for &site in &self.active_sites {
            let samples = self
                .dc_readings
                .get(&(request.pin.clone(), site))
                .cloned()
                .unwrap_or_else(|| vec![0.0]);
            self.values.insert((request.id.clone(), site), samples);
        }
        self.events.push(SimEvent::Measure {
            id: request.id.clone(),
            pin: request.pin.clone(),
        });
        self.events.push(SimEvent::RelayRelease(request.relay.release));
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<(), TesterError> {
        self.require_transaction()?;
        self.in_transaction = false;
        self.events.push(SimEvent::EndTransaction);
        Ok(())
    }

    fn pass_fail(&self, id: &str, site: Site) -> Option<bool> {
        self.pass_fail.get(&(id.to_string(), site)).copied()
    }

    fn values(&self, id: &str, site: Site) -> Option<Vec<f64>> {
        self.values.get(&(id.to_string(), site)).cloned()
    }
}

impl PatternMemory for SimTester {
    fn region_len(&self, label: &str, pin: &str, _direction: OverlayDirection) -> Option<usize> {
        self.regions
            .get(&(label.to_string(), pin.to_string()))
            .map(|region| region.len)
    }

    fn write_word(
        &mut self,
        label: &str,
        pin: &str,
        scope: SiteScope,
        offset: usize,
        word_size: u32,
        word: u64,
    ) -> Result<(), TesterError> {
        self.store_word(label, pin, scope, offset, word_size, word)?;
        self.events.push(SimEvent::Write {
            label: label.to_string(),
            pin: pin.to_string(),
            scope,
            offset,
            word,
        });
        Ok(())
    }

    fn read_word(
        &self,
        label: &str,
        pin: &str,
        site: Site,
        offset: usize,
        word_size: u32,
        _channel: ReceiveChannel,
    ) -> Result<u64, TesterError> {
        if !self.regions.contains_key(&(label.to_string(), pin.to_string())) {
            return Err(TesterError::UnknownLabel(label.to_string()));
        }
        self.read_bits(label, pin, site, offset, word_size)
            .ok_or_else(|| TesterError::OutOfRegion {
                label: label.to_string(),
                offset,
            })
    }

    fn call_subroutine(
        &mut self,
        subroutine: &str,
        pin: &str,
        scope: SiteScope,
        _word_size: u32,
        word: u64,
    ) -> Result<(), TesterError> {
        self.events.push(SimEvent::Subroutine {
            name: subroutine.to_string(),
            pin: pin.to_string(),
            scope,
            word,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{MeasurementDescriptor, Quantity};

    #[test]
    fn simulator_creation() {
        let sim = SimTester::new(4);
        assert_eq!(sim.configured_sites(), 4);
        assert_eq!(sim.active_sites(), vec![1, 2, 3, 4]);
        assert!(!sim.in_transaction());
    }

    #[test]
    fn resolves_pins_and_groups() {
        let mut sim = SimTester::new(1);
        sim.add_pin("TDI");
        sim.add_pin_group("NVM_ANALOG_GRP", "NVM_ANALOGIO");
        assert_eq!(sim.extract_pins_from_group("TDI").as_deref(), Some("TDI"));
        assert_eq!(
            sim.extract_pins_from_group("NVM_ANALOG_GRP").as_deref(),
            Some("NVM_ANALOGIO")
        );
        assert_eq!(sim.extract_pins_from_group("NOPE"), None);
    }

    #[test]
    fn patterns_need_an_open_transaction() {
        let mut sim = SimTester::new(2);
        sim.add_pattern("pre");
        assert_eq!(sim.run_pattern("f1", "pre").unwrap_err(), TesterError::NoTransaction);
        sim.begin_transaction().unwrap();
        assert_eq!(sim.begin_transaction().unwrap_err(), TesterError::TransactionOpen);
        assert_eq!(
            sim.run_pattern("f1", "missing").unwrap_err(),
            TesterError::UnknownLabel("missing".into())
        );
        sim.end_transaction().unwrap();
        assert_eq!(sim.end_transaction().unwrap_err(), TesterError::NoTransaction);
    }

    #[test]
    fn pattern_outcome_per_site() {
        let mut sim = SimTester::new(3);
        sim.fail_pattern_on("pre", 2);
        sim.begin_transaction().unwrap();
        sim.run_pattern("f1", "pre").unwrap();
        sim.end_transaction().unwrap();
        assert_eq!(sim.pass_fail("f1", 1), Some(true));
        assert_eq!(sim.pass_fail("f1", 2), Some(false));
        assert_eq!(sim.pass_fail("f2", 1), None);
    }

    #[test]
    fn dc_measure_sequences_relays() {
        let mut sim = SimTester::new(2);
        sim.set_dc_reading("VDD", 2, vec![1.25, 1.26]);
        let request = MeasurementDescriptor::builder("VDD")
            .measure(Quantity::Current)
            .force_value(1.8)
            .settling_time(1e-3)
            .build()
            .unwrap()
            .request("IDD", "VDD", Some(10e-3));

        sim.begin_transaction().unwrap();
        sim.dc_measure(&request).unwrap();
        sim.end_transaction().unwrap();

        assert_eq!(
            sim.events(),
            &[
                SimEvent::BeginTransaction,
                SimEvent::RelayEngage(RelayState::PpmuOnAcDcOff),
                SimEvent::Force {
                    pin: "VDD".into(),
                    mode: DcMode::ForceVoltageMeasureCurrent,
                    value: 1.8
                },
                SimEvent::Settle(1e-3),
                SimEvent::Measure { id: "IDD".into(), pin: "VDD".into() },
                SimEvent::RelayRelease(RelayState::AcOnDcPpmuOff),
                SimEvent::EndTransaction,
            ]
        );
        assert_eq!(sim.values("IDD", 2), Some(vec![1.25, 1.26]));
        assert_eq!(sim.values("IDD", 1), Some(vec![0.0]));
    }

    #[test]
    fn dc_measure_rejects_unknown_pin() {
        let mut sim = SimTester::new(1);
        let request = MeasurementDescriptor::builder("X").build().unwrap().request("S", "X", None);
        sim.begin_transaction().unwrap();
        assert_eq!(sim.dc_measure(&request).unwrap_err(), TesterError::UnknownPin("X".into()));
    }

    #[test]
    fn pattern_memory_writes_msb_first() {
        let mut sim = SimTester::new(2);
        sim.add_region("load", "TDI", 8);
        sim.write_word("load", "TDI", SiteScope::Site(2), 2, 4, 0b1001).unwrap();
        assert_eq!(sim.read_bits("load", "TDI", 2, 0, 8), Some(0b0010_0100));
        assert_eq!(sim.read_bits("load", "TDI", 1, 0, 8), Some(0));
        assert_eq!(
            sim.read_word("load", "TDI", 2, 2, 4, ReceiveChannel::default()),
            Ok(0b1001)
        );
    }

    #[test]
    fn pattern_memory_bounds() {
        let mut sim = SimTester::new(2);
        sim.add_region("load", "TDI", 8);
        assert!(matches!(
            sim.write_word("load", "TDI", SiteScope::All, 6, 4, 0),
            Err(TesterError::OutOfRegion { .. })
        ));
        assert!(matches!(
            sim.write_word("load", "TDI", SiteScope::Site(3), 0, 4, 0),
            Err(TesterError::Hardware(_))
        ));
        assert_eq!(
            sim.read_word("nope", "TDI", 1, 0, 4, ReceiveChannel::default()),
            Err(TesterError::UnknownLabel("nope".into()))
        );
        assert!(sim.events().is_empty());
    }
}
