//! Configuration loading from a TOML file.
//!
//! A file has three sections: `[test_method]` holds the measurement parameters, `[limits]`
//! the limit of the test suite, and `[tester]` describes the simulated tester the CLI runs
//! against.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigurationError};
use crate::executor::TestMethodParams;
use crate::limits::LimitSpec;
use crate::measurement::{MeasurementDescriptor, Quantity, RelayTopology};
use crate::sim::SimTester;
use crate::sites::Site;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub test_method: TestMethodConfig,
    /// Limit of the test suite. Without it every parametric result passes.
    #[serde(default)]
    pub limits: Option<LimitSpec>,
    #[serde(default)]
    pub tester: TesterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMethodConfig {
    /// Pin or single-pin group to measure
    #[serde(default = "default_pin")]
    pub pin: String,
    #[serde(default)]
    pub measure: Quantity,
    #[serde(default)]
    pub force_value: f64,
    /// Seconds
    #[serde(default = "default_settling_time")]
    pub settling_time: f64,
    /// Amps
    #[serde(default)]
    pub current_range: Option<f64>,
    #[serde(default = "default_true")]
    pub apply_shutdown: bool,
    #[serde(default)]
    pub shutdown_pattern: Option<String>,
    #[serde(default)]
    pub clamp_low: f64,
    #[serde(default = "default_clamp_high")]
    pub clamp_high: f64,
    #[serde(default = "default_averages")]
    pub averages: u32,
    #[serde(default = "default_true")]
    pub high_accuracy: bool,
    #[serde(default)]
    pub scale_to_limit_units: bool,
    #[serde(default)]
    pub relay: RelayTopology,
}

impl Default for TestMethodConfig {
    fn default() -> Self {
        Self {
            pin: default_pin(),
            measure: Quantity::default(),
            force_value: 0.0,
            settling_time: default_settling_time(),
            current_range: None,
            apply_shutdown: true,
            shutdown_pattern: None,
            clamp_low: 0.0,
            clamp_high: default_clamp_high(),
            averages: default_averages(),
            high_accuracy: true,
            scale_to_limit_units: false,
            relay: RelayTopology::default(),
        }
    }
}

fn default_pin() -> String {
    "NVM_ANALOG".to_string()
}
fn default_settling_time() -> f64 {
    1e-3
}
fn default_true() -> bool {
    true
}
fn default_clamp_high() -> f64 {
    3.0
}
fn default_averages() -> u32 {
    1
}

impl TryFrom<&TestMethodConfig> for TestMethodParams {
    type Error = ConfigurationError;

    fn try_from(cfg: &TestMethodConfig) -> Result<Self, Self::Error> {
        let mut builder = MeasurementDescriptor::builder(cfg.pin.as_str())
            .measure(cfg.measure)
            .force_value(cfg.force_value)
            .settling_time(cfg.settling_time)
            .relay(cfg.relay)
            .clamp(cfg.clamp_low, cfg.clamp_high)
            .averages(cfg.averages)
            .high_accuracy(cfg.high_accuracy);
        if let Some(range) = cfg.current_range {
            builder = builder.current_range(range);
        }

        let mut params = TestMethodParams::new(builder.build()?)
            .apply_shutdown(cfg.apply_shutdown)
            .scale_to_limit_units(cfg.scale_to_limit_units);
        params.shutdown_pattern = cfg.shutdown_pattern.clone();
        Ok(params)
    }
}

/// A simulated pattern and the sites it fails on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub label: String,
    #[serde(default)]
    pub fail_on: Vec<Site>,
}

/// A pattern memory region available for overlays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub label: String,
    pub pin: String,
    /// Length in vectors
    pub len: usize,
}

/// DC samples the simulated tester returns for a pin on one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingConfig {
    pub pin: String,
    pub site: Site,
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterConfig {
    /// Number of configured sites
    #[serde(default = "default_sites")]
    pub sites: usize,
    /// Active sites; all configured sites when omitted
    #[serde(default)]
    pub active_sites: Option<Vec<Site>>,
    #[serde(default = "default_suite")]
    pub suite: String,
    #[serde(default = "default_primary_label")]
    pub primary_label: String,
    /// Group name -> pin
    #[serde(default)]
    pub pin_groups: BTreeMap<String, String>,
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub readings: Vec<ReadingConfig>,
}

impl Default for TesterConfig {
    fn default() -> Self {
        let label = default_primary_label();
        Self {
            sites: default_sites(),
            active_sites: None,
            suite: default_suite(),
            pin_groups: [(default_pin(), "NVM_ANALOGIO".to_string())].into_iter().collect(),
            patterns: vec![
                PatternConfig { label: format!("{}_part1", label), fail_on: Vec::new() },
                PatternConfig { label: label.clone(), fail_on: Vec::new() },
            ],
            primary_label: label,
            regions: Vec::new(),
            readings: Vec::new(),
        }
    }
}

fn default_sites() -> usize {
    4
}
fn default_suite() -> String {
    "DC_Measurement".to_string()
}
fn default_primary_label() -> String {
    "dc_meas".to_string()
}

impl TesterConfig {
    /// Builds the simulated tester; `limits` is registered for the configured suite.
    pub fn build(&self, limits: Option<&LimitSpec>) -> SimTester {
        let mut sim = SimTester::new(self.sites);
        if let Some(active) = &self.active_sites {
            sim.set_active_sites(active.iter().copied());
        }
        sim.set_test_suite(self.suite.as_str(), self.primary_label.as_str());
        for (group, pin) in &self.pin_groups {
            sim.add_pin_group(group.as_str(), pin.as_str());
        }
        for pattern in &self.patterns {
            sim.add_pattern(pattern.label.as_str());
            for &site in &pattern.fail_on {
                sim.fail_pattern_on(pattern.label.as_str(), site);
            }
        }
        for region in &self.regions {
            sim.add_region(region.label.as_str(), region.pin.as_str(), region.len);
        }
        for reading in &self.readings {
            sim.set_dc_reading(reading.pin.as_str(), reading.site, reading.samples.clone());
        }
        if let Some(limits) = limits {
            sim.set_limit(self.suite.as_str(), limits.clone());
        }
        sim
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn params(&self) -> Result<TestMethodParams, ConfigError> {
        Ok(TestMethodParams::try_from(&self.test_method)?)
    }

    pub fn build_tester(&self) -> SimTester {
        self.tester.build(self.limits.as_ref())
    }

    /// Commented configuration that runs out of the box.
    pub fn default_toml() -> String {
        r#"# DC measurement test method

[test_method]
# Pin or pin group to measure
pin = "NVM_ANALOG"
# "voltage" forces current and measures voltage, "current" forces voltage and measures current
measure = "current"
force_value = 1.8
# Seconds
settling_time = 0.001
# Amps. Derived from force_value for current measurements when omitted
current_range = 0.01
apply_shutdown = true
# Defaults to "<primary label>_part1"
# shutdown_pattern = "dc_meas_part1"
clamp_low = 0.0
clamp_high = 3.0
averages = 1
high_accuracy = true
# Scale amps/volts into the unit prefix of the limits
scale_to_limit_units = true

[limits]
units = "mA"
low = { op = "GE", value = 0.5 }
high = { op = "LE", value = 2.0 }

[tester]
sites = 4
active_sites = [1, 2, 3, 4]
suite = "DC_Measurement"
primary_label = "dc_meas"
pin_groups = { NVM_ANALOG = "NVM_ANALOGIO" }

[[tester.patterns]]
label = "dc_meas"
fail_on = [3]

[[tester.patterns]]
label = "dc_meas_part1"

[[tester.regions]]
label = "dc_meas"
pin = "TDI"
len = 64

[[tester.regions]]
label = "dc_meas_part1"
pin = "TDO"
len = 32

[[tester.readings]]
pin = "NVM_ANALOGIO"
site = 1
samples = [0.0012]

[[tester.readings]]
pin = "NVM_ANALOGIO"
site = 2
samples = [0.0009, 0.0011]

[[tester.readings]]
pin = "NVM_ANALOGIO"
site = 3
samples = [0.0013]

[[tester.readings]]
pin = "NVM_ANALOGIO"
site = 4
samples = [0.0025]
"#
        .to_string()
    }
}
