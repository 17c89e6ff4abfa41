//! DC force/measure descriptors.
//!
//! A [`MeasurementDescriptor`] is built once through [`MeasurementBuilder`], which validates
//! every field. At invocation time it is turned into a [`DcRequest`] for the tester.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// The quantity being measured. The opposite quantity is forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// Force current, measure voltage.
    #[default]
    Voltage,
    /// Force voltage, measure current.
    Current,
}

/// Relay path state of the parametric measurement unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    /// PPMU relay closed, AC and DC relays open.
    PpmuOnAcDcOff,
    /// AC relay closed, DC and PPMU relays open.
    AcOnDcPpmuOff,
    /// All relays open.
    AllOff,
}

/// Relay state to engage before measuring and to restore afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTopology {
    pub engage: RelayState,
    pub release: RelayState,
}

impl Default for RelayTopology {
    fn default() -> Self {
        Self {
            engage: RelayState::PpmuOnAcDcOff,
            release: RelayState::AcOnDcPpmuOff,
        }
    }
}

/// Current ranges of the parametric unit, in amps, smallest first.
pub const CURRENT_RANGES: [f64; 6] = [2e-6, 10e-6, 100e-6, 1e-3, 10e-3, 40e-3];

/// Smallest current range covering the magnitude of `force_value`.
///
/// Returns `None` when the value is not finite or exceeds the largest range.
pub fn autorange(force_value: f64) -> Option<f64> {
    if !force_value.is_finite() {
        return None;
    }
    let magnitude = force_value.abs();
    CURRENT_RANGES.iter().copied().find(|range| magnitude <= *range)
}

/// One DC force/measure operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementDescriptor {
    pub pin: String,
    pub quantity: Quantity,
    pub force_value: f64,
    /// Seconds between forcing and measuring.
    pub settling_time: f64,
    /// Explicit current range in amps.
    pub current_range: Option<f64>,
    pub relay: RelayTopology,
    pub clamp_low: f64,
    pub clamp_high: f64,
    pub averages: u32,
    pub high_accuracy: bool,
}

impl MeasurementDescriptor {
    pub fn builder(pin: impl Into<String>) -> MeasurementBuilder {
        MeasurementBuilder::new(pin)
    }

    /// Resolves the request sent to the tester, with the pin and current range already
    /// resolved by the executor.
    pub fn request(&self, id: &str, pin: &str, current_range: Option<f64>) -> DcRequest {
        let mode = match self.quantity {
            Quantity::Voltage => DcMode::ForceCurrentMeasureVoltage {
                clamp_low: self.clamp_low,
                clamp_high: self.clamp_high,
            },
            Quantity::Current => DcMode::ForceVoltageMeasureCurrent,
        };
        DcRequest {
            id: id.to_string(),
            pin: pin.to_string(),
            mode,
            force_value: self.force_value,
            relay: self.relay,
            settling_time: self.settling_time,
            current_range,
            averages: self.averages,
            high_accuracy: self.high_accuracy,
        }
    }
}

/// Builder with the defaults of the DC measurement test method.
#[derive(Debug, Clone)]
pub struct MeasurementBuilder {
    descriptor: MeasurementDescriptor,
}

impl MeasurementBuilder {
    pub fn new(pin: impl Into<String>) -> Self {
        Self {
            descriptor: MeasurementDescriptor {
                pin: pin.into(),
                quantity: Quantity::Voltage,
                force_value: 0.0,
                settling_time: 0.0,
                current_range: None,
                relay: RelayTopology::default(),
                clamp_low: 0.0,
                clamp_high: 3.0,
                averages: 1,
                high_accuracy: true,
            },
        }
    }

    pub fn measure(mut self, quantity: Quantity) -> Self {
        self.descriptor.quantity = quantity;
        self
    }

    pub fn force_value(mut self, value: f64) -> Self {
        self.descriptor.force_value = value;
        self
    }

    pub fn settling_time(mut self, seconds: f64) -> Self {
        self.descriptor.settling_time = seconds;
        self
    }

    pub fn current_range(mut self, amps: f64) -> Self {
        self.descriptor.current_range = Some(amps);
        self
    }

    pub fn relay(mut self, relay: RelayTopology) -> Self {
        self.descriptor.relay = relay;
        self
    }

    pub fn clamp(mut self, low: f64, high: f64) -> Self {
        self.descriptor.clamp_low = low;
        self.descriptor.clamp_high = high;
        self
    }

    pub fn averages(mut self, count: u32) -> Self {
        self.descriptor.averages = count;
        self
    }

    pub fn high_accuracy(mut self, enabled: bool) -> Self {
        self.descriptor.high_accuracy = enabled;
        self
    }

    pub fn build(self) -> Result<MeasurementDescriptor, ConfigurationError> {
        let d = self.descriptor;
        let invalid = |msg: String| Err(ConfigurationError::InvalidDescriptor(msg));

        if d.pin.trim().is_empty() {
            return invalid("pin must not be empty".into());
        }
        if !d.force_value.is_finite() {
            return invalid(format!("force value {} is not finite", d.force_value));
        }
        if !d.settling_time.is_finite() || d.settling_time < 0.0 {
            return invalid(format!("settling time {} s is invalid", d.settling_time));
        }
        if let Some(range) = d.current_range {
            if !range.is_finite() || range <= 0.0 {
                return invalid(format!("current range {} A must be positive", range));
            }
        }
        if d.clamp_low > d.clamp_high {
            return invalid(format!(
                "clamp low {} V exceeds clamp high {} V",
                d.clamp_low, d.clamp_high
            ));
        }
        if d.averages == 0 {
            return invalid("averages must be at least 1".into());
        }
        Ok(d)
    }
}

/// Force/measure direction of a DC request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DcMode {
    ForceCurrentMeasureVoltage { clamp_low: f64, clamp_high: f64 },
    ForceVoltageMeasureCurrent,
}

/// Fully resolved DC operation handed to the tester. Results are retrieved under `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct DcRequest {
    pub id: String,
    pub pin: String,
    pub mode: DcMode,
    pub force_value: f64,
    pub relay: RelayTopology,
    pub settling_time: f64,
    pub current_range: Option<f64>,
    pub averages: u32,
    pub high_accuracy: bool,
}
