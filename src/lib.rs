//! # DC Measurement Test Method
//!
//! This library contains the core of a DC parametric test method for multi-site automatic
//! test equipment. It sequences a pretest pattern, a DC force/measure and an optional
//! shutdown pattern inside one hardware transaction, finalizes per-site results and judges
//! them against limits, both synchronously per site and deferred in the background.
//!
//! The tester itself is reached through the traits in [`platform`]; [`sim::SimTester`]
//! implements all of them in memory. Pattern overlays (driving data words into pattern
//! memory and decoding received ones) live in [`overlay`].

pub mod bits;
pub mod config;
pub mod console;
pub mod datalog;
pub mod error;
pub mod executor;
pub mod judge;
pub mod limits;
pub mod measurement;
pub mod overlay;
pub mod platform;
pub mod sim;
pub mod site_data;
pub mod sites;

pub use error::{
    BitError, ConfigError, ConfigurationError, EncodingError, SiteError, TestMethodError,
    TesterError,
};
pub use executor::{Phase, TestMethodExecutor, TestMethodParams};
pub use limits::LimitSpec;
pub use measurement::{MeasurementDescriptor, Quantity};
pub use overlay::{OverlayData, OverlayTask};
pub use sites::{Site, SiteSet};
