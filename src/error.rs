//! Error taxonomy for the test-method engine.
//!
//! Gate predicates returning `false` are not errors and never show up here; they are
//! ordinary branches of the test flow.

use thiserror::Error;

use crate::sites::Site;

/// Failures of the pure bit helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitError {
    /// The bit index does not address a bit inside the word.
    #[error("bit index {index} is outside a {width}-bit word")]
    IndexOutOfRange { index: u32, width: u32 },
}

/// An invalid active/configured site combination.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SiteError {
    #[error("no sites are configured")]
    NoConfiguredSites,
    /// Site numbers are 1-based; slot 0 of per-site storage is never used.
    #[error("site 0 is not a valid site number")]
    ZeroSite,
    #[error("active site {site} is not one of the {configured} configured sites")]
    NotConfigured { site: Site, configured: usize },
    #[error("site {0} is listed as active more than once")]
    Duplicate(Site),
}

/// Fatal problems found while resolving the test-method configuration.
///
/// These abort the invocation before any hardware transaction is opened.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("pin or pin group '{0}' could not be resolved")]
    UnresolvedPin(String),
    #[error("no current range is available for pin '{pin}' (force value {force_value})")]
    MissingCurrentRange { pin: String, force_value: f64 },
    /// Deriving the current range from limits for a voltage measurement is not implemented.
    #[error("automatic current range for voltage measurement on '{pin}' is not supported, supply current_range explicitly")]
    VoltageAutoRangeUnsupported { pin: String },
    #[error("invalid measurement descriptor: {0}")]
    InvalidDescriptor(String),
    #[error(transparent)]
    Sites(#[from] SiteError),
}

/// Overlay encoding failures. Raised before any pattern memory is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("word size must be between 1 and 64 bits, got {0}")]
    InvalidWordSize(u32),
    #[error("data width must be at most 64 bits, got {0}")]
    InvalidWidth(u32),
    #[error("no overlay region for label '{label}' on pin '{pin}'")]
    RegionNotFound { label: String, pin: String },
    #[error("word size {word_size} does not evenly divide the {len}-vector region")]
    RegionMisaligned { len: usize, word_size: u32 },
    #[error("start offset {start} is beyond the {len}-vector region")]
    StartOutOfBounds { start: usize, len: usize },
    #[error("{width} bits of data need {words} words but only {available} fit after offset {start}")]
    DataTooWide {
        width: u32,
        words: usize,
        available: usize,
        start: usize,
    },
    #[error("value {value:#X} does not fit in {width} bits")]
    ValueExceedsWidth { value: u64, width: u32 },
    #[error("no overlay data supplied for active site {0}")]
    MissingSiteData(Site),
    #[error("receive channel indices are invalid (lo {lo}, hi {hi})")]
    InvalidReceiveChannel { lo: u32, hi: u32 },
}

/// Faults reported by a tester platform implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TesterError {
    #[error("unknown pattern label '{0}'")]
    UnknownLabel(String),
    #[error("unknown pin '{0}'")]
    UnknownPin(String),
    #[error("no transaction is open")]
    NoTransaction,
    #[error("a transaction is already open")]
    TransactionOpen,
    #[error("pattern memory access outside region '{label}' at vector {offset}")]
    OutOfRegion { label: String, offset: usize },
    #[error("hardware fault: {0}")]
    Hardware(String),
}

/// Anything that can abort one test-method invocation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TestMethodError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Tester(#[from] TesterError),
}

/// Problems loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigurationError),
}
