//! Contracts of the tester platform the engine runs on.
//!
//! Site enumeration, pattern execution, the measurement transaction, limits, pin groups
//! and pattern memory all belong to the platform. The engine only sequences them.

use crate::error::TesterError;
use crate::limits::LimitSpec;
use crate::measurement::DcRequest;
use crate::sites::Site;

/// Id under which the pretest pattern result is stored.
pub const PRETEST_ID: &str = "f1";
/// Id under which the shutdown pattern result is stored.
pub const SHUTDOWN_ID: &str = "f2";

/// Direction of an overlay: data is driven into the pattern or received from the DUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OverlayDirection {
    Drive,
    Receive,
}

/// Physical receive-channel index pair used when capturing received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveChannel {
    pub lo: u32,
    pub hi: u32,
}

impl Default for ReceiveChannel {
    fn default() -> Self {
        Self { lo: 3, hi: 4 }
    }
}

/// Which sites a pattern memory write applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteScope {
    All,
    Site(Site),
}

pub trait TestContext {
    fn active_sites(&self) -> Vec<Site>;
    fn configured_sites(&self) -> usize;
    fn test_suite_name(&self) -> String;
    /// Label of the primary pattern of the test suite.
    fn primary_label(&self) -> String;
}

pub trait PinResolver {
    /// Canonical pin name for a pin or single-pin group.
    fn extract_pins_from_group(&self, name: &str) -> Option<String>;
}

pub trait LimitModel {
    fn fetch_limit(&self, suite: &str) -> Option<LimitSpec>;
}

/// The measurement transaction bracket and its result access.
pub trait Rdi {
    fn begin_transaction(&mut self) -> Result<(), TesterError>;
    fn run_pattern(&mut self, id: &str, label: &str) -> Result<(), TesterError>;
    /// Engages the relays, forces, settles, measures and releases the relays.
    fn dc_measure(&mut self, request: &DcRequest) -> Result<(), TesterError>;
    fn end_transaction(&mut self) -> Result<(), TesterError>;

    /// Pass/fail of a pattern executed in the last transaction.
    fn pass_fail(&self, id: &str, site: Site) -> Option<bool>;
    /// Samples of a DC measurement executed in the last transaction.
    fn values(&self, id: &str, site: Site) -> Option<Vec<f64>>;
}

/// Access to pattern memory for overlays.
pub trait PatternMemory {
    /// Length in vectors of the region addressed by label and pin, if it exists.
    fn region_len(&self, label: &str, pin: &str, direction: OverlayDirection) -> Option<usize>;

    /// Writes `word_size` bits of `word`, most significant first, starting at vector `offset`.
    fn write_word(
        &mut self,
        label: &str,
        pin: &str,
        scope: SiteScope,
        offset: usize,
        word_size: u32,
        word: u64,
    ) -> Result<(), TesterError>;

    /// Reads `word_size` captured bits starting at vector `offset` on one site.
    fn read_word(
        &self,
        label: &str,
        pin: &str,
        site: Site,
        offset: usize,
        word_size: u32,
        channel: ReceiveChannel,
    ) -> Result<u64, TesterError>;

    /// Calls a pattern subroutine that shifts `word` into `pin`.
    fn call_subroutine(
        &mut self,
        subroutine: &str,
        pin: &str,
        scope: SiteScope,
        word_size: u32,
        word: u64,
    ) -> Result<(), TesterError>;
}

/// Everything the executor needs from the platform.
pub trait Tester: TestContext + PinResolver + LimitModel + Rdi + PatternMemory {}

impl<T> Tester for T where T: TestContext + PinResolver + LimitModel + Rdi + PatternMemory {}

/// Conditional hooks around the test flow. A gate returning `false` skips the steps that
/// depend on it.
pub trait Gates {
    fn pre_test(&mut self) -> bool {
        true
    }

    fn hold_state(&mut self) -> bool {
        true
    }

    fn post_test(&mut self) {}

    /// Whether background judging should log anything.
    fn process(&mut self) -> bool {
        true
    }

    fn post_process(&mut self) {}
}

/// Gates that always open.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultGates;

impl Gates for DefaultGates {}
