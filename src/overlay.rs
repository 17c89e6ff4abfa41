//! Pattern overlay: placing data words into pattern memory and reading them back.
//!
//! A value of `width` bits is split into `ceil(width / word_size)` words, most significant
//! word first. Word `i` occupies vectors `start + i * word_size ..` of the region addressed by
//! label and pin, most significant bit first. The same layout is used to reassemble words on
//! the receive side, so driving a value and receiving the same region returns it unchanged.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::bits::{low_mask, significant_bits};
use crate::error::{EncodingError, TestMethodError, TesterError};
use crate::platform::{OverlayDirection, PatternMemory, ReceiveChannel, SiteScope};
use crate::sites::{Site, SiteSet};

/// Data carried by an overlay task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayData {
    /// One value broadcast to every site.
    Scalar(u64),
    /// A distinct value per site.
    PerSite(BTreeMap<Site, u64>),
}

impl OverlayData {
    pub fn value_for(&self, site: Site) -> Option<u64> {
        match self {
            OverlayData::Scalar(value) => Some(*value),
            OverlayData::PerSite(values) => values.get(&site).copied(),
        }
    }
}

impl From<u64> for OverlayData {
    fn from(value: u64) -> Self {
        OverlayData::Scalar(value)
    }
}

impl From<BTreeMap<Site, u64>> for OverlayData {
    fn from(values: BTreeMap<Site, u64>) -> Self {
        OverlayData::PerSite(values)
    }
}

/// One overlay of a data value into a labeled pattern region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayTask {
    /// Pattern (or subroutine) label.
    pub label: String,
    pub pin: String,
    /// Drive: the value written. Receive: decoded bits are merged in after every read-back.
    pub data: OverlayData,
    /// Value a receive overlay compares its read-back against.
    pub expected: Option<OverlayData>,
    pub word_size: u32,
    /// Total number of data bits.
    pub width: u32,
    /// First vector of the data inside the region.
    pub start: usize,
    /// Drive: echo every written word to the log. Receive: compare the decoded value with
    /// `expected`.
    pub rbits: bool,
    pub direction: OverlayDirection,
    pub channel: ReceiveChannel,
}

impl OverlayTask {
    /// A drive overlay of one `word_size`-bit word at vector 0.
    pub fn drive(
        label: impl Into<String>,
        pin: impl Into<String>,
        data: impl Into<OverlayData>,
        word_size: u32,
    ) -> Self {
        Self {
            label: label.into(),
            pin: pin.into(),
            data: data.into(),
            expected: None,
            word_size,
            width: word_size,
            start: 0,
            rbits: true,
            direction: OverlayDirection::Drive,
            channel: ReceiveChannel::default(),
        }
    }

    /// A receive overlay of one `word_size`-bit word at vector 0.
    pub fn receive(label: impl Into<String>, pin: impl Into<String>, word_size: u32) -> Self {
        Self {
            data: OverlayData::Scalar(0),
            rbits: false,
            direction: OverlayDirection::Receive,
            ..Self::drive(label, pin, 0, word_size)
        }
    }

    pub fn width(mut self, bits: u32) -> Self {
        self.width = bits;
        self
    }

    pub fn start(mut self, vector: usize) -> Self {
        self.start = vector;
        self
    }

    pub fn rbits(mut self, enabled: bool) -> Self {
        self.rbits = enabled;
        self
    }

    /// Expected data for a receive overlay; enables read-back validation.
    pub fn expecting(mut self, data: impl Into<OverlayData>) -> Self {
        self.expected = Some(data.into());
        self.rbits = true;
        self
    }

    pub fn channel(mut self, lo: u32, hi: u32) -> Self {
        self.channel = ReceiveChannel { lo, hi };
        self
    }
}

/// One word-level pattern memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayOp {
    Write { scope: SiteScope, offset: usize, word: u64 },
    Read { site: Site, offset: usize },
    Call { scope: SiteScope, word: u64 },
}

/// Validated sequence of operations for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPlan {
    pub label: String,
    pub pin: String,
    pub direction: OverlayDirection,
    pub word_size: u32,
    pub width: u32,
    pub channel: ReceiveChannel,
    pub ops: Vec<OverlayOp>,
}

/// Order in which subroutine overlays walk the words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    MostSignificantFirst,
    LeastSignificantFirst,
}

/// What applying a plan produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayOutcome {
    pub words_written: usize,
    pub subroutine_calls: usize,
    /// Decoded value per site for receive overlays.
    pub received: BTreeMap<Site, u64>,
    /// Sites whose decoded value differs from the expected data.
    pub mismatches: Vec<Site>,
}

pub fn word_count(width: u32, word_size: u32) -> usize {
    if word_size == 0 {
        return 0;
    }
    width.div_ceil(word_size) as usize
}

/// Splits the low `width` bits of `value` into words, most significant word first.
pub fn split_words(value: u64, width: u32, word_size: u32) -> Vec<u64> {
    let count = word_count(width, word_size);
    let mask = low_mask(word_size);
    (0..count)
        .map(|i| {
            let shift = (count - 1 - i) as u32 * word_size;
            value.checked_shr(shift).unwrap_or(0) & mask
        })
        .collect()
}

/// Reassembles words produced by [`split_words`] and keeps the low `width` bits.
pub fn join_words(words: &[u64], width: u32, word_size: u32) -> u64 {
    let mask = low_mask(word_size);
    let acc = words.iter().fold(0u128, |acc, word| {
        (acc << word_size) | u128::from(word & mask)
    });
    (acc as u64) & low_mask(width)
}

fn check_shape(task: &OverlayTask) -> Result<(), EncodingError> {
    if task.word_size == 0 || task.word_size > u64::BITS {
        return Err(EncodingError::InvalidWordSize(task.word_size));
    }
    if task.width > u64::BITS {
        return Err(EncodingError::InvalidWidth(task.width));
    }
    if task.direction == OverlayDirection::Receive && task.channel.lo >= task.channel.hi {
        return Err(EncodingError::InvalidReceiveChannel {
            lo: task.channel.lo,
            hi: task.channel.hi,
        });
    }
    Ok(())
}

fn check_fits(value: u64, width: u32) -> Result<u64, EncodingError> {
    if significant_bits(value) > width {
        return Err(EncodingError::ValueExceedsWidth { value, width });
    }
    Ok(value)
}

/// Resolves the value of every write, one entry per scope.
fn drive_values(task: &OverlayTask, sites: &SiteSet) -> Result<Vec<(SiteScope, u64)>, EncodingError> {
    match &task.data {
        OverlayData::Scalar(value) => Ok(vec![(SiteScope::All, check_fits(*value, task.width)?)]),
        OverlayData::PerSite(values) => sites
            .active()
            .iter()
            .map(|&site| -> Result<(SiteScope, u64), EncodingError> {
                let value = values
                    .get(&site)
                    .copied()
                    .ok_or(EncodingError::MissingSiteData(site))?;
                Ok((SiteScope::Site(site), check_fits(value, task.width)?))
            })
            .collect(),
    }
}

fn empty_plan(task: &OverlayTask) -> OverlayPlan {
    OverlayPlan {
        label: task.label.clone(),
        pin: task.pin.clone(),
        direction: task.direction,
        word_size: task.word_size,
        width: task.width,
        channel: task.channel,
        ops: Vec::new(),
    }
}

/// Validates a task against pattern memory and builds its word operations.
///
/// Nothing is written; every encoding error surfaces here.
pub fn encode<M>(task: &OverlayTask, sites: &SiteSet, memory: &M) -> Result<OverlayPlan, EncodingError>
where
    M: PatternMemory + ?Sized,
{
    check_shape(task)?;
    let len = memory
        .region_len(&task.label, &task.pin, task.direction)
        .ok_or_else(|| EncodingError::RegionNotFound {
            label: task.label.clone(),
            pin: task.pin.clone(),
        })?;

    let mut plan = empty_plan(task);
    if task.width == 0 {
        return Ok(plan);
    }

    let word_size = task.word_size as usize;
    if len % word_size != 0 {
        return Err(EncodingError::RegionMisaligned {
            len,
            word_size: task.word_size,
        });
    }
    if task.start >= len {
        return Err(EncodingError::StartOutOfBounds {
            start: task.start,
            len,
        });
    }
    let words = word_count(task.width, task.word_size);
    let available = (len - task.start) / word_size;
    if words > available {
        return Err(EncodingError::DataTooWide {
            width: task.width,
            words,
            available,
            start: task.start,
        });
    }

    let offset = |i: usize| task.start + i * word_size;
    match task.direction {
        OverlayDirection::Drive => {
            for (scope, value) in drive_values(task, sites)? {
                let split = split_words(value, task.width, task.word_size);
                plan.ops.extend(
                    split
                        .into_iter()
                        .enumerate()
                        .map(|(i, word)| OverlayOp::Write { scope, offset: offset(i), word }),
                );
            }
        }
        OverlayDirection::Receive => {
            for &site in sites.active() {
                plan.ops
                    .extend((0..words).map(|i| OverlayOp::Read { site, offset: offset(i) }));
            }
        }
    }
    debug!(
        label = %task.label,
        pin = %task.pin,
        direction = ?task.direction,
        ops = plan.ops.len(),
        "overlay planned"
    );
    Ok(plan)
}

/// Builds per-word subroutine calls for a drive task whose label names a subroutine.
pub fn encode_subroutine(
    task: &OverlayTask,
    sites: &SiteSet,
    order: WordOrder,
) -> Result<OverlayPlan, EncodingError> {
    check_shape(task)?;
    let mut plan = empty_plan(task);
    plan.direction = OverlayDirection::Drive;
    for (scope, value) in drive_values(task, sites)? {
        let mut words = split_words(value, task.width, task.word_size);
        if order == WordOrder::LeastSignificantFirst {
            words.reverse();
        }
        plan.ops
            .extend(words.into_iter().map(|word| OverlayOp::Call { scope, word }));
    }
    Ok(plan)
}

/// Executes a plan. Receive results are written back into the task's data.
pub fn apply<M>(
    task: &mut OverlayTask,
    plan: &OverlayPlan,
    memory: &mut M,
) -> Result<OverlayOutcome, TesterError>
where
    M: PatternMemory + ?Sized,
{
    let mut outcome = OverlayOutcome::default();
    let mut captured: BTreeMap<Site, Vec<u64>> = BTreeMap::new();

    for op in &plan.ops {
        match *op {
            OverlayOp::Write { scope, offset, word } => {
                memory.write_word(&plan.label, &plan.pin, scope, offset, plan.word_size, word)?;
                if task.rbits {
                    debug!(label = %plan.label, ?scope, offset, word = format_args!("{:#X}", word), "overlay word");
                }
                outcome.words_written += 1;
            }
            OverlayOp::Read { site, offset } => {
                let word = memory.read_word(
                    &plan.label,
                    &plan.pin,
                    site,
                    offset,
                    plan.word_size,
                    plan.channel,
                )?;
                captured.entry(site).or_default().push(word);
            }
            OverlayOp::Call { scope, word } => {
                memory.call_subroutine(&plan.label, &plan.pin, scope, plan.word_size, word)?;
                outcome.subroutine_calls += 1;
            }
        }
    }

    if !captured.is_empty() {
        let mask = low_mask(plan.width);
        let mut updated = match &task.data {
            OverlayData::PerSite(values) => values.clone(),
            OverlayData::Scalar(_) => BTreeMap::new(),
        };
        for (site, words) in captured {
            let decoded = join_words(&words, plan.width, plan.word_size);
            if task.rbits {
                let expected = task
                    .expected
                    .as_ref()
                    .and_then(|data| data.value_for(site))
                    .map(|value| value & mask);
                if expected != Some(decoded) {
                    warn!(
                        site,
                        label = %plan.label,
                        ?expected,
                        decoded,
                        "overlay read-back mismatch"
                    );
                    outcome.mismatches.push(site);
                }
            }
            let previous = task.data.value_for(site).unwrap_or(0);
            updated.insert(site, (previous & !mask) | decoded);
            outcome.received.insert(site, decoded);
        }
        task.data = OverlayData::PerSite(updated);
    }
    Ok(outcome)
}

/// Encodes and applies a task against pattern memory.
pub fn overlay<M>(
    task: &mut OverlayTask,
    sites: &SiteSet,
    memory: &mut M,
) -> Result<OverlayOutcome, TestMethodError>
where
    M: PatternMemory + ?Sized,
{
    let plan = encode(task, sites, memory)?;
    Ok(apply(task, &plan, memory)?)
}

/// Drives a task through per-word subroutine calls, most significant word first.
pub fn overlay_subroutine<M>(
    task: &mut OverlayTask,
    sites: &SiteSet,
    memory: &mut M,
) -> Result<OverlayOutcome, TestMethodError>
where
    M: PatternMemory + ?Sized,
{
    let plan = encode_subroutine(task, sites, WordOrder::MostSignificantFirst)?;
    Ok(apply(task, &plan, memory)?)
}

/// Like [`overlay_subroutine`] but least significant word first.
pub fn reverse_overlay_subroutine<M>(
    task: &mut OverlayTask,
    sites: &SiteSet,
    memory: &mut M,
) -> Result<OverlayOutcome, TestMethodError>
where
    M: PatternMemory + ?Sized,
{
    let plan = encode_subroutine(task, sites, WordOrder::LeastSignificantFirst)?;
    Ok(apply(task, &plan, memory)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimEvent, SimTester};

    fn tester() -> SimTester {
        let mut sim = SimTester::new(4);
        sim.add_region("otp_load", "TDI", 32);
        sim
    }

    fn sites() -> SiteSet {
        SiteSet::new([1, 2, 3, 4], 4).unwrap()
    }

    #[test]
    fn splits_most_significant_word_first() {
        assert_eq!(split_words(0xABCD, 16, 4), vec![0xA, 0xB, 0xC, 0xD]);
        assert_eq!(split_words(0b1_0110, 5, 2), vec![0b01, 0b01, 0b10]);
        assert_eq!(split_words(u64::MAX, 64, 64), vec![u64::MAX]);
        assert_eq!(join_words(&[0xA, 0xB, 0xC, 0xD], 16, 4), 0xABCD);
        assert_eq!(join_words(&[0b11, 0b01, 0b10], 5, 2), 0b1_0110);
    }

    #[test]
    fn drive_scalar_writes_every_site() {
        let mut sim = tester();
        let mut task = OverlayTask::drive("otp_load", "TDI", 0xA5u64, 4).width(8).start(8);
        let outcome = overlay(&mut task, &sites(), &mut sim).unwrap();
        assert_eq!(outcome.words_written, 2);
        for site in 1..=4 {
            assert_eq!(sim.read_bits("otp_load", "TDI", site, 8, 8), Some(0xA5));
            assert_eq!(sim.read_bits("otp_load", "TDI", site, 0, 8), Some(0));
        }
    }

    #[test]
    fn drive_per_site_values() {
        let mut sim = tester();
        let sites = SiteSet::new([1, 3], 4).unwrap();
        let data: BTreeMap<Site, u64> = [(1, 0x1), (3, 0xE)].into_iter().collect();
        let mut task = OverlayTask::drive("otp_load", "TDI", data, 4);
        overlay(&mut task, &sites, &mut sim).unwrap();
        assert_eq!(sim.read_bits("otp_load", "TDI", 1, 0, 4), Some(0x1));
        assert_eq!(sim.read_bits("otp_load", "TDI", 3, 0, 4), Some(0xE));
        assert_eq!(sim.read_bits("otp_load", "TDI", 2, 0, 4), Some(0));
    }

    #[test]
    fn per_site_data_must_cover_active_sites() {
        let sim = tester();
        let data: BTreeMap<Site, u64> = [(1, 0x1)].into_iter().collect();
        let task = OverlayTask::drive("otp_load", "TDI", data, 4);
        assert_eq!(
            encode(&task, &SiteSet::new([1, 2], 4).unwrap(), &sim).unwrap_err(),
            EncodingError::MissingSiteData(2)
        );
    }

    #[test]
    fn drive_then_receive_round_trips() {
        let mut sim = tester();
        sim.add_region("trim", "TDI", 48);
        let mut drive = OverlayTask::drive("trim", "TDI", 0x2DEADu64, 6).width(18).start(12);
        overlay(&mut drive, &sites(), &mut sim).unwrap();

        let mut receive = OverlayTask::receive("trim", "TDI", 6).width(18).start(12);
        let outcome = overlay(&mut receive, &sites(), &mut sim).unwrap();
        for site in 1..=4 {
            assert_eq!(outcome.received[&site], 0x2DEAD);
            assert_eq!(receive.data.value_for(site), Some(0x2DEAD));
        }
        assert!(outcome.mismatches.is_empty());
    }

    #[test]
    fn receive_preserves_bits_outside_the_word() {
        let mut sim = tester();
        sim.load_capture("otp_load", "TDI", 2, 0, 8, 0x3C).unwrap();
        let sites = SiteSet::new([2], 4).unwrap();
        let mut task = OverlayTask::receive("otp_load", "TDI", 8).expecting(0x11u64);
        task.data = OverlayData::Scalar(0xFF00_FF11);
        let outcome = overlay(&mut task, &sites, &mut sim).unwrap();
        assert_eq!(task.data.value_for(2), Some(0xFF00_FF3C));
        assert_eq!(task.expected, Some(OverlayData::Scalar(0x11)));
        assert_eq!(outcome.mismatches, vec![2]);
    }

    #[test]
    fn receive_keeps_per_site_data_of_sites_not_read() {
        let mut sim = tester();
        sim.load_capture("otp_load", "TDI", 1, 0, 4, 0x6).unwrap();
        let data: BTreeMap<Site, u64> = [(1, 0xF0), (4, 0x77)].into_iter().collect();
        let mut task = OverlayTask::receive("otp_load", "TDI", 4);
        task.data = OverlayData::PerSite(data);
        overlay(&mut task, &SiteSet::new([1], 4).unwrap(), &mut sim).unwrap();
        assert_eq!(task.data.value_for(1), Some(0xF6));
        assert_eq!(task.data.value_for(4), Some(0x77));
    }

    #[test]
    fn repeated_receive_compares_against_the_same_expectation() {
        let mut sim = tester();
        sim.load_capture("otp_load", "TDI", 1, 0, 4, 0x8).unwrap();
        let sites = SiteSet::new([1], 4).unwrap();
        let mut task = OverlayTask::receive("otp_load", "TDI", 4).expecting(0x9u64);
        for _ in 0..3 {
            let outcome = overlay(&mut task, &sites, &mut sim).unwrap();
            assert_eq!(outcome.mismatches, vec![1]);
        }
    }

    #[test]
    fn receive_validation_passes_on_match() {
        let mut sim = tester();
        sim.load_capture("otp_load", "TDI", 1, 4, 4, 0x9).unwrap();
        let sites = SiteSet::new([1], 4).unwrap();
        let mut task = OverlayTask::receive("otp_load", "TDI", 4).start(4).expecting(0x9u64);
        let outcome = overlay(&mut task, &sites, &mut sim).unwrap();
        assert!(outcome.mismatches.is_empty());
        assert_eq!(outcome.received[&1], 0x9);
    }

    #[test]
    fn encoding_errors_abort_before_any_write() {
        let mut sim = tester();
        let all = sites();
        let cases = [
            (
                OverlayTask::drive("otp_load", "TDI", 0u64, 5),
                EncodingError::RegionMisaligned { len: 32, word_size: 5 },
            ),
            (
                OverlayTask::drive("otp_load", "TDI", 0u64, 4).start(40),
                EncodingError::StartOutOfBounds { start: 40, len: 32 },
            ),
            (
                OverlayTask::drive("otp_load", "TDI", 0u64, 4).start(32),
                EncodingError::StartOutOfBounds { start: 32, len: 32 },
            ),
            (
                OverlayTask::drive("otp_load", "TDI", 0u64, 8).width(40),
                EncodingError::DataTooWide { width: 40, words: 5, available: 4, start: 0 },
            ),
            (
                OverlayTask::drive("otp_load", "TDI", 0x1Fu64, 4),
                EncodingError::ValueExceedsWidth { value: 0x1F, width: 4 },
            ),
            (
                OverlayTask::drive("missing", "TDI", 0u64, 4),
                EncodingError::RegionNotFound { label: "missing".into(), pin: "TDI".into() },
            ),
            (OverlayTask::drive("otp_load", "TDI", 0u64, 0), EncodingError::InvalidWordSize(0)),
            (
                OverlayTask::receive("otp_load", "TDI", 4).channel(4, 3),
                EncodingError::InvalidReceiveChannel { lo: 4, hi: 3 },
            ),
        ];
        for (mut task, expected) in cases {
            let err = overlay(&mut task, &all, &mut sim).unwrap_err();
            assert_eq!(err, TestMethodError::Encoding(expected));
        }
        assert!(sim.events().is_empty());
    }

    #[test]
    fn zero_width_is_a_validated_no_op() {
        let mut sim = tester();
        let mut task = OverlayTask::drive("otp_load", "TDI", 0u64, 4).width(0);
        let outcome = overlay(&mut task, &sites(), &mut sim).unwrap();
        assert_eq!(outcome, OverlayOutcome::default());

        let mut missing = OverlayTask::drive("nowhere", "TDI", 0u64, 4).width(0);
        assert!(overlay(&mut missing, &sites(), &mut sim).is_err());
    }

    #[test]
    fn subroutine_variants_walk_words_in_order() {
        let mut sim = tester();
        let sites = SiteSet::new([1], 4).unwrap();
        let mut task = OverlayTask::drive("shift_in", "TDI", 0x123u64, 4).width(12);

        overlay_subroutine(&mut task, &sites, &mut sim).unwrap();
        reverse_overlay_subroutine(&mut task, &sites, &mut sim).unwrap();

        let words: Vec<u64> = sim
            .events()
            .iter()
            .filter_map(|event| match event {
                SimEvent::Subroutine { word, .. } => Some(*word),
                _ => None,
            })
            .collect();
        assert_eq!(words, vec![0x1, 0x2, 0x3, 0x3, 0x2, 0x1]);
    }

    #[test]
    fn subroutine_per_site_calls_are_scoped() {
        let mut sim = tester();
        let sites = SiteSet::new([1, 3], 4).unwrap();
        let data: BTreeMap<Site, u64> = [(1, 0x12), (3, 0xAB)].into_iter().collect();
        let mut task = OverlayTask::drive("shift_in", "TDI", data, 4).width(8);

        let outcome = overlay_subroutine(&mut task, &sites, &mut sim).unwrap();
        assert_eq!(outcome.subroutine_calls, 4);
        let calls: Vec<(SiteScope, u64)> = sim
            .events()
            .iter()
            .filter_map(|event| match event {
                SimEvent::Subroutine { scope, word, .. } => Some((*scope, *word)),
                _ => None,
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                (SiteScope::Site(1), 0x1),
                (SiteScope::Site(1), 0x2),
                (SiteScope::Site(3), 0xA),
                (SiteScope::Site(3), 0xB),
            ]
        );
    }

    #[test]
    fn subroutine_rejects_bad_data_before_any_call() {
        let mut sim = tester();
        let sites = SiteSet::new([1, 2], 4).unwrap();
        let data: BTreeMap<Site, u64> = [(1, 0x1)].into_iter().collect();

        let mut missing = OverlayTask::drive("shift_in", "TDI", data, 4);
        assert_eq!(
            overlay_subroutine(&mut missing, &sites, &mut sim).unwrap_err(),
            TestMethodError::Encoding(EncodingError::MissingSiteData(2))
        );
        let mut wide = OverlayTask::drive("shift_in", "TDI", 0x1FFu64, 4).width(8);
        assert_eq!(
            reverse_overlay_subroutine(&mut wide, &sites, &mut sim).unwrap_err(),
            TestMethodError::Encoding(EncodingError::ValueExceedsWidth { value: 0x1FF, width: 8 })
        );
        assert!(sim.events().is_empty());
    }
}
