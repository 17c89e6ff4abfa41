//! Per-site result storage and judging against limits.

use crate::datalog::{Datalog, LogEntry, Schedule};
use crate::limits::{judge, LimitSpec};
use crate::sites::{Site, SiteSet, SiteValues};

/// Raw results of one invocation, sized to the configured sites plus slot 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub func_results: SiteValues<bool>,
    pub results: SiteValues<f64>,
}

impl ResultRecord {
    pub fn new(sites: &SiteSet) -> Self {
        Self {
            func_results: SiteValues::new(sites, false),
            results: SiteValues::new(sites, f64::NAN),
        }
    }

    pub fn len(&self) -> usize {
        self.func_results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.func_results.is_empty()
    }

    pub fn record(&mut self, site: Site, passed: bool, value: f64) -> bool {
        self.func_results.set(site, passed) && self.results.set(site, value)
    }
}

/// Immutable copy of one finalization, queued for background judging.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub generation: u64,
    pub sites: Vec<Site>,
    pub record: ResultRecord,
}

/// What a result is judged against.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeContext {
    pub suite: String,
    pub pin: String,
    pub limits: LimitSpec,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteVerdict {
    pub site: Site,
    pub functional: bool,
    pub parametric: bool,
    pub value: f64,
}

impl SiteVerdict {
    pub fn passed(&self) -> bool {
        self.functional && self.parametric
    }
}

/// Judges and logs the functional and parametric outcome of one site.
pub fn judge_site(
    ctx: &JudgeContext,
    record: &ResultRecord,
    site: Site,
    schedule: Schedule,
    generation: u64,
    sink: &mut dyn Datalog,
) -> SiteVerdict {
    let func = record.func_results.get(site).copied().unwrap_or(false);
    let value = record.results.get(site).copied().unwrap_or(f64::NAN);

    let strict = LimitSpec::strict_pass();
    let functional = judge(if func { 1.0 } else { 0.0 }, &strict);
    sink.log(LogEntry::Functional {
        schedule,
        generation,
        site,
        suite: ctx.suite.clone(),
        limits: strict,
        value: func,
        passed: functional,
    });

    let parametric = judge(value, &ctx.limits);
    sink.log(LogEntry::Parametric {
        schedule,
        generation,
        site,
        pin: ctx.pin.clone(),
        suite: ctx.suite.clone(),
        limits: ctx.limits.clone(),
        value,
        passed: parametric,
    });

    SiteVerdict {
        site,
        functional,
        parametric,
        value,
    }
}

/// Judges every site of a snapshot in order.
pub fn judge_snapshot(
    ctx: &JudgeContext,
    snapshot: &Snapshot,
    schedule: Schedule,
    sink: &mut dyn Datalog,
) -> Vec<SiteVerdict> {
    snapshot
        .sites
        .iter()
        .map(|&site| judge_site(ctx, &snapshot.record, site, schedule, snapshot.generation, &mut *sink))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::MemoryDatalog;
    use crate::limits::Comparison;

    fn context() -> JudgeContext {
        JudgeContext {
            suite: "IDD".into(),
            pin: "VDD".into(),
            limits: LimitSpec::between(Comparison::Ge, 1.0, Comparison::Le, 2.0),
        }
    }

    #[test]
    fn record_is_sized_to_configured_sites() {
        let sites = SiteSet::new([1, 3], 4).unwrap();
        let mut record = ResultRecord::new(&sites);
        assert_eq!(record.len(), 5);
        assert!(record.record(3, true, 1.5));
        assert!(!record.record(9, true, 1.5));
        assert!(record.func_results[3]);
        assert!(record.results[1].is_nan());
    }

    #[test]
    fn judges_both_outcomes() {
        let sites = SiteSet::new([1, 2], 2).unwrap();
        let mut record = ResultRecord::new(&sites);
        record.record(1, true, 1.5);
        record.record(2, false, 2.5);
        let snapshot = Snapshot { generation: 7, sites: vec![1, 2], record };

        let mut log = MemoryDatalog::new();
        let verdicts = judge_snapshot(&context(), &snapshot, Schedule::Background, &mut log);

        assert_eq!(verdicts.len(), 2);
        assert!(verdicts[0].passed());
        assert!(!verdicts[1].functional);
        assert!(!verdicts[1].parametric);
        assert_eq!(log.entries.len(), 4);
        assert!(log.entries.iter().all(|e| e.generation() == 7));
        assert_eq!(log.entries_for(2).filter(|e| !e.passed()).count(), 2);
        match &log.entries[0] {
            LogEntry::Functional { limits, value, .. } => {
                assert_eq!(limits, &LimitSpec::strict_pass());
                assert!(*value);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn unmeasured_site_fails_bounded_limits() {
        let sites = SiteSet::new([1], 1).unwrap();
        let record = ResultRecord::new(&sites);
        let mut log = MemoryDatalog::new();
        let verdict = judge_site(&context(), &record, 1, Schedule::Foreground, 0, &mut log);
        assert!(!verdict.functional);
        assert!(!verdict.parametric);
    }
}
