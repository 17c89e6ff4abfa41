//! The DC measurement test method.
//!
//! One [`TestMethodExecutor`] lives for a whole test-program run. The first invocation
//! resolves and caches its configuration; every invocation then runs
//!
//! ```text
//! begin transaction
//!   [pre_test gate]   pretest pattern (f1)
//!     [hold_state gate] DC force/measure
//!     shutdown pattern (f2), if requested
//! end transaction
//! ```
//!
//! finalizes one result per active site, judges each site synchronously and queues a snapshot
//! for background judging.

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info, warn};

use crate::datalog::{Datalog, Schedule};
use crate::error::{ConfigurationError, TestMethodError, TesterError};
use crate::judge::{self, JudgeContext, ResultRecord, SiteVerdict, Snapshot};
use crate::limits::{unit_multiplier, LimitSpec};
use crate::measurement::{autorange, MeasurementDescriptor, Quantity};
use crate::overlay::{apply, encode, OverlayOutcome, OverlayPlan, OverlayTask};
use crate::platform::{
    Gates, LimitModel, OverlayDirection, PinResolver, Rdi, TestContext, Tester, PRETEST_ID,
    SHUTDOWN_ID,
};
use crate::sites::{Site, SiteSet};

/// Finalized generations kept for background judging; older ones are dropped.
pub const PENDING_LIMIT: usize = 64;

/// Post-processing applied to every measured value before it is stored.
pub type ResultFilter = Box<dyn Fn(f64) -> f64 + Send>;

/// User-facing parameters of the test method.
#[derive(Debug, Clone, PartialEq)]
pub struct TestMethodParams {
    pub measurement: MeasurementDescriptor,
    pub apply_shutdown: bool,
    /// Shutdown pattern label. Derived from the primary label when absent.
    pub shutdown_pattern: Option<String>,
    /// Multiply measured values by the unit prefix of the limits (A -> mA etc.).
    pub scale_to_limit_units: bool,
}

impl TestMethodParams {
    pub fn new(measurement: MeasurementDescriptor) -> Self {
        Self {
            measurement,
            apply_shutdown: true,
            shutdown_pattern: None,
            scale_to_limit_units: false,
        }
    }

    pub fn apply_shutdown(mut self, enabled: bool) -> Self {
        self.apply_shutdown = enabled;
        self
    }

    pub fn shutdown_pattern(mut self, label: impl Into<String>) -> Self {
        self.shutdown_pattern = Some(label.into());
        self
    }

    pub fn scale_to_limit_units(mut self, enabled: bool) -> Self {
        self.scale_to_limit_units = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Configured,
    InFlight,
    SiteFinalized,
    BackgroundJudged,
}

/// Configuration derived on the first invocation and cached afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub sites: SiteSet,
    pub suite: String,
    pub label: String,
    /// Canonical measurement pin.
    pub pin: String,
    pub shutdown_label: Option<String>,
    pub limits: LimitSpec,
    pub current_range: Option<f64>,
}

impl ResolvedConfig {
    pub fn judge_context(&self) -> JudgeContext {
        JudgeContext {
            suite: self.suite.clone(),
            pin: self.pin.clone(),
            limits: self.limits.clone(),
        }
    }
}

/// Steps that actually ran inside the transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowTrace {
    pub pretest: bool,
    pub measured: bool,
    pub shutdown: bool,
}

/// Result of one foreground invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub generation: u64,
    pub flow: FlowTrace,
    pub verdicts: Vec<SiteVerdict>,
    pub overlays: Vec<OverlayOutcome>,
}

/// Verdicts of one background-judged generation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundReport {
    pub generation: u64,
    pub verdicts: Vec<SiteVerdict>,
}

pub struct TestMethodExecutor {
    params: TestMethodParams,
    overlays: Vec<OverlayTask>,
    filter: Option<ResultFilter>,
    phase: Phase,
    resolved: Option<ResolvedConfig>,
    record: Option<ResultRecord>,
    generation: u64,
    pending: VecDeque<Snapshot>,
}

impl fmt::Debug for TestMethodExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestMethodExecutor")
            .field("params", &self.params)
            .field("overlays", &self.overlays)
            .field("filter", &self.filter.is_some())
            .field("phase", &self.phase)
            .field("resolved", &self.resolved)
            .field("generation", &self.generation)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl TestMethodExecutor {
    pub fn new(params: TestMethodParams) -> Self {
        Self {
            params,
            overlays: Vec::new(),
            filter: None,
            phase: Phase::Uninitialized,
            resolved: None,
            record: None,
            generation: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn params(&self) -> &TestMethodParams {
        &self.params
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_configured(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn resolved(&self) -> Option<&ResolvedConfig> {
        self.resolved.as_ref()
    }

    /// Results of the most recent finalization.
    pub fn record(&self) -> Option<&ResultRecord> {
        self.record.as_ref()
    }

    /// Number of the most recent invocation, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_background(&self) -> usize {
        self.pending.len()
    }

    pub fn add_overlay(&mut self, task: OverlayTask) {
        self.overlays.push(task);
    }

    pub fn overlays(&self) -> &[OverlayTask] {
        &self.overlays
    }

    pub fn set_result_filter<F>(&mut self, filter: F)
    where
        F: Fn(f64) -> f64 + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
    }

    /// Forgets the cached configuration, as on a test-program reload.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "discarding results that were never background judged"
            );
        }
        self.pending.clear();
        self.resolved = None;
        self.record = None;
        self.phase = Phase::Uninitialized;
    }

    /// Resolves sites, pin, shutdown label, limits and current range, and allocates the
    /// result storage. Runs once; later calls return the cached configuration.
    pub fn configure<T>(&mut self, tester: &T) -> Result<&ResolvedConfig, ConfigurationError>
    where
        T: TestContext + PinResolver + LimitModel + ?Sized,
    {
        let resolved = match self.resolved.take() {
            Some(resolved) => resolved,
            None => {
                let resolved = self.resolve(tester)?;
                self.record = Some(ResultRecord::new(&resolved.sites));
                self.phase = Phase::Configured;
                resolved
            }
        };
        Ok(self.resolved.insert(resolved))
    }

    fn resolve<T>(&self, tester: &T) -> Result<ResolvedConfig, ConfigurationError>
    where
        T: TestContext + PinResolver + LimitModel + ?Sized,
    {
        let sites = SiteSet::new(tester.active_sites(), tester.configured_sites())?;
        let suite = tester.test_suite_name();
        let label = tester.primary_label();
        let m = &self.params.measurement;

        let pin = tester
            .extract_pins_from_group(&m.pin)
            .ok_or_else(|| ConfigurationError::UnresolvedPin(m.pin.clone()))?;

        let shutdown_label = if self.params.apply_shutdown {
            Some(match &self.params.shutdown_pattern {
                Some(pattern) if !pattern.is_empty() => pattern.clone(),
                _ => format!("{}_part1", label),
            })
        } else {
            None
        };

        let limits = tester.fetch_limit(&suite).unwrap_or_else(|| {
            warn!(%suite, "no limits found, parametric results always pass");
            LimitSpec::none()
        });

        let current_range = match (m.current_range, m.quantity) {
            (Some(range), _) => Some(range),
            (None, Quantity::Current) => Some(autorange(m.force_value).ok_or_else(|| {
                ConfigurationError::MissingCurrentRange {
                    pin: pin.clone(),
                    force_value: m.force_value,
                }
            })?),
            (None, Quantity::Voltage) => {
                return Err(ConfigurationError::VoltageAutoRangeUnsupported { pin })
            }
        };

        info!(
            %suite,
            %label,
            %pin,
            shutdown = ?shutdown_label,
            ?current_range,
            active = ?sites.active(),
            configured = sites.configured_count(),
            "test method configured"
        );

        Ok(ResolvedConfig {
            sites,
            suite,
            label,
            pin,
            shutdown_label,
            limits,
            current_range,
        })
    }

    /// Runs one invocation: configuration on first use, the transaction, finalization and
    /// synchronous per-site judging into `foreground`.
    pub fn execute<T>(
        &mut self,
        tester: &mut T,
        gates: &mut dyn Gates,
        foreground: &mut dyn Datalog,
    ) -> Result<Invocation, TestMethodError>
    where
        T: Tester + ?Sized,
    {
        let resolved = self.configure(&*tester)?.clone();

        let plans = self
            .overlays
            .iter()
            .map(|task| encode(task, &resolved.sites, &*tester))
            .collect::<Result<Vec<_>, _>>()?;

        self.phase = Phase::InFlight;
        let mut overlays = Vec::with_capacity(plans.len());
        let flow = match self.run_transaction(tester, gates, &resolved, &plans, &mut overlays) {
            Ok(flow) => flow,
            Err(err) => {
                self.phase = Phase::Configured;
                return Err(err.into());
            }
        };
        gates.post_test();

        let generation = self.finalize(&*tester, &resolved);
        let ctx = resolved.judge_context();
        let verdicts = match &self.record {
            Some(record) => resolved
                .sites
                .active()
                .iter()
                .map(|&site| {
                    judge::judge_site(&ctx, record, site, Schedule::Foreground, generation, &mut *foreground)
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Invocation {
            generation,
            flow,
            verdicts,
            overlays,
        })
    }

    fn run_transaction<T>(
        &mut self,
        tester: &mut T,
        gates: &mut dyn Gates,
        resolved: &ResolvedConfig,
        plans: &[OverlayPlan],
        outcomes: &mut Vec<OverlayOutcome>,
    ) -> Result<FlowTrace, TesterError>
    where
        T: Tester + ?Sized,
    {
        for (task, plan) in self.overlays.iter_mut().zip(plans) {
            if plan.direction == OverlayDirection::Drive {
                outcomes.push(apply(task, plan, &mut *tester)?);
            }
        }

        tester.begin_transaction()?;
        let flow = match self.run_steps(tester, gates, resolved) {
            Ok(flow) => flow,
            Err(err) => {
                if let Err(close) = tester.end_transaction() {
                    warn!(error = %close, "could not close transaction after failure");
                }
                return Err(err);
            }
        };
        tester.end_transaction()?;

        for (task, plan) in self.overlays.iter_mut().zip(plans) {
            if plan.direction == OverlayDirection::Receive {
                outcomes.push(apply(task, plan, &mut *tester)?);
            }
        }
        Ok(flow)
    }

    fn run_steps<T>(
        &self,
        tester: &mut T,
        gates: &mut dyn Gates,
        resolved: &ResolvedConfig,
    ) -> Result<FlowTrace, TesterError>
    where
        T: Tester + ?Sized,
    {
        let mut flow = FlowTrace::default();
        if !gates.pre_test() {
            debug!("pretest gate closed");
            return Ok(flow);
        }
        tester.run_pattern(PRETEST_ID, &resolved.label)?;
        flow.pretest = true;

        if gates.hold_state() {
            let request = self.params.measurement.request(
                &resolved.suite,
                &resolved.pin,
                resolved.current_range,
            );
            tester.dc_measure(&request)?;
            flow.measured = true;
        } else {
            debug!("hold-state gate closed, measurement skipped");
        }

        if let Some(label) = &resolved.shutdown_label {
            tester.run_pattern(SHUTDOWN_ID, label)?;
            flow.shutdown = true;
        }
        Ok(flow)
    }

    fn finalize<T>(&mut self, tester: &T, resolved: &ResolvedConfig) -> u64
    where
        T: Rdi + ?Sized,
    {
        self.generation += 1;
        let generation = self.generation;
        let multiplier = if self.params.scale_to_limit_units {
            unit_multiplier(&resolved.limits.units)
        } else {
            1.0
        };

        let record = self
            .record
            .get_or_insert_with(|| ResultRecord::new(&resolved.sites));
        for &site in resolved.sites.active() {
            let pretest = tester.pass_fail(PRETEST_ID, site).unwrap_or(false);
            let shutdown = match resolved.shutdown_label {
                Some(_) => tester.pass_fail(SHUTDOWN_ID, site).unwrap_or(false),
                None => true,
            };
            let raw = match tester.values(&resolved.suite, site) {
                Some(samples) => {
                    if samples.len() > 1 {
                        warn!(site, samples = samples.len(), "only the first sample is recorded");
                    }
                    samples.first().copied().unwrap_or(f64::NAN)
                }
                None => f64::NAN,
            };
            let mut value = raw * multiplier;
            if let Some(filter) = &self.filter {
                value = filter(value);
            }
            let passed = pretest && shutdown;
            record.record(site, passed, value);
            debug!(generation, site, passed, value, "site finalized");
        }

        while self.pending.len() >= PENDING_LIMIT {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    generation = dropped.generation,
                    "background queue full, dropping results never background judged"
                );
            }
        }
        self.pending.push_back(Snapshot {
            generation,
            sites: resolved.sites.active().to_vec(),
            record: record.clone(),
        });
        self.phase = Phase::SiteFinalized;
        generation
    }

    /// Synchronous judgement of one site from the current result storage.
    pub fn judge_site(&self, site: Site, sink: &mut dyn Datalog) -> Option<SiteVerdict> {
        let resolved = self.resolved.as_ref()?;
        let record = self.record.as_ref()?;
        if !resolved.sites.is_active(site) {
            return None;
        }
        Some(judge::judge_site(
            &resolved.judge_context(),
            record,
            site,
            Schedule::Foreground,
            self.generation,
            sink,
        ))
    }

    /// Judges every finalized generation not yet judged in the background, oldest first.
    pub fn run_background(
        &mut self,
        gates: &mut dyn Gates,
        sink: &mut dyn Datalog,
    ) -> Vec<BackgroundReport> {
        let Some(ctx) = self.resolved.as_ref().map(ResolvedConfig::judge_context) else {
            return Vec::new();
        };

        let process = gates.process();
        let mut reports = Vec::new();
        while let Some(snapshot) = self.pending.pop_front() {
            if process {
                reports.push(BackgroundReport {
                    generation: snapshot.generation,
                    verdicts: judge::judge_snapshot(&ctx, &snapshot, Schedule::Background, &mut *sink),
                });
            } else {
                debug!(generation = snapshot.generation, "process gate closed, not logged");
            }
        }
        gates.post_process();

        if self.phase == Phase::SiteFinalized {
            self.phase = Phase::BackgroundJudged;
        }
        reports
    }
}
