//! Operator console.
//!
//! Commands arrive framed as `<...>`; anything outside the first frame is ignored. Every
//! command that produces output answers with a `#...#` frame.
//!
//! | Command | Effect |
//! | --- | --- |
//! | `RUN` | invoke the test method |
//! | `BGJ` | judge pending results in the background |
//! | `RST` | forget the cached configuration |
//! | `OVL label pin ws start width hex` | drive one value on every site |
//! | `OVP label pin ws start width site:hex,...` | drive a value per site |
//! | `RBK label pin ws start width` | receive and decode per site |
//! | `SET addr hex [site]` | store data for an address |
//! | `OVA label pin ws start width addr` | drive the stored data of an address |
//! | `CHK text` | 16-bit checksum of `text` |
//! | `STA` | executor phase, generation and pending background results |

use std::collections::BTreeMap;
use std::num::ParseIntError;

use thiserror::Error;
use tracing::debug;

use crate::bits::{checksum16bits, to_hex};
use crate::datalog::{Datalog, TracingDatalog};
use crate::error::{ConfigurationError, TestMethodError};
use crate::executor::{BackgroundReport, TestMethodExecutor};
use crate::judge::SiteVerdict;
use crate::overlay::{overlay, OverlayData, OverlayTask};
use crate::platform::{DefaultGates, TestContext};
use crate::sim::SimTester;
use crate::site_data::SiteDataStore;
use crate::sites::{Site, SiteSet};

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    /// Command is missing a valid '<...>' frame.
    #[error("command is missing a '<...>' frame")]
    InvalidFrame,
    #[error("command is too short")]
    TooShort,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("invalid number: {0}")]
    InvalidNumber(#[from] ParseIntError),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error(transparent)]
    TestMethod(#[from] TestMethodError),
}

/// Geometry shared by the overlay commands.
struct OverlayArgs<'a> {
    label: &'a str,
    pin: &'a str,
    word_size: u32,
    start: usize,
    width: u32,
}

pub struct Console {
    tester: SimTester,
    executor: TestMethodExecutor,
    store: SiteDataStore,
    foreground: Box<dyn Datalog>,
    background: Box<dyn Datalog>,
    last_verdicts: Vec<SiteVerdict>,
    last_generation: u64,
    background_reports: Vec<BackgroundReport>,
}

impl Console {
    pub fn new(tester: SimTester, executor: TestMethodExecutor) -> Self {
        Self::with_datalogs(tester, executor, Box::new(TracingDatalog), Box::new(TracingDatalog))
    }

    pub fn with_datalogs(
        tester: SimTester,
        executor: TestMethodExecutor,
        foreground: Box<dyn Datalog>,
        background: Box<dyn Datalog>,
    ) -> Self {
        Self {
            tester,
            executor,
            store: SiteDataStore::new(),
            foreground,
            background,
            last_verdicts: Vec::new(),
            last_generation: 0,
            background_reports: Vec::new(),
        }
    }

    pub fn tester(&self) -> &SimTester {
        &self.tester
    }

    pub fn executor(&self) -> &TestMethodExecutor {
        &self.executor
    }

    pub fn store(&self) -> &SiteDataStore {
        &self.store
    }

    /// Verdicts of the last `RUN`.
    pub fn last_verdicts(&self) -> &[SiteVerdict] {
        &self.last_verdicts
    }

    pub fn last_generation(&self) -> u64 {
        self.last_generation
    }

    /// Reports of the last `BGJ`.
    pub fn background_reports(&self) -> &[BackgroundReport] {
        &self.background_reports
    }

    /// Processes one framed command. `Ok(None)` means there is nothing to answer.
    pub fn process_command(&mut self, command_str: &str) -> Result<Option<String>, CommandError> {
        let start_byte = command_str.find('<');
        let end_byte = command_str.find('>');

        let content = match (start_byte, end_byte) {
            (Some(start), Some(end)) if end > start => command_str[start + 1..end].trim(),
            _ => return Err(CommandError::InvalidFrame),
        };

        let (name, rest) = match content.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (content, ""),
        };
        if name.len() < 3 {
            return Err(CommandError::TooShort);
        }
        let args: Vec<&str> = rest.split_whitespace().collect();
        debug!(command = name, ?args, "console command");

        let response = match name.to_ascii_uppercase().as_str() {
            "RUN" => self.run()?,
            "BGJ" => self.background(),
            "RST" => {
                self.executor.reset();
                String::from("#OK#")
            }
            "STA" => format!(
                "#{:?},{},{}#",
                self.executor.phase(),
                self.executor.generation(),
                self.executor.pending_background()
            ),
            "CHK" => format!("#{}#", checksum16bits(rest)),
            "SET" => self.set_data(&args)?,
            "OVL" => {
                let geometry = overlay_args(&args, 6)?;
                let value = parse_hex(args[5])?;
                self.drive(&geometry, OverlayData::Scalar(value))?
            }
            "OVP" => {
                let geometry = overlay_args(&args, 6)?;
                let values = parse_site_values(args[5])?;
                self.drive(&geometry, OverlayData::PerSite(values))?
            }
            "OVA" => {
                let geometry = overlay_args(&args, 6)?;
                let addr = parse_hex(args[5])?;
                let sites = self.sites()?;
                let data = self.store.overlay_data(&sites, addr).ok_or_else(|| {
                    CommandError::InvalidParameter(format!("address {} holds no data", to_hex(addr)))
                })?;
                self.drive(&geometry, data)?
            }
            "RBK" => {
                let geometry = overlay_args(&args, 5)?;
                self.receive(&geometry)?
            }
            _ => return Err(CommandError::UnknownCommand(name.to_string())),
        };
        Ok(Some(response))
    }

    fn run(&mut self) -> Result<String, CommandError> {
        let invocation =
            self.executor
                .execute(&mut self.tester, &mut DefaultGates, self.foreground.as_mut())?;
        let sites: Vec<String> = invocation
            .verdicts
            .iter()
            .map(|v| format!("{}:{}:{}", v.site, if v.passed() { "P" } else { "F" }, v.value))
            .collect();
        self.last_generation = invocation.generation;
        self.last_verdicts = invocation.verdicts;
        Ok(format!("#{},{}#", self.last_generation, sites.join(",")))
    }

    fn background(&mut self) -> String {
        self.background_reports = self
            .executor
            .run_background(&mut DefaultGates, self.background.as_mut());
        let judged: Vec<String> = self
            .background_reports
            .iter()
            .map(|report| report.generation.to_string())
            .collect();
        format!("#BGJ,{}#", judged.join(","))
    }

    fn set_data(&mut self, args: &[&str]) -> Result<String, CommandError> {
        match args {
            [addr, data] => {
                let sites = self.sites()?;
                self.store.set_data(&sites, parse_hex(addr)?, parse_hex(data)?);
            }
            [addr, data, site] => {
                let site: Site = site.parse()?;
                if !self.sites()?.is_active(site) {
                    return Err(CommandError::InvalidParameter(format!(
                        "site {} is not active",
                        site
                    )));
                }
                self.store.set_data_on_site(site, parse_hex(addr)?, parse_hex(data)?);
            }
            _ => return Err(CommandError::TooShort),
        }
        Ok(String::from("#OK#"))
    }

    fn drive(&mut self, args: &OverlayArgs<'_>, data: OverlayData) -> Result<String, CommandError> {
        let sites = self.sites()?;
        let mut task = OverlayTask::drive(args.label, args.pin, data, args.word_size)
            .width(args.width)
            .start(args.start);
        let outcome = overlay(&mut task, &sites, &mut self.tester)?;
        Ok(format!("#OK,{}#", outcome.words_written))
    }

    fn receive(&mut self, args: &OverlayArgs<'_>) -> Result<String, CommandError> {
        let sites = self.sites()?;
        let mut task = OverlayTask::receive(args.label, args.pin, args.word_size)
            .width(args.width)
            .start(args.start);
        let outcome = overlay(&mut task, &sites, &mut self.tester)?;
        let values: Vec<String> = outcome
            .received
            .iter()
            .map(|(site, value)| format!("{}:{}", site, to_hex(*value)))
            .collect();
        Ok(format!("#{}#", values.join(",")))
    }

    /// Sites of the resolved test method, or the tester's own sites before the first run.
    fn sites(&self) -> Result<SiteSet, CommandError> {
        if let Some(resolved) = self.executor.resolved() {
            return Ok(resolved.sites.clone());
        }
        SiteSet::new(self.tester.active_sites(), self.tester.configured_sites())
            .map_err(|e| CommandError::TestMethod(ConfigurationError::from(e).into()))
    }
}

fn overlay_args<'a>(args: &[&'a str], expected: usize) -> Result<OverlayArgs<'a>, CommandError> {
    if args.len() < expected {
        return Err(CommandError::TooShort);
    }
    Ok(OverlayArgs {
        label: args[0],
        pin: args[1],
        word_size: args[2].parse()?,
        start: args[3].parse()?,
        width: args[4].parse()?,
    })
}

fn parse_hex(text: &str) -> Result<u64, CommandError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    Ok(u64::from_str_radix(digits, 16)?)
}

/// Parses `site:hex,site:hex,...`.
fn parse_site_values(text: &str) -> Result<BTreeMap<Site, u64>, CommandError> {
    text.split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> Result<(Site, u64), CommandError> {
            let (site, value) = pair.split_once(':').ok_or_else(|| {
                CommandError::InvalidParameter(format!("expected site:value, got '{}'", pair))
            })?;
            Ok((site.parse()?, parse_hex(value)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datalog::MemoryDatalog;
    use crate::error::EncodingError;
    use crate::executor::TestMethodParams;
    use crate::measurement::{MeasurementDescriptor, Quantity};

    fn console() -> Console {
        let config = Config::parse(&Config::default_toml()).unwrap();
        let executor = TestMethodExecutor::new(config.params().unwrap());
        Console::with_datalogs(
            config.build_tester(),
            executor,
            Box::new(MemoryDatalog::new()),
            Box::new(MemoryDatalog::new()),
        )
    }

    #[test]
    fn process_command_with_surrounding_noise() {
        let mut console = console();
        assert_eq!(console.process_command("noise<CHK AB>>>garbage").unwrap(), Some("#4142#".into()));
    }

    #[test]
    fn reject_malformed_frame() {
        let mut console = console();
        assert_eq!(console.process_command("RUN>").unwrap_err(), CommandError::InvalidFrame);
        assert_eq!(console.process_command("<RUN").unwrap_err(), CommandError::InvalidFrame);
        assert_eq!(console.process_command(">RUN<").unwrap_err(), CommandError::InvalidFrame);
    }

    #[test]
    fn reject_short_and_unknown_commands() {
        let mut console = console();
        assert_eq!(console.process_command("<R>").unwrap_err(), CommandError::TooShort);
        assert_eq!(console.process_command("<OVL a b 4>").unwrap_err(), CommandError::TooShort);
        assert_eq!(
            console.process_command("<XYZ>").unwrap_err(),
            CommandError::UnknownCommand("XYZ".into())
        );
        assert!(matches!(
            console.process_command("<OVL dc_meas TDI x 0 8 FF>"),
            Err(CommandError::InvalidNumber(_))
        ));
    }

    #[test]
    fn run_then_background() {
        let mut console = console();
        assert_eq!(console.process_command("<STA>").unwrap(), Some("#Uninitialized,0,0#".into()));

        let response = console.process_command("<RUN>").unwrap().unwrap();
        assert!(response.starts_with("#1,1:P:"));
        assert!(response.contains(",3:F:"));
        assert_eq!(console.last_verdicts().len(), 4);
        assert_eq!(console.last_generation(), 1);

        console.process_command("<run>").unwrap();
        assert_eq!(console.process_command("<STA>").unwrap(), Some("#SiteFinalized,2,2#".into()));
        assert_eq!(console.process_command("<BGJ>").unwrap(), Some("#BGJ,1,2#".into()));
        assert_eq!(console.background_reports().len(), 2);
        assert_eq!(console.process_command("<STA>").unwrap(), Some("#BackgroundJudged,2,0#".into()));

        assert_eq!(console.process_command("<RST>").unwrap(), Some("#OK#".into()));
        assert!(!console.executor().is_configured());
    }

    #[test]
    fn run_reports_configuration_errors() {
        let config = Config::parse(&Config::default_toml()).unwrap();
        let params = TestMethodParams::new(
            MeasurementDescriptor::builder("NVM_ANALOG")
                .measure(Quantity::Voltage)
                .build()
                .unwrap(),
        );
        let mut console = Console::new(config.build_tester(), TestMethodExecutor::new(params));
        assert!(matches!(
            console.process_command("<RUN>"),
            Err(CommandError::TestMethod(TestMethodError::Configuration(
                ConfigurationError::VoltageAutoRangeUnsupported { .. }
            )))
        ));
    }

    #[test]
    fn overlay_drive_and_read_back() {
        let mut console = console();
        assert_eq!(
            console.process_command("<OVL dc_meas TDI 8 8 16 BEEF>").unwrap(),
            Some("#OK,2#".into())
        );
        assert_eq!(
            console.process_command("<RBK dc_meas TDI 8 8 16>").unwrap(),
            Some("#1:BEEF,2:BEEF,3:BEEF,4:BEEF#".into())
        );

        console
            .process_command("<OVP dc_meas TDI 4 0 8 1:A5,2:5A,3:0x0F,4:F0>")
            .unwrap();
        assert_eq!(
            console.process_command("<RBK dc_meas TDI 4 0 8>").unwrap(),
            Some("#1:A5,2:5A,3:F,4:F0#".into())
        );
    }

    #[test]
    fn overlay_errors_surface() {
        let mut console = console();
        assert_eq!(
            console.process_command("<OVL dc_meas TDI 8 0 8 1FF>").unwrap_err(),
            CommandError::TestMethod(TestMethodError::Encoding(EncodingError::ValueExceedsWidth {
                value: 0x1FF,
                width: 8
            }))
        );
        assert!(matches!(
            console.process_command("<OVP dc_meas TDI 8 0 8 1-A5>"),
            Err(CommandError::InvalidParameter(_))
        ));
    }

    #[test]
    fn overlay_from_site_data() {
        let mut console = console();
        assert_eq!(console.process_command("<SET 20 AB>").unwrap(), Some("#OK#".into()));
        console.process_command("<SET 20 CD 2>").unwrap();
        assert_eq!(console.store().data_on_site(2, 0x20), Some(0xCD));
        assert_eq!(console.store().data_on_site(1, 0x20), Some(0xAB));

        assert_eq!(
            console.process_command("<OVA dc_meas TDI 8 0 8 20>").unwrap(),
            Some("#OK,4#".into())
        );
        assert_eq!(console.tester().read_bits("dc_meas", "TDI", 2, 0, 8), Some(0xCD));
        assert_eq!(console.tester().read_bits("dc_meas", "TDI", 4, 0, 8), Some(0xAB));

        assert!(matches!(
            console.process_command("<OVA dc_meas TDI 8 0 8 21>"),
            Err(CommandError::InvalidParameter(_))
        ));
        assert!(matches!(
            console.process_command("<SET 20 CD 9>"),
            Err(CommandError::InvalidParameter(_))
        ));
    }

    #[test]
    fn checksum_keeps_inner_spaces() {
        let mut console = console();
        assert_eq!(console.process_command("<CHK A B>").unwrap(), Some("#8320#".into()));
        assert_eq!(console.process_command("<CHK>").unwrap(), Some("#0000#".into()));
    }
}
