//! Limit objects and the pass/fail judgement against them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparison operator of one limit bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub op: Comparison,
    pub value: f64,
}

/// Low/high bounds and the units they are expressed in. No bounds means "always pass".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LimitSpec {
    #[serde(default)]
    pub low: Option<Bound>,
    #[serde(default)]
    pub high: Option<Bound>,
    #[serde(default)]
    pub units: String,
}

impl LimitSpec {
    /// A limit without any bound.
    pub fn none() -> Self {
        Self::default()
    }

    /// Functional limit: exactly 1 passes.
    pub fn strict_pass() -> Self {
        Self::between(Comparison::Ge, 1.0, Comparison::Le, 1.0)
    }

    pub fn between(low_op: Comparison, low: f64, high_op: Comparison, high: f64) -> Self {
        Self {
            low: Some(Bound { op: low_op, value: low }),
            high: Some(Bound { op: high_op, value: high }),
            units: String::new(),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn has_bounds(&self) -> bool {
        self.low.is_some() || self.high.is_some()
    }

    /// True iff `value` satisfies every configured bound.
    pub fn is_pass(&self, value: f64) -> bool {
        [self.low, self.high]
            .iter()
            .flatten()
            .all(|bound| bound.op.holds(value, bound.value))
    }

    pub fn lo_str(&self) -> String {
        self.low.map(|b| b.value.to_string()).unwrap_or_default()
    }

    pub fn hi_str(&self) -> String {
        self.high.map(|b| b.value.to_string()).unwrap_or_default()
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_bounds() {
            return write!(f, "no limits");
        }
        let mut parts = Vec::new();
        if let Some(low) = self.low {
            parts.push(format!("x {} {}", low.op.symbol(), low.value));
        }
        if let Some(high) = self.high {
            parts.push(format!("x {} {}", high.op.symbol(), high.value));
        }
        write!(f, "{}", parts.join(" and "))?;
        if !self.units.is_empty() {
            write!(f, " [{}]", self.units)?;
        }
        Ok(())
    }
}

/// Judges a value against a limit.
pub fn judge(value: f64, limits: &LimitSpec) -> bool {
    limits.is_pass(value)
}

/// Factor converting a base-unit reading (A, V) into the prefixed unit of a limit.
///
/// `"mA"` gives 1e3, `"uA"` 1e6, `"V"` or an empty string 1. Unknown prefixes give 1.
pub fn unit_multiplier(units: &str) -> f64 {
    let units = units.trim();
    let mut chars = units.chars();
    let prefix = match (chars.next(), chars.next()) {
        (Some(p), Some(_)) => p,
        _ => return 1.0,
    };
    match prefix {
        'p' => 1e12,
        'n' => 1e9,
        'u' | 'µ' => 1e6,
        'm' => 1e3,
        'k' => 1e-3,
        'M' => 1e-6,
        _ => 1.0,
    }
}
