//! Group threshold expressions.
//!
//! Grammar: `[">=" | ">"] <number> ["%"]`, whitespace ignored. A bare number
//! means `>=`. The number is a percentage between 0 and 100.

use std::fmt;
use std::str::FromStr;

use crate::error::RolloutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    AtLeast,
    Above,
}

/// A parsed percentage threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub comparison: Comparison,
    pub percent: f64,
}

impl Threshold {
    pub fn parse(expression: &str) -> Result<Self, RolloutError> {
        expression.parse()
    }

    /// Whether `count` out of `total` reaches the threshold. `None` when the
    /// scope is empty, leaving the caller to decide what that means.
    pub fn is_met(&self, count: u64, total: u64) -> Option<bool> {
        if total == 0 {
            return None;
        }
        let percent = count as f64 * 100.0 / total as f64;
        Some(match self.comparison {
            Comparison::AtLeast => percent >= self.percent,
            Comparison::Above => percent > self.percent,
        })
    }
}

impl FromStr for Threshold {
    type Err = RolloutError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RolloutError::InvalidCondition {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let (comparison, rest) = if let Some(rest) = compact.strip_prefix(">=") {
            (Comparison::AtLeast, rest)
        } else if let Some(rest) = compact.strip_prefix('>') {
            (Comparison::Above, rest)
        } else {
            (Comparison::AtLeast, compact.as_str())
        };
        let number = rest.strip_suffix('%').unwrap_or(rest);
        if number.is_empty() {
            return Err(invalid("missing percentage"));
        }

        let percent: f64 = number.parse().map_err(|_| invalid("not a number"))?;
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(invalid("percentage must be between 0 and 100"));
        }
        Ok(Self {
            comparison,
            percent,
        })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.comparison {
            Comparison::AtLeast => ">=",
            Comparison::Above => ">",
        };
        write!(f, "{op}{}%", self.percent)
    }
}
