//! Resource quantities such as `500m`, `1Gi` or `10`
//!
//! Quantities are validated up front so a malformed limit fails its unit
//! before anything is written to the cluster.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {input:?}")]
pub struct QuantityError {
    pub input: String,
}

/// A parsed quantity. Keeps the original text for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    raw: String,
    value: f64,
}

const BINARY_SUFFIXES: [(&str, i32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

impl Quantity {
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let err = || QuantityError {
            input: input.to_string(),
        };
        let s = input.trim();
        if s.is_empty() {
            return Err(err());
        }

        // Split the signed number from the suffix
        let split = s
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let digits = number.trim_start_matches(['+', '-']);
        if digits.is_empty() || digits == "." || digits.matches('.').count() > 1 {
            return Err(err());
        }
        let mantissa: f64 = number.parse().map_err(|_| err())?;

        let multiplier = if suffix.is_empty() {
            1.0
        } else if let Some((_, exp)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
            2f64.powi(*exp)
        } else if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
            10f64.powi(*exp)
        } else if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
            let exp: i32 = exp.parse().map_err(|_| err())?;
            10f64.powi(exp)
        } else {
            return Err(err());
        };

        Ok(Self {
            raw: s.to_string(),
            value: mantissa * multiplier,
        })
    }

    /// Numeric value in base units (cores, bytes, count)
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_negative(&self) -> bool {
        self.value < 0.0
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl TryFrom<String> for Quantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Quantity::parse(&value)
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.raw
    }
}
