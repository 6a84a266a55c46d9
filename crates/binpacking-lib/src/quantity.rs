//! Resource quantity parsing
//!
//! Converts Kubernetes quantity strings ("500m", "256Mi", "1.5", "2e3") into
//! `f64` values in the resource's base unit (cores for CPU, bytes for memory).
//! Values are approximate but precise enough for summation and ratios.

use crate::error::QuantityError;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::debug;

/// Binary (power of two) suffixes
const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

/// Decimal SI suffixes
const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity string strictly.
pub fn parse_quantity(input: &str) -> Result<f64, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    // Numeric part: optional sign, digits and at most one decimal point.
    let number_end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '+' || c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);

    if !number.chars().any(|c| c.is_ascii_digit()) || number.matches('.').count() > 1 {
        return Err(QuantityError::InvalidNumber(input.to_string()));
    }
    let base: f64 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;

    Ok(base * multiplier(input, suffix)?)
}

fn multiplier(input: &str, suffix: &str) -> Result<f64, QuantityError> {
    if suffix.is_empty() {
        return Ok(1.0);
    }

    if let Some(&(_, m)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok(m);
    }
    if let Some(&(_, m)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok(m);
    }

    // Exponent form. A bare "E" was matched above as exa.
    if let Some(exp) = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E')) {
        if let Ok(exp) = exp.parse::<i32>() {
            return Ok(10f64.powi(exp));
        }
    }

    Err(QuantityError::UnknownSuffix {
        input: input.to_string(),
        suffix: suffix.to_string(),
    })
}

/// Lenient conversion: malformed or negative quantities count as zero.
pub fn quantity_value(quantity: &Quantity) -> f64 {
    match parse_quantity(&quantity.0) {
        Ok(v) if v > 0.0 && v.is_finite() => v,
        Ok(_) => 0.0,
        Err(e) => {
            debug!(quantity = %quantity.0, error = %e, "treating malformed quantity as zero");
            0.0
        }
    }
}

/// Look up one resource in a resource list.
///
/// Returns `None` when the list or the key is absent, so callers can tell
/// "declared zero" from "not declared".
pub fn resource_value(list: Option<&BTreeMap<String, Quantity>>, resource: &str) -> Option<f64> {
    list.and_then(|l| l.get(resource)).map(quantity_value)
}
