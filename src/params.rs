//! Strategy parameters and the range generators used by parameter sweeps.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            ParamValue::Float(_) => None,
            ParamValue::Text(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Name -> value mapping for one strategy instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn float(&self, name: &str, default: f64) -> f64 {
        self.get(name).and_then(ParamValue::as_f64).unwrap_or(default)
    }

    pub fn int(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(ParamValue::as_i64).unwrap_or(default)
    }

    /// Negative values map to 0, which the indicators replace with their default.
    pub fn period(&self, name: &str, default: usize) -> usize {
        self.int(name, default as i64).max(0) as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// The candidate values for one named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub name: String,
    pub values: Vec<ParamValue>,
}

impl ParamRange {
    /// Inclusive integer range.
    pub fn int_range(name: &str, min: i64, max: i64, step: i64) -> Self {
        let step = step.max(1);
        let mut values = Vec::new();
        let mut next = Some(min);
        while let Some(v) = next.filter(|v| *v <= max) {
            values.push(ParamValue::Int(v));
            next = v.checked_add(step);
        }
        Self { name: name.to_string(), values }
    }

    /// Inclusive float range; values are computed from the index to avoid drift.
    pub fn float_range(name: &str, min: f64, max: f64, step: f64) -> Self {
        let mut values = Vec::new();
        if step > 0.0 && max >= min {
            let n = ((max - min) / step + 1e-9).floor() as usize;
            for i in 0..=n {
                values.push(ParamValue::Float(min + step * i as f64));
            }
        }
        Self { name: name.to_string(), values }
    }

    pub fn values(name: &str, values: Vec<ParamValue>) -> Self {
        Self { name: name.to_string(), values }
    }
}

/// Cartesian product in declaration order: the last range varies fastest.
/// No ranges yields a single empty set (run with defaults).
pub fn cartesian_product(ranges: &[ParamRange]) -> Vec<ParameterSet> {
    fn recurse(ranges: &[ParamRange], current: &mut ParameterSet, out: &mut Vec<ParameterSet>) {
        let Some((first, rest)) = ranges.split_first() else {
            out.push(current.clone());
            return;
        };
        for v in &first.values {
            current.insert(&first.name, v.clone());
            recurse(rest, current, out);
        }
    }
    if ranges.iter().any(|r| r.values.is_empty()) {
        return Vec::new();
    }
    let mut out = Vec::new();
    recurse(ranges, &mut ParameterSet::new(), &mut out);
    out
}
