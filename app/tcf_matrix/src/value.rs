/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use serde::Deserialize;
use serde::Serialize;

/// A scalar value an axis can take.
///
/// Values of different kinds never compare equal; across kinds the order
/// is bool < int < float < string so that mixed domains still sort
/// deterministically.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AxisValue {
    fn rank(&self) -> u8 {
        match self {
            AxisValue::Bool(_) => 0,
            AxisValue::Int(_) => 1,
            AxisValue::Float(_) => 2,
            AxisValue::Str(_) => 3,
        }
    }

    /// Converts a scalar JSON value; objects, arrays and null have no axis
    /// representation.
    pub fn from_json(value: &serde_json::Value) -> Option<AxisValue> {
        match value {
            serde_json::Value::Bool(b) => Some(AxisValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(AxisValue::Int(i)),
                None => n.as_f64().map(AxisValue::Float),
            },
            serde_json::Value::String(s) => Some(AxisValue::Str(s.clone())),
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AxisValue::Bool(b) => serde_json::Value::Bool(*b),
            AxisValue::Int(i) => serde_json::Value::from(*i),
            AxisValue::Float(f) => serde_json::Value::from(*f),
            AxisValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Whether an inventory value carries this axis value.
    pub fn matches_json(&self, value: &serde_json::Value) -> bool {
        match AxisValue::from_json(value) {
            Some(v) => v == *self,
            None => false,
        }
    }
}

impl PartialEq for AxisValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AxisValue {}

impl PartialOrd for AxisValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AxisValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AxisValue::Bool(a), AxisValue::Bool(b)) => a.cmp(b),
            (AxisValue::Int(a), AxisValue::Int(b)) => a.cmp(b),
            (AxisValue::Float(a), AxisValue::Float(b)) => a.total_cmp(b),
            (AxisValue::Str(a), AxisValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for AxisValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            AxisValue::Bool(b) => b.hash(state),
            AxisValue::Int(i) => i.hash(state),
            AxisValue::Float(f) => f.to_bits().hash(state),
            AxisValue::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Bool(b) => write!(f, "{}", b),
            AxisValue::Int(i) => write!(f, "{}", i),
            AxisValue::Float(x) => write!(f, "{}", x),
            AxisValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for AxisValue {
    fn from(s: &str) -> Self {
        AxisValue::Str(s.to_owned())
    }
}

impl From<String> for AxisValue {
    fn from(s: String) -> Self {
        AxisValue::Str(s)
    }
}

impl From<i64> for AxisValue {
    fn from(i: i64) -> Self {
        AxisValue::Int(i)
    }
}

impl From<f64> for AxisValue {
    fn from(f: f64) -> Self {
        AxisValue::Float(f)
    }
}

impl From<bool> for AxisValue {
    fn from(b: bool) -> Self {
        AxisValue::Bool(b)
    }
}
