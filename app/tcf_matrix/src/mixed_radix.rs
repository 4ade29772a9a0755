/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Bijection between permutation ids and per-axis value vectors.
//!
//! With domains `D_0 .. D_n-1`, id `i` is the mixed-radix number whose
//! digit `k` is the ordinal of the value in `D_k`, most significant first:
//!
//! ```text
//! i = sum(ordinal_k * B_k)    B_k = |D_k+1| * ... * |D_n-1|
//! ```

use std::collections::HashMap;

use crate::value::AxisValue;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MixedRadixError {
    #[error("Value `{value}` appears more than once in the domain of axis #{axis}")]
    DuplicateValue { axis: usize, value: AxisValue },
    #[error("Invalid value for axis #{axis}: {reason}")]
    InvalidValue { axis: usize, reason: String },
    #[error("Permutation id {id} is out of range, only {max} permutations exist")]
    OutOfRange { id: u64, max: u64 },
    #[error("Axis domains are too large, the permutation count does not fit in 64 bits")]
    Overflow,
}

#[derive(Debug, Clone)]
pub struct MixedRadix {
    domains: Vec<Vec<AxisValue>>,
    ordinals: Vec<HashMap<AxisValue, u64>>,
    /// `bases[k]` is the weight of digit `k`.
    bases: Vec<u64>,
    max: u64,
}

impl MixedRadix {
    /// Domains are used in the order given; callers wanting a canonical
    /// numbering sort them first.
    pub fn new(domains: Vec<Vec<AxisValue>>) -> Result<Self, MixedRadixError> {
        let mut ordinals = Vec::with_capacity(domains.len());
        for (axis, domain) in domains.iter().enumerate() {
            let mut map = HashMap::with_capacity(domain.len());
            for (ordinal, value) in domain.iter().enumerate() {
                if map.insert(value.clone(), ordinal as u64).is_some() {
                    return Err(MixedRadixError::DuplicateValue {
                        axis,
                        value: value.clone(),
                    });
                }
            }
            ordinals.push(map);
        }

        let mut bases = vec![1u64; domains.len()];
        let mut acc: u64 = 1;
        for k in (0..domains.len()).rev() {
            bases[k] = acc;
            acc = acc
                .checked_mul(domains[k].len() as u64)
                .ok_or(MixedRadixError::Overflow)?;
        }

        Ok(Self {
            domains,
            ordinals,
            bases,
            max: acc,
        })
    }

    /// Number of permutations; one (the empty permutation) with no axes.
    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn axes(&self) -> usize {
        self.domains.len()
    }

    pub fn domain(&self, axis: usize) -> Option<&[AxisValue]> {
        self.domains.get(axis).map(|d| d.as_slice())
    }

    pub fn encode(&self, values: &[AxisValue]) -> Result<u64, MixedRadixError> {
        if values.len() != self.domains.len() {
            return Err(MixedRadixError::InvalidValue {
                axis: values.len().min(self.domains.len()),
                reason: format!(
                    "expected {} values, got {}",
                    self.domains.len(),
                    values.len()
                ),
            });
        }
        let mut id = 0;
        for (axis, value) in values.iter().enumerate() {
            let ordinal =
                self.ordinals[axis]
                    .get(value)
                    .ok_or_else(|| MixedRadixError::InvalidValue {
                        axis,
                        reason: format!("`{}` is not in the domain", value),
                    })?;
            id += ordinal * self.bases[axis];
        }
        Ok(id)
    }

    pub fn decode(&self, id: u64) -> Result<Vec<AxisValue>, MixedRadixError> {
        if id >= self.max {
            return Err(MixedRadixError::OutOfRange { id, max: self.max });
        }
        let mut remainder = id;
        let mut values = Vec::with_capacity(self.domains.len());
        for (domain, base) in self.domains.iter().zip(&self.bases) {
            let ordinal = remainder / base;
            remainder %= base;
            values.push(domain[ordinal as usize].clone());
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn strs(values: &[&str]) -> Vec<AxisValue> {
        values.iter().map(|v| AxisValue::from(*v)).collect()
    }

    #[test]
    fn test_two_by_three() -> anyhow::Result<()> {
        let codec = MixedRadix::new(vec![strs(&["a", "b"]), strs(&["x", "y", "z"])])?;
        assert_eq!(6, codec.max());
        assert_eq!(strs(&["a", "x"]), codec.decode(0)?);
        assert_eq!(strs(&["a", "y"]), codec.decode(1)?);
        assert_eq!(strs(&["b", "x"]), codec.decode(3)?);
        assert_eq!(strs(&["b", "z"]), codec.decode(5)?);
        assert_eq!(5, codec.encode(&strs(&["b", "z"]))?);
        Ok(())
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let codec = MixedRadix::new(vec![
            strs(&["a", "b", "c"]),
            vec![AxisValue::Int(1), AxisValue::Int(2)],
            vec![AxisValue::Bool(false), AxisValue::Bool(true)],
            strs(&["only"]),
        ])?;
        assert_eq!(12, codec.max());
        for id in 0..codec.max() {
            assert_eq!(id, codec.encode(&codec.decode(id)?)?);
        }
        Ok(())
    }

    #[test]
    fn test_no_axes() -> anyhow::Result<()> {
        let codec = MixedRadix::new(Vec::new())?;
        assert_eq!(1, codec.max());
        assert_eq!(Vec::<AxisValue>::new(), codec.decode(0)?);
        assert_eq!(0, codec.encode(&[])?);
        Ok(())
    }

    #[test]
    fn test_errors() -> anyhow::Result<()> {
        assert_matches!(
            MixedRadix::new(vec![strs(&["a", "a"])]),
            Err(MixedRadixError::DuplicateValue { axis: 0, .. })
        );
        let codec = MixedRadix::new(vec![strs(&["a", "b"])])?;
        assert_matches!(
            codec.decode(2),
            Err(MixedRadixError::OutOfRange { id: 2, max: 2 })
        );
        assert_matches!(
            codec.encode(&strs(&["c"])),
            Err(MixedRadixError::InvalidValue { axis: 0, .. })
        );
        assert_matches!(
            codec.encode(&strs(&["a", "b"])),
            Err(MixedRadixError::InvalidValue { .. })
        );
        Ok(())
    }

    #[test]
    fn test_empty_domain() -> anyhow::Result<()> {
        let codec = MixedRadix::new(vec![strs(&["a"]), Vec::new()])?;
        assert_eq!(0, codec.max());
        assert_matches!(codec.decode(0), Err(MixedRadixError::OutOfRange { .. }));
        Ok(())
    }

    #[test]
    fn test_overflow() {
        let wide: Vec<AxisValue> = (0..65536).map(AxisValue::Int).collect();
        assert_matches!(
            MixedRadix::new(vec![wide.clone(), wide.clone(), wide.clone(), wide.clone(), wide]),
            Err(MixedRadixError::Overflow)
        );
    }
}
