/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;

use allocative::Allocative;
use derive_more::Display;
use itertools::Itertools;

use crate::mixed_radix::MixedRadix;
use crate::mixed_radix::MixedRadixError;
use crate::value::AxisValue;

/// Where an axis gets its values from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisDomain {
    Values(Vec<AxisValue>),
    /// Filled in from the values observed in the inventory.
    FromInventory,
}

/// Name of an axis in the unified axis set.
///
/// The derived order puts every test case axis before every role axis, test
/// case axes by name and role axes by role then axis name.
#[derive(
    Debug, Clone, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Allocative
)]
pub enum AxisKey {
    #[display(fmt = "{}", _0)]
    Testcase(String),
    #[display(fmt = "{}.{}", _0, _1)]
    Role(String, String),
}

impl AxisKey {
    pub fn role(&self) -> Option<&str> {
        match self {
            AxisKey::Testcase(_) => None,
            AxisKey::Role(role, _) => Some(role),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AxisKey::Testcase(name) => name,
            AxisKey::Role(_, name) => name,
        }
    }
}

/// Fills in [`AxisDomain::FromInventory`] domains.
pub trait AxisExpander {
    /// Returns the distinct values `key` takes; they need not be sorted.
    fn expand(&self, key: &AxisKey) -> anyhow::Result<Vec<AxisValue>>;
}

/// An expander for axis sets that have no open domains.
pub struct NoExpansion;

impl AxisExpander for NoExpansion {
    fn expand(&self, key: &AxisKey) -> anyhow::Result<Vec<AxisValue>> {
        Err(AxesError::Unexpandable(key.clone()).into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AxesError {
    #[error("Axis `{key}`: {source}")]
    Domain {
        key: AxisKey,
        source: MixedRadixError,
    },
    #[error(transparent)]
    Codec(#[from] MixedRadixError),
    #[error("Axis `{key}` needs expansion from the inventory and that failed")]
    Expansion {
        key: AxisKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("Axis `{0}` has no explicit values and nothing to expand it from")]
    Unexpandable(AxisKey),
}

/// Declared axes of one test case, before expansion.
#[derive(Debug, Clone, Default)]
pub struct AxesDecl {
    axes: BTreeMap<AxisKey, AxisDomain>,
}

impl AxesDecl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn testcase_axis(&mut self, name: &str, domain: AxisDomain) -> &mut Self {
        self.axes.insert(AxisKey::Testcase(name.to_owned()), domain);
        self
    }

    pub fn role_axis(&mut self, role: &str, name: &str, domain: AxisDomain) -> &mut Self {
        self.axes
            .insert(AxisKey::Role(role.to_owned(), name.to_owned()), domain);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AxisKey, &AxisDomain)> {
        self.axes.iter()
    }
}

/// The sorted, expanded axes of a test case and the codec over them.
#[derive(Debug, Clone)]
pub struct AxisSet {
    keys: Vec<AxisKey>,
    codec: MixedRadix,
}

impl AxisSet {
    pub fn build(decl: &AxesDecl, expander: &dyn AxisExpander) -> Result<Self, AxesError> {
        let mut keys = Vec::with_capacity(decl.axes.len());
        let mut domains = Vec::with_capacity(decl.axes.len());
        // BTreeMap iteration already follows the `AxisKey` order.
        for (key, domain) in &decl.axes {
            let mut values = match domain {
                AxisDomain::Values(values) => {
                    let mut values = values.clone();
                    values.sort();
                    if let Some((a, _)) = values.iter().tuple_windows().find(|(a, b)| a == b) {
                        return Err(AxesError::Domain {
                            key: key.clone(),
                            source: MixedRadixError::DuplicateValue {
                                axis: keys.len(),
                                value: a.clone(),
                            },
                        });
                    }
                    values
                }
                AxisDomain::FromInventory => {
                    let mut values =
                        expander
                            .expand(key)
                            .map_err(|source| AxesError::Expansion {
                                key: key.clone(),
                                source,
                            })?;
                    values.sort();
                    values.dedup();
                    values
                }
            };
            values.shrink_to_fit();
            tracing::debug!(axis = %key, values = values.len(), "Axis domain");
            keys.push(key.clone());
            domains.push(values);
        }
        Ok(Self {
            keys,
            codec: MixedRadix::new(domains)?,
        })
    }

    pub fn keys(&self) -> &[AxisKey] {
        &self.keys
    }

    pub fn codec(&self) -> &MixedRadix {
        &self.codec
    }

    pub fn max(&self) -> u64 {
        self.codec.max()
    }

    pub fn permutation(&self, id: u64) -> Result<AxisPermutation, MixedRadixError> {
        let values = self.codec.decode(id)?;
        Ok(AxisPermutation {
            id,
            keys: self.keys.clone(),
            values,
        })
    }
}

/// One concrete combination of axis values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisPermutation {
    pub id: u64,
    keys: Vec<AxisKey>,
    values: Vec<AxisValue>,
}

impl AxisPermutation {
    pub fn values(&self) -> &[AxisValue] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AxisKey, &AxisValue)> {
        self.keys.iter().zip(&self.values)
    }

    pub fn get(&self, key: &AxisKey) -> Option<&AxisValue> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// The `(axis, value)` pairs belonging to `role`.
    pub fn role_values<'a>(
        &'a self,
        role: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a AxisValue)> + 'a {
        self.iter().filter_map(move |(k, v)| match k {
            AxisKey::Role(r, name) if r == role => Some((name.as_str(), v)),
            _ => None,
        })
    }

    pub fn testcase_values(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.iter().filter_map(|(k, v)| match k {
            AxisKey::Testcase(name) => Some((name.as_str(), v)),
            AxisKey::Role(..) => None,
        })
    }
}
