/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;
use std::sync::Arc;

use tcf_matrix::AxisValue;
use tcf_matrix::enumerator::PermutationFilter;

/// Axis permutation filters test cases can refer to by name.
///
/// Filters are registered while the session is set up, from configuration
/// code; test cases only name them.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: BTreeMap<String, PermutationFilter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filter` as `name`, replacing any filter already there.
    /// The filter sees the permutation id and its values and returns
    /// whether the permutation is to be run.
    pub fn register(
        &mut self,
        name: &str,
        filter: impl Fn(u64, &[AxisValue]) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        if self
            .filters
            .insert(name.to_owned(), Arc::new(filter))
            .is_some()
        {
            tracing::warn!(name, "Replacing axis permutation filter");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<PermutationFilter> {
        self.filters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }
}
