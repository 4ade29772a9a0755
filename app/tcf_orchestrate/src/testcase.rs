/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Test cases as the drivers describe them: the roles they need filled,
//! the axes they vary over and the knobs controlling how many runs they get.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use tcf_matrix::axes::AxesDecl;
use tcf_matrix::axes::AxisDomain;
use tcf_matrix::enumerator::Randomizer;
use tcf_targets::pairing::TargetGroupFilter;
use tcf_targets::role::TargetRole;

use crate::config::SessionConfig;

#[derive(Clone)]
pub struct TestCase {
    name: String,
    origin: Option<PathBuf>,
    roles: BTreeMap<String, TargetRole>,
    axes: BTreeMap<String, AxisDomain>,
    axes_randomizer: Randomizer,
    target_group_randomizer: Randomizer,
    /// Name of a filter registered with the session.
    axes_permutation_filter: Option<String>,
    target_group_filter: Option<TargetGroupFilter>,
    axes_permutations: Option<u64>,
    target_group_permutations: Option<u64>,
    overallocation_factor: Option<f64>,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("roles", &self.roles.keys().collect::<Vec<_>>())
            .field("axes", &self.axes)
            .field("axes_randomizer", &self.axes_randomizer)
            .field("target_group_randomizer", &self.target_group_randomizer)
            .finish_non_exhaustive()
    }
}

/// Run counts for one test case, after its overrides are applied to the
/// session defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Knobs {
    /// Zero runs every permutation.
    pub axes_permutations: u64,
    /// Zero runs on every group found.
    pub target_group_permutations: u64,
    pub overallocation_factor: f64,
}

impl Knobs {
    /// Target groups to request per axis permutation; `None` when every
    /// group that can be found is wanted.
    pub fn groups_to_request(&self) -> Option<u64> {
        if self.target_group_permutations == 0 {
            return None;
        }
        let wanted = self.target_group_permutations;
        let overallocated = (self.overallocation_factor * wanted as f64) as u64;
        Some(overallocated.max(wanted))
    }
}

impl TestCase {
    /// Randomizes both axes and target groups unless told otherwise.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            origin: None,
            roles: BTreeMap::new(),
            axes: BTreeMap::new(),
            axes_randomizer: Randomizer::Random,
            target_group_randomizer: Randomizer::Random,
            axes_permutation_filter: None,
            target_group_filter: None,
            axes_permutations: None,
            target_group_permutations: None,
            overallocation_factor: None,
        }
    }

    pub fn with_origin(mut self, path: &Path) -> Self {
        self.origin = Some(path.to_owned());
        self
    }

    pub fn with_role(mut self, role: TargetRole) -> Self {
        self.roles.insert(role.name().to_owned(), role);
        self
    }

    pub fn with_axis(mut self, name: &str, domain: AxisDomain) -> Self {
        self.axes.insert(name.to_owned(), domain);
        self
    }

    pub fn with_axes_randomizer(mut self, randomizer: Randomizer) -> Self {
        self.axes_randomizer = randomizer;
        self
    }

    pub fn with_target_group_randomizer(mut self, randomizer: Randomizer) -> Self {
        self.target_group_randomizer = randomizer;
        self
    }

    pub fn with_axes_permutation_filter(mut self, name: &str) -> Self {
        self.axes_permutation_filter = Some(name.to_owned());
        self
    }

    pub fn with_target_group_filter(mut self, filter: TargetGroupFilter) -> Self {
        self.target_group_filter = Some(filter);
        self
    }

    pub fn with_axes_permutations(mut self, n: u64) -> Self {
        self.axes_permutations = Some(n);
        self
    }

    pub fn with_target_group_permutations(mut self, n: u64) -> Self {
        self.target_group_permutations = Some(n);
        self
    }

    pub fn with_overallocation_factor(mut self, factor: f64) -> Self {
        self.overallocation_factor = Some(factor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    pub fn roles(&self) -> &BTreeMap<String, TargetRole> {
        &self.roles
    }

    pub fn axes_randomizer(&self) -> Randomizer {
        self.axes_randomizer
    }

    pub fn target_group_randomizer(&self) -> Randomizer {
        self.target_group_randomizer
    }

    pub fn axes_permutation_filter(&self) -> Option<&str> {
        self.axes_permutation_filter.as_deref()
    }

    pub fn target_group_filter(&self) -> Option<&TargetGroupFilter> {
        self.target_group_filter.as_ref()
    }

    pub fn knobs(&self, defaults: &SessionConfig) -> Knobs {
        Knobs {
            axes_permutations: self
                .axes_permutations
                .unwrap_or(defaults.axes_permutations),
            target_group_permutations: self
                .target_group_permutations
                .unwrap_or(defaults.target_group_permutations),
            overallocation_factor: self
                .overallocation_factor
                .unwrap_or(defaults.overallocation_factor)
                .max(1.0),
        }
    }

    /// The test case's own axes and those of its roles.
    pub fn axes_decl(&self) -> AxesDecl {
        let mut decl = AxesDecl::new();
        for (name, domain) in &self.axes {
            decl.testcase_axis(name, domain.clone());
        }
        for (role_name, role) in &self.roles {
            for (name, domain) in role.axes() {
                decl.role_axis(role_name, name, domain.clone());
            }
        }
        decl
    }
}
