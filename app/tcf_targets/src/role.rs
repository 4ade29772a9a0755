/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use dupe::Dupe;
use serde_json::Value;
use tcf_matrix::axes::AxisDomain;

use crate::group::TargetGroup;
use crate::inventory::TargetInventory;
use crate::spec::SpecError;
use crate::spec::SpecExpr;

/// What a predicate gets to see besides the target.
pub struct PredicateContext<'a> {
    /// Role being filled.
    pub role: &'a str,
    /// Interconnect group already chosen, when resolving endpoint roles.
    pub seed: Option<&'a TargetGroup>,
    pub args: &'a BTreeMap<String, Value>,
}

/// Target selection implemented in code rather than as an expression.
pub trait TargetPredicate: Send + Sync + Debug {
    /// Identifies the predicate in resolver cache keys; two predicates with
    /// the same fingerprint must select the same targets.
    fn fingerprint(&self) -> String;

    fn matches(
        &self,
        cx: &PredicateContext<'_>,
        target: &TargetInventory,
    ) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub enum Spec {
    Expr(SpecExpr),
    Callable(Arc<dyn TargetPredicate>),
}

impl Spec {
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        Ok(Spec::Expr(SpecExpr::parse(text)?))
    }

    pub fn fingerprint(&self) -> String {
        match self {
            Spec::Expr(e) => e.text().to_owned(),
            Spec::Callable(p) => p.fingerprint(),
        }
    }

    pub fn matches(
        &self,
        cx: &PredicateContext<'_>,
        target: &TargetInventory,
    ) -> anyhow::Result<bool> {
        match self {
            Spec::Expr(e) => Ok(e.eval(target)),
            Spec::Callable(p) => p.matches(cx, target),
        }
    }
}

impl Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spec::Expr(e) => write!(f, "{:?}", e),
            Spec::Callable(p) => write!(f, "{:?}", p),
        }
    }
}

/// Accepts targets that are members of the interconnects in the seed
/// group.
///
/// A target is a member of interconnect `IC` when its inventory has the
/// key `interconnects.IC`. The `interconnects` argument, a list of role
/// names, restricts which seed roles must be shared; without it every
/// interconnect in the seed counts.
#[derive(Debug, Clone, Copy, Dupe, Default)]
pub struct InterconnectMembership;

impl TargetPredicate for InterconnectMembership {
    fn fingerprint(&self) -> String {
        "builtin:interconnect-membership".to_owned()
    }

    fn matches(
        &self,
        cx: &PredicateContext<'_>,
        target: &TargetInventory,
    ) -> anyhow::Result<bool> {
        let Some(seed) = cx.seed else {
            return Ok(true);
        };
        let wanted: Option<Vec<&str>> = match cx.args.get("interconnects") {
            None => None,
            Some(Value::Array(roles)) => Some(
                roles
                    .iter()
                    .map(|r| {
                        r.as_str().ok_or_else(|| {
                            anyhow::anyhow!(
                                "role `{}`: `interconnects` must list role names, got {}",
                                cx.role,
                                r
                            )
                        })
                    })
                    .collect::<anyhow::Result<_>>()?,
            ),
            Some(other) => anyhow::bail!(
                "role `{}`: `interconnects` must be a list, got {}",
                cx.role,
                other
            ),
        };
        for (ic_role, ic) in seed.iter() {
            if let Some(wanted) = &wanted {
                if !wanted.contains(&ic_role) {
                    continue;
                }
            }
            let key = format!("interconnects.{}", ic.target_id());
            if target.get(&key).is_none() {
                tracing::trace!(fullid = %target.fullid(), %key, "Not in interconnect");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A slot in a test case to be filled by one target.
#[derive(Clone, Debug)]
pub struct TargetRole {
    name: String,
    spec: Option<Spec>,
    spec_args: BTreeMap<String, Value>,
    ic_spec: Option<Spec>,
    ic_spec_args: BTreeMap<String, Value>,
    interconnect: bool,
    axes: BTreeMap<String, AxisDomain>,
}

impl TargetRole {
    /// An endpoint role; its default interconnect check is
    /// [`InterconnectMembership`].
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            spec: None,
            spec_args: BTreeMap::new(),
            ic_spec: Some(Spec::Callable(Arc::new(InterconnectMembership))),
            ic_spec_args: BTreeMap::new(),
            interconnect: false,
            axes: BTreeMap::new(),
        }
    }

    /// An interconnect role (e.g. a network the other targets attach to).
    pub fn new_interconnect(name: &str) -> Self {
        Self {
            interconnect: true,
            ic_spec: None,
            ..Self::new(name)
        }
    }

    /// Parses `text` now so a malformed expression fails at declaration.
    pub fn with_spec(mut self, text: &str) -> Result<Self, SpecError> {
        self.spec = Some(Spec::parse(text)?);
        Ok(self)
    }

    pub fn with_spec_fn(mut self, predicate: Arc<dyn TargetPredicate>) -> Self {
        self.spec = Some(Spec::Callable(predicate));
        self
    }

    pub fn with_spec_arg(mut self, name: &str, value: Value) -> Self {
        self.spec_args.insert(name.to_owned(), value);
        self
    }

    pub fn with_ic_spec(mut self, spec: Option<Spec>) -> Self {
        self.ic_spec = spec;
        self
    }

    pub fn with_ic_spec_arg(mut self, name: &str, value: Value) -> Self {
        self.ic_spec_args.insert(name.to_owned(), value);
        self
    }

    pub fn with_axis(mut self, name: &str, domain: AxisDomain) -> Self {
        self.axes.insert(name.to_owned(), domain);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> Option<&Spec> {
        self.spec.as_ref()
    }

    pub fn spec_args(&self) -> &BTreeMap<String, Value> {
        &self.spec_args
    }

    pub fn ic_spec(&self) -> Option<&Spec> {
        self.ic_spec.as_ref()
    }

    pub fn ic_spec_args(&self) -> &BTreeMap<String, Value> {
        &self.ic_spec_args
    }

    pub fn is_interconnect(&self) -> bool {
        self.interconnect
    }

    pub fn axes(&self) -> &BTreeMap<String, AxisDomain> {
        &self.axes
    }
}
