/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Which targets can fill a role.
//!
//! Resolution scans the inventory snapshot once per distinct query and
//! remembers the answer; a run asks the same question for many axis
//! permutations, so most queries are cache hits.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use tcf_matrix::AxisKey;
use tcf_matrix::AxisValue;
use tcf_matrix::axes::AxisExpander;

use crate::cache::CacheStats;
use crate::cache::LruCache;
use crate::fullid::Fullid;
use crate::group::TargetGroup;
use crate::inventory::InventorySnapshot;
use crate::inventory::TargetInventory;
use crate::role::PredicateContext;
use crate::role::Spec;
use crate::role::TargetRole;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Role `{role}`: invalid target specification")]
    InvalidSpecification {
        role: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Unknown role `{0}`")]
    UnknownRole(String),
}

/// Eligible targets of a role, in canonical order.
pub type EligibleSet = Arc<BTreeSet<Fullid>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    /// Full inventory scans performed.
    pub scans: u64,
    pub cache: CacheStats,
}

pub struct TargetResolver {
    inventory: Arc<InventorySnapshot>,
    cache: LruCache<String, EligibleSet>,
    scans: AtomicU64,
}

impl TargetResolver {
    pub fn new(inventory: Arc<InventorySnapshot>, cache_capacity: usize) -> Self {
        Self {
            inventory,
            cache: LruCache::new(cache_capacity),
            scans: AtomicU64::new(0),
        }
    }

    pub fn inventory(&self) -> &Arc<InventorySnapshot> {
        &self.inventory
    }

    /// The subset of a role's axis values that can restrict targets: those
    /// named after an inventory field. Other axes only parametrize the test.
    pub fn axes_filter<'a>(
        &self,
        values: impl IntoIterator<Item = (&'a str, &'a AxisValue)>,
    ) -> BTreeMap<String, AxisValue> {
        values
            .into_iter()
            .filter(|(name, _)| self.inventory.has_key(name))
            .map(|(name, value)| (name.to_owned(), value.clone()))
            .collect()
    }

    /// Targets that carry every `filter` field with the given value and
    /// pass the role's spec, plus its interconnect spec when `seed` is
    /// given. Targets already in `seed` are never eligible.
    pub fn resolve(
        &self,
        role: &TargetRole,
        filter: &BTreeMap<String, AxisValue>,
        seed: Option<&TargetGroup>,
    ) -> Result<EligibleSet, ResolveError> {
        let key = fingerprint(role, filter, seed);
        self.cache
            .get_or_try_compute(&key, || self.scan(role, filter, seed))
    }

    fn scan(
        &self,
        role: &TargetRole,
        filter: &BTreeMap<String, AxisValue>,
        seed: Option<&TargetGroup>,
    ) -> Result<EligibleSet, ResolveError> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let mut eligible = BTreeSet::new();
        for target in self.inventory.iter() {
            if seed.is_some_and(|seed| seed.contains_target(target.fullid())) {
                continue;
            }
            if !filter.iter().all(|(field, value)| {
                target
                    .get(field)
                    .is_some_and(|found| value.matches_json(found))
            }) {
                continue;
            }
            if !self.passes(role, role.spec(), role.spec_args(), None, target)? {
                continue;
            }
            if let Some(seed) = seed {
                if !self.passes(role, role.ic_spec(), role.ic_spec_args(), Some(seed), target)? {
                    continue;
                }
            }
            eligible.insert(target.fullid().clone());
        }
        tracing::debug!(
            role = role.name(),
            eligible = eligible.len(),
            filter = filter.len(),
            seeded = seed.is_some(),
            "Resolved role candidates"
        );
        Ok(Arc::new(eligible))
    }

    fn passes(
        &self,
        role: &TargetRole,
        spec: Option<&Spec>,
        args: &BTreeMap<String, Value>,
        seed: Option<&TargetGroup>,
        target: &TargetInventory,
    ) -> Result<bool, ResolveError> {
        let Some(spec) = spec else {
            return Ok(true);
        };
        let cx = PredicateContext {
            role: role.name(),
            seed,
            args,
        };
        spec.matches(&cx, target)
            .map_err(|source| ResolveError::InvalidSpecification {
                role: role.name().to_owned(),
                source,
            })
    }

    /// Distinct values of `field` over the targets passing `role`'s spec,
    /// or over every target when there is no role.
    pub fn expand(
        &self,
        role: Option<&TargetRole>,
        field: &str,
    ) -> Result<Vec<AxisValue>, ResolveError> {
        let mut values = BTreeSet::new();
        for target in self.inventory.iter() {
            if let Some(role) = role {
                if !self.passes(role, role.spec(), role.spec_args(), None, target)? {
                    continue;
                }
            }
            match target.get(field).and_then(AxisValue::from_json) {
                Some(value) => {
                    values.insert(value);
                }
                None => {
                    tracing::trace!(fullid = %target.fullid(), field, "No scalar value for axis");
                }
            }
        }
        Ok(values.into_iter().collect())
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            scans: self.scans.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }
}

fn fingerprint(
    role: &TargetRole,
    filter: &BTreeMap<String, AxisValue>,
    seed: Option<&TargetGroup>,
) -> String {
    fn args_json(args: &BTreeMap<String, Value>) -> String {
        Value::Object(args.clone().into_iter().collect()).to_string()
    }

    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update(bytes);
        hasher.update([0u8]);
    };
    for (name, value) in filter {
        field(name.as_bytes());
        field(value.to_json().to_string().as_bytes());
    }
    field(b"seed");
    if let Some(seed) = seed {
        field(seed.to_string().as_bytes());
    }
    field(role.spec().map(Spec::fingerprint).unwrap_or_default().as_bytes());
    field(if role.is_interconnect() { b"ic" } else { b"ep" });
    field(args_json(role.spec_args()).as_bytes());
    field(role.ic_spec().map(Spec::fingerprint).unwrap_or_default().as_bytes());
    field(args_json(role.ic_spec_args()).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fills open axes of a test case from the inventory.
pub struct InventoryExpander<'a> {
    resolver: &'a TargetResolver,
    roles: &'a BTreeMap<String, TargetRole>,
}

impl<'a> InventoryExpander<'a> {
    pub fn new(resolver: &'a TargetResolver, roles: &'a BTreeMap<String, TargetRole>) -> Self {
        Self { resolver, roles }
    }
}

impl AxisExpander for InventoryExpander<'_> {
    fn expand(&self, key: &AxisKey) -> anyhow::Result<Vec<AxisValue>> {
        let role = match key.role() {
            None => None,
            Some(name) => Some(
                self.roles
                    .get(name)
                    .ok_or_else(|| ResolveError::UnknownRole(name.to_owned()))?,
            ),
        };
        Ok(self.resolver.expand(role, key.name())?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use maplit::btreemap;
    use serde_json::json;
    use tcf_matrix::axes::AxesDecl;
    use tcf_matrix::axes::AxisDomain;
    use tcf_matrix::axes::AxisSet;

    use super::*;
    use crate::role::TargetPredicate;

    fn f(s: &str) -> Fullid {
        Fullid::parse(s).unwrap()
    }

    fn snapshot() -> Arc<InventorySnapshot> {
        Arc::new(InventorySnapshot::from_targets(vec![
            (f("s1/nwa"), json!({"type": "ethernet"})),
            (
                f("s1/t1"),
                json!({"type": "qemu", "bsp": "x86", "interconnects": {"nwa": {}}}),
            ),
            (
                f("s1/t2"),
                json!({"type": "qemu", "bsp": "arm", "interconnects": {"nwa": {}}}),
            ),
            (f("s2/t3"), json!({"type": "qemu", "bsp": "x86"})),
        ]))
    }

    fn ids(set: &EligibleSet) -> Vec<&str> {
        set.iter().map(|f| f.as_str()).collect()
    }

    #[test]
    fn test_resolve_and_cache() -> anyhow::Result<()> {
        let resolver = TargetResolver::new(snapshot(), 10);
        let role = TargetRole::new("target").with_spec("type == 'qemu'")?;
        let filter = BTreeMap::new();

        let first = resolver.resolve(&role, &filter, None)?;
        assert_eq!(vec!["s1/t1", "s1/t2", "s2/t3"], ids(&first));
        assert_eq!(1, resolver.stats().scans);

        let second = resolver.resolve(&role, &filter, None)?;
        assert_eq!(first, second);
        let stats = resolver.stats();
        assert_eq!(1, stats.scans);
        assert_eq!(1, stats.cache.hits);
        assert_eq!(1, stats.cache.misses);
        Ok(())
    }

    #[test]
    fn test_axis_filter() -> anyhow::Result<()> {
        let resolver = TargetResolver::new(snapshot(), 10);
        let role = TargetRole::new("target").with_spec("type == 'qemu'")?;
        let x86 = AxisValue::from("x86");
        let speed = AxisValue::Int(100);
        let filter = resolver.axes_filter(vec![("bsp", &x86), ("speed", &speed)]);
        assert_eq!(btreemap! { "bsp".to_owned() => x86.clone() }, filter);
        assert_eq!(
            vec!["s1/t1", "s2/t3"],
            ids(&resolver.resolve(&role, &filter, None)?)
        );
        Ok(())
    }

    #[test]
    fn test_seeded_by_interconnect() -> anyhow::Result<()> {
        let resolver = TargetResolver::new(snapshot(), 10);
        let role = TargetRole::new("target").with_spec("type == 'qemu'")?;
        let seed = TargetGroup::new(btreemap! { "ic".to_owned() => f("s1/nwa") });
        assert_eq!(
            vec!["s1/t1", "s1/t2"],
            ids(&resolver.resolve(&role, &BTreeMap::new(), Some(&seed))?)
        );

        // The seed's own targets are excluded even when the spec admits them.
        let any = TargetRole::new("any").with_ic_spec(None);
        assert_eq!(
            vec!["s1/t1", "s1/t2", "s2/t3"],
            ids(&resolver.resolve(&any, &BTreeMap::new(), Some(&seed))?)
        );
        Ok(())
    }

    #[derive(Debug)]
    struct Failing;

    impl TargetPredicate for Failing {
        fn fingerprint(&self) -> String {
            "failing".to_owned()
        }

        fn matches(
            &self,
            _cx: &PredicateContext<'_>,
            _target: &TargetInventory,
        ) -> anyhow::Result<bool> {
            anyhow::bail!("predicate exploded")
        }
    }

    #[test]
    fn test_predicate_error_propagates() {
        let resolver = TargetResolver::new(snapshot(), 10);
        let role = TargetRole::new("target").with_spec_fn(Arc::new(Failing));
        assert_matches!(
            resolver.resolve(&role, &BTreeMap::new(), None),
            Err(ResolveError::InvalidSpecification { role, .. }) if role == "target"
        );
        // Failures are not cached.
        assert!(resolver.resolve(&role, &BTreeMap::new(), None).is_err());
        assert_eq!(2, resolver.stats().scans);
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() -> anyhow::Result<()> {
        let a = TargetRole::new("a").with_spec("type == 'qemu'")?;
        let b = TargetRole::new("b").with_spec("type == 'qemu'")?;
        let c = TargetRole::new("c").with_spec("type == 'qemu'")?.with_spec_arg("x", json!(1));
        let none = BTreeMap::new();
        let filtered = btreemap! { "bsp".to_owned() => AxisValue::from("x86") };
        assert_eq!(fingerprint(&a, &none, None), fingerprint(&b, &none, None));
        assert_ne!(fingerprint(&a, &none, None), fingerprint(&c, &none, None));
        assert_ne!(fingerprint(&a, &none, None), fingerprint(&a, &filtered, None));
        let seed = TargetGroup::new(btreemap! { "ic".to_owned() => f("s1/nwa") });
        assert_ne!(fingerprint(&a, &none, None), fingerprint(&a, &none, Some(&seed)));
        Ok(())
    }

    #[test]
    fn test_open_axis_expansion() -> anyhow::Result<()> {
        let resolver = TargetResolver::new(snapshot(), 10);
        let roles = btreemap! {
            "target".to_owned() => TargetRole::new("target").with_spec("type == 'qemu' and interconnects")?,
        };
        let mut decl = AxesDecl::new();
        decl.role_axis("target", "bsp", AxisDomain::FromInventory)
            .testcase_axis("type", AxisDomain::FromInventory);
        let set = AxisSet::build(&decl, &InventoryExpander::new(&resolver, &roles))?;
        assert_eq!(
            Some(vec![AxisValue::from("arm"), AxisValue::from("x86")]),
            set.codec().domain(1).map(|d| d.to_vec())
        );
        assert_eq!(
            Some(vec![AxisValue::from("ethernet"), AxisValue::from("qemu")]),
            set.codec().domain(0).map(|d| d.to_vec())
        );

        let mut unknown = AxesDecl::new();
        unknown.role_axis("dut", "bsp", AxisDomain::FromInventory);
        assert!(AxisSet::build(&unknown, &InventoryExpander::new(&resolver, &roles)).is_err());
        Ok(())
    }
}
