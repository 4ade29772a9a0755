/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Target inventories as seen by the resolver.
//!
//! Servers describe each target with a nested JSON document. Selection
//! works on the flattened form, where `{"interconnects": {"nwa": {"ipv4_addr":
//! "1.2.3.4"}}}` becomes the keys `interconnects`, `interconnects.nwa` and
//! `interconnects.nwa.ipv4_addr`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::Context;
use serde_json::Value;

use crate::fullid::Fullid;
use crate::spec::SymbolTable;

/// Source of the current inventory, e.g. a client of the herd's servers.
pub trait InventoryProvider: Send + Sync {
    /// Every known target and its nested inventory document.
    fn targets(&self) -> anyhow::Result<Vec<(String, Value)>>;
}

/// Flattens `value`; nested objects are kept under their own key as well
/// as contributing their leaves, empty ones included.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
        if let Value::Object(map) = value {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                walk(&key, v, out);
                out.insert(key, v.clone());
            }
        }
    }

    let mut out = BTreeMap::new();
    walk("", value, &mut out);
    out
}

#[derive(Debug, Clone)]
pub struct TargetInventory {
    fullid: Fullid,
    flat: BTreeMap<String, Value>,
}

impl TargetInventory {
    pub fn new(fullid: Fullid, inventory: &Value) -> Self {
        Self {
            fullid,
            flat: flatten(inventory),
        }
    }

    pub fn fullid(&self) -> &Fullid {
        &self.fullid
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.flat.get(key)
    }

    pub fn flat(&self) -> &BTreeMap<String, Value> {
        &self.flat
    }
}

impl SymbolTable for TargetInventory {
    fn lookup(&self, symbol: &str) -> Option<&Value> {
        self.flat.get(symbol)
    }
}

/// Immutable view of the inventory for one run, in canonical fullid order.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    targets: BTreeMap<Fullid, TargetInventory>,
    keys: BTreeSet<String>,
}

impl InventorySnapshot {
    pub fn from_provider(provider: &dyn InventoryProvider) -> anyhow::Result<Self> {
        let targets = provider
            .targets()
            .context("Fetching target inventory")?
            .into_iter()
            .map(|(fullid, inventory)| {
                let fullid = Fullid::parse(&fullid)?;
                Ok((fullid, inventory))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::from_targets(targets))
    }

    pub fn from_targets(targets: impl IntoIterator<Item = (Fullid, Value)>) -> Self {
        let mut snapshot = Self::default();
        for (fullid, inventory) in targets {
            let target = TargetInventory::new(fullid.clone(), &inventory);
            snapshot.keys.extend(target.flat.keys().cloned());
            snapshot.targets.insert(fullid, target);
        }
        tracing::debug!(
            targets = snapshot.targets.len(),
            keys = snapshot.keys.len(),
            "Inventory snapshot"
        );
        snapshot
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, fullid: &Fullid) -> Option<&TargetInventory> {
        self.targets.get(fullid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetInventory> {
        self.targets.values()
    }

    /// Whether any target's inventory has `key`.
    pub fn has_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_flatten() {
        let flat = flatten(&json!({
            "type": "qemu",
            "interconnects": {"nwa": {}, "nwb": {"ipv4_addr": "10.0.0.1"}},
        }));
        assert_eq!(
            vec![
                "interconnects",
                "interconnects.nwa",
                "interconnects.nwb",
                "interconnects.nwb.ipv4_addr",
                "type",
            ],
            flat.keys().map(|k| k.as_str()).collect::<Vec<_>>()
        );
        assert_eq!(Some(&json!({})), flat.get("interconnects.nwa"));
        assert_eq!(Some(&json!("10.0.0.1")), flat.get("interconnects.nwb.ipv4_addr"));
    }

    struct Fixed;

    impl InventoryProvider for Fixed {
        fn targets(&self) -> anyhow::Result<Vec<(String, Value)>> {
            Ok(vec![
                ("s2/b".to_owned(), json!({"type": "x"})),
                ("s1/a".to_owned(), json!({"ram": {"size": 4}})),
            ])
        }
    }

    struct Broken;

    impl InventoryProvider for Broken {
        fn targets(&self) -> anyhow::Result<Vec<(String, Value)>> {
            Ok(vec![("nofullid".to_owned(), json!({}))])
        }
    }

    #[test]
    fn test_snapshot_order_and_keys() -> anyhow::Result<()> {
        let snapshot = InventorySnapshot::from_provider(&Fixed)?;
        assert_eq!(
            vec!["s1/a", "s2/b"],
            snapshot
                .iter()
                .map(|t| t.fullid().as_str())
                .collect::<Vec<_>>()
        );
        assert!(snapshot.has_key("ram.size"));
        assert!(snapshot.has_key("type"));
        assert!(!snapshot.has_key("cpu"));
        assert!(InventorySnapshot::from_provider(&Broken).is_err());
        Ok(())
    }
}
