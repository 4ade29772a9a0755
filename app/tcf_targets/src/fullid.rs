/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;

use derive_more::Display;
use dupe::Dupe;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum FullidError {
    #[error("Target id `{0}` is not of the form `SERVER/TARGETID`")]
    Malformed(String),
}

/// Name of a server in the herd.
#[derive(
    Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
#[display(fmt = "{}", _0)]
pub struct ServerId(Arc<str>);

impl ServerId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A target id qualified by its server, `SERVER/TARGETID`.
///
/// Ordering is by the full string, which is the canonical order in which
/// the inventory is scanned.
#[derive(
    Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
#[display(fmt = "{}", _0)]
#[serde(try_from = "String", into = "String")]
pub struct Fullid(Arc<str>);

impl Fullid {
    pub fn new(server: &ServerId, target_id: &str) -> Self {
        Self(Arc::from(format!("{}/{}", server, target_id)))
    }

    pub fn parse(fullid: &str) -> Result<Self, FullidError> {
        match fullid.split_once('/') {
            Some((server, id)) if !server.is_empty() && !id.is_empty() => {
                Ok(Self(Arc::from(fullid)))
            }
            _ => Err(FullidError::Malformed(fullid.to_owned())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> (&str, &str) {
        // Checked on construction.
        self.0.split_once('/').unwrap_or((&self.0, ""))
    }

    pub fn server(&self) -> ServerId {
        ServerId::new(self.split().0)
    }

    /// The target's id on its server.
    pub fn target_id(&self) -> &str {
        self.split().1
    }
}

impl TryFrom<String> for Fullid {
    type Error = FullidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fullid::parse(&value)
    }
}

impl From<Fullid> for String {
    fn from(value: Fullid) -> Self {
        value.0.to_string()
    }
}
