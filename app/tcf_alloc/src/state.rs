/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::str::FromStr;
use std::sync::Arc;

use allocative::Allocative;
use derive_more::Display;
use dupe::Dupe;
use serde::Deserialize;
use serde::Serialize;

/// Opaque allocation id issued by a server.
#[derive(
    Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
#[display(fmt = "{}", _0)]
pub struct AllocId(Arc<str>);

impl AllocId {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Names one run (a test case on one axis permutation) to the manager.
#[derive(
    Clone, Dupe, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize
)]
#[display(fmt = "{}", _0)]
pub struct RunId(Arc<str>);

impl RunId {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(
    Debug, Clone, Copy, Dupe, Display, PartialEq, Eq, Hash, Serialize, Deserialize, Allocative
)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationState {
    #[display(fmt = "queued")]
    Queued,
    #[display(fmt = "active")]
    Active,
    /// Removed by us once no longer needed.
    #[display(fmt = "done")]
    Done,
    #[display(fmt = "invalid")]
    Invalid,
    #[display(fmt = "removed")]
    Removed,
    #[display(fmt = "rejected")]
    Rejected,
    #[display(fmt = "overtime")]
    Overtime,
    #[display(fmt = "restart-needed")]
    RestartNeeded,
    #[display(fmt = "timedout")]
    Timedout,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Unknown allocation state `{0}`")]
    Unknown(String),
    #[error("Allocation cannot go from `{from}` to `{to}`")]
    Transition {
        from: AllocationState,
        to: AllocationState,
    },
}

impl AllocationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AllocationState::Queued | AllocationState::Active)
    }

    /// Checks the move to `to`. Terminal states are final and an active
    /// allocation never goes back to the queue.
    pub fn transition(self, to: AllocationState) -> Result<AllocationState, StateError> {
        match (self, to) {
            (from, to) if from.is_terminal() && from != to => {
                Err(StateError::Transition { from, to })
            }
            (AllocationState::Active, AllocationState::Queued) => Err(StateError::Transition {
                from: self,
                to,
            }),
            _ => Ok(to),
        }
    }
}

impl FromStr for AllocationState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => AllocationState::Queued,
            "active" => AllocationState::Active,
            "done" => AllocationState::Done,
            "invalid" => AllocationState::Invalid,
            "removed" => AllocationState::Removed,
            "rejected" => AllocationState::Rejected,
            "overtime" => AllocationState::Overtime,
            "restart-needed" => AllocationState::RestartNeeded,
            "timedout" => AllocationState::Timedout,
            other => return Err(StateError::Unknown(other.to_owned())),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_and_display() {
        for state in [
            AllocationState::Queued,
            AllocationState::RestartNeeded,
            AllocationState::Timedout,
        ] {
            assert_eq!(Ok(state), state.to_string().parse());
            assert_eq!(
                format!("\"{}\"", state),
                serde_json::to_string(&state).unwrap()
            );
        }
        assert_matches!(
            "bogus".parse::<AllocationState>(),
            Err(StateError::Unknown(s)) if s == "bogus"
        );
    }

    #[test]
    fn test_transitions() {
        use AllocationState::*;
        assert_eq!(Ok(Active), Queued.transition(Active));
        assert_eq!(Ok(Queued), Queued.transition(Queued));
        assert_eq!(Ok(Timedout), Active.transition(Timedout));
        assert_matches!(
            Active.transition(Queued),
            Err(StateError::Transition { .. })
        );
        assert_matches!(Done.transition(Active), Err(StateError::Transition { .. }));
        assert!(!Active.is_terminal());
        assert!(Rejected.is_terminal());
    }
}
