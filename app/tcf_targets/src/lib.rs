/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Targets: their inventory, the roles a test case declares for them, and
//! the groups of targets that can fill those roles together.

pub mod cache;
pub mod config;
pub mod fullid;
pub mod group;
pub mod group_iter;
pub mod inventory;
pub mod pairing;
pub mod resolver;
pub mod role;
pub mod spec;

pub use fullid::Fullid;
pub use fullid::ServerId;
pub use group::GroupId;
pub use group::TargetGroup;
