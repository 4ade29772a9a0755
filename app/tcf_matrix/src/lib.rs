/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The test matrix: axes, their permutations and the codec numbering them.
//!
//! A test case declares axes of its own and axes per target role
//! ([`axes::AxesDecl`]). Once open domains are expanded the axes are sorted
//! into an [`axes::AxisSet`], so that a permutation id denotes the same
//! values on every run, and [`enumerator::AxesEnumerator`] walks the ids.

pub mod axes;
pub mod enumerator;
pub mod mixed_radix;
pub mod value;

pub use axes::AxisKey;
pub use value::AxisValue;
