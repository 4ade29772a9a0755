/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Boolean expressions over a target's flattened inventory, e.g.
//! `type : "^qemu" and interconnects.nwa and ram.size_gib >= 4`.

mod eval;
pub mod parser;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;

pub use crate::spec::eval::SymbolTable;
use crate::spec::parser::Expr;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Malformed target selection expression `{expr}`:\n{message}")]
    Parse { expr: String, message: String },
    #[error("Invalid regular expression `{pattern}` in `{expr}`")]
    Regex {
        expr: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A parsed selection expression, ready to evaluate against many targets.
#[derive(Clone)]
pub struct SpecExpr {
    text: String,
    ast: Expr,
    regexes: HashMap<String, Regex>,
}

impl SpecExpr {
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let ast = parser::parse_expr(text).map_err(|message| SpecError::Parse {
            expr: text.to_owned(),
            message,
        })?;

        let mut patterns = Vec::new();
        ast.patterns(&mut patterns);
        let mut regexes = HashMap::new();
        for pattern in patterns {
            let regex = Regex::new(pattern).map_err(|source| SpecError::Regex {
                expr: text.to_owned(),
                pattern: pattern.to_owned(),
                source,
            })?;
            regexes.insert(pattern.to_owned(), regex);
        }

        Ok(Self {
            text: text.to_owned(),
            ast,
            regexes,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn eval(&self, env: &dyn SymbolTable) -> bool {
        eval::eval(&self.ast, &self.regexes, env)
    }
}

impl FromStr for SpecExpr {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for SpecExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpecExpr").field(&self.text).finish()
    }
}

impl fmt::Display for SpecExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
