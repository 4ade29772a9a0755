/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::collections::BTreeMap;
use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::spec::parser::CompareOp;
use crate::spec::parser::Const;
use crate::spec::parser::Expr;
use crate::spec::parser::Operand;

/// Where expression symbols get their values.
pub trait SymbolTable {
    fn lookup(&self, symbol: &str) -> Option<&Value>;
}

impl SymbolTable for BTreeMap<String, Value> {
    fn lookup(&self, symbol: &str) -> Option<&Value> {
        self.get(symbol)
    }
}

impl SymbolTable for serde_json::Map<String, Value> {
    fn lookup(&self, symbol: &str) -> Option<&Value> {
        self.get(symbol)
    }
}

/// String form of a scalar; `None` for containers and null.
fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn render_const(c: &Const) -> String {
    match c {
        Const::Str(s) => s.clone(),
        Const::Int(i) => i.to_string(),
    }
}

/// Missing symbols read as the empty string.
fn symbol_str(env: &dyn SymbolTable, symbol: &str) -> Option<String> {
    match env.lookup(symbol) {
        None => Some(String::new()),
        Some(v) => render(v),
    }
}

/// Missing symbols read as zero; `None` when not numeric.
fn symbol_number(env: &dyn SymbolTable, symbol: &str) -> Option<f64> {
    match env.lookup(symbol) {
        None => Some(0.0),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16).ok().map(|i| i as f64),
                None => s.parse().ok(),
            }
        }
        Some(_) => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        // Empty objects mark membership (e.g. `interconnects.nwa: {}`).
        Value::Object(_) => true,
    }
}

fn contains(haystack: &Value, needle: &str) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|i| render(i).as_deref() == Some(needle)),
        Value::Object(map) => map.contains_key(needle),
        Value::String(s) => s.contains(needle),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

pub(crate) fn eval(expr: &Expr, regexes: &HashMap<String, Regex>, env: &dyn SymbolTable) -> bool {
    match expr {
        Expr::Or(l, r) => eval(l, regexes, env) || eval(r, regexes, env),
        Expr::And(l, r) => eval(l, regexes, env) && eval(r, regexes, env),
        Expr::Not(e) => !eval(e, regexes, env),
        Expr::Compare { symbol, op, value } => match op {
            CompareOp::Eq | CompareOp::Ne => {
                let equal =
                    symbol_str(env, symbol).as_deref() == Some(render_const(value).as_str());
                (*op == CompareOp::Eq) == equal
            }
            CompareOp::Lt | CompareOp::Gt | CompareOp::Le | CompareOp::Ge => {
                let rhs = match value {
                    Const::Int(i) => *i as f64,
                    Const::Str(_) => return false,
                };
                let Some(lhs) = symbol_number(env, symbol) else {
                    return false;
                };
                match op {
                    CompareOp::Lt => lhs < rhs,
                    CompareOp::Gt => lhs > rhs,
                    CompareOp::Le => lhs <= rhs,
                    _ => lhs >= rhs,
                }
            }
        },
        Expr::InList { symbol, list } => match env.lookup(symbol).and_then(render) {
            Some(v) => list.iter().any(|c| render_const(c) == v),
            None => false,
        },
        Expr::Contains { needle, haystack } => {
            let needle = match needle {
                Operand::Const(c) => render_const(c),
                Operand::Symbol(s) => match env.lookup(s).and_then(render) {
                    Some(v) => v,
                    None => return false,
                },
            };
            match env.lookup(haystack) {
                Some(h) => contains(h, &needle),
                None => false,
            }
        }
        Expr::Match { symbol, pattern } => {
            match (regexes.get(pattern), symbol_str(env, symbol)) {
                (Some(regex), Some(v)) => regex.is_match(&v),
                _ => false,
            }
        }
        Expr::Exists(symbol) => env.lookup(symbol).is_some_and(truthy),
    }
}
