// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Lua predicate evaluation
//!
//! Each call runs in a fresh Lua state with only the `table`, `string` and
//! `math` libraries loaded (plus the base library without `dofile`,
//! `loadfile`, `load` and `print`), so scripts get no filesystem, process or
//! network access and cannot leak state between candidates. Only source text
//! is accepted: `string.dump` is removed and binary chunks are rejected.
//! `math.random` is removed as well, so a verdict depends on the object alone.
//!
//! Selector scripts define `evaluate(obj)` and return
//! `{ matching = <bool>, message = <string?> }`. The candidate is also
//! available as the global `obj`.
//!
//! Aggregated selection scripts define `evaluate(resources)`, receive every
//! matched object and return `{ resources = { ... } }` with the objects to keep.

use mlua::{
    ChunkMode, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, Table, Value as LuaValue,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use crate::policy::{Candidate, MatchResult};

/// Name of the function every script must define
const ENTRY_POINT: &str = "evaluate";

/// Default memory cap for one interpreter instance (16 MiB)
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("script does not define an `evaluate` function")]
    MissingEntryPoint,

    #[error("lua script output is not a lua table (got {0})")]
    NotATable(&'static str),

    #[error("`matching` must be a boolean (got {0})")]
    MatchingNotBoolean(&'static str),

    #[error("`message` must be a string (got {0})")]
    MessageNotString(&'static str),

    #[error("`resources` must be an array of objects: {0}")]
    InvalidResources(String),
}

/// Runs selector and aggregated-selection scripts
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    memory_limit: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl Evaluator {
    pub fn new(memory_limit: usize) -> Self {
        Self { memory_limit }
    }

    /// Evaluate one candidate against an optional selector script
    ///
    /// An absent or blank script matches with an empty message.
    pub fn evaluate(
        &self,
        candidate: &Candidate,
        script: Option<&str>,
    ) -> Result<MatchResult, EvaluateError> {
        let Some(script) = script.filter(|s| !s.trim().is_empty()) else {
            return Ok(MatchResult {
                candidate: candidate.clone(),
                matched: true,
                message: String::new(),
            });
        };

        let lua = self.sandbox()?;
        let obj = to_lua(&lua, candidate.object.as_ref())?;
        lua.globals().set("obj", obj.clone())?;

        let result = call_entry_point(&lua, script, obj)?;
        let table = expect_table(result)?;

        let matching = match table.get::<LuaValue>("matching")? {
            LuaValue::Boolean(b) => b,
            other => return Err(EvaluateError::MatchingNotBoolean(other.type_name())),
        };
        let message = match table.get::<LuaValue>("message")? {
            LuaValue::Nil => String::new(),
            LuaValue::String(s) => s.to_str()?.to_string(),
            other => return Err(EvaluateError::MessageNotString(other.type_name())),
        };

        Ok(MatchResult {
            candidate: candidate.clone(),
            matched: matching,
            message,
        })
    }

    /// Filter already matched results through an aggregated selection script
    ///
    /// Results whose identity (kind, namespace, name) is not returned by the
    /// script are dropped. Messages of kept results are preserved.
    pub fn aggregate(
        &self,
        script: &str,
        matches: Vec<MatchResult>,
    ) -> Result<Vec<MatchResult>, EvaluateError> {
        let lua = self.sandbox()?;
        let objects: Vec<&Value> = matches.iter().map(|m| m.candidate.object.as_ref()).collect();
        let resources = to_lua(&lua, &objects)?;

        let result = call_entry_point(&lua, script, resources)?;
        let table = expect_table(result)?;

        let selected: Vec<Value> = match table.get::<LuaValue>("resources")? {
            LuaValue::Nil => Vec::new(),
            value @ LuaValue::Table(_) => lua
                .from_value(value)
                .map_err(|e| EvaluateError::InvalidResources(e.to_string()))?,
            other => {
                return Err(EvaluateError::InvalidResources(format!(
                    "got {}",
                    other.type_name()
                )));
            }
        };

        let mut keep = HashSet::with_capacity(selected.len());
        for object in &selected {
            let key = Candidate::key_of(object).ok_or_else(|| {
                EvaluateError::InvalidResources(
                    "entry without kind or metadata.name".to_string(),
                )
            })?;
            keep.insert(key);
        }

        Ok(matches
            .into_iter()
            .filter(|m| keep.contains(&m.candidate.key()))
            .collect())
    }

    /// Fresh interpreter with a safe subset of the standard library
    fn sandbox(&self) -> Result<Lua, EvaluateError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )?;
        lua.set_memory_limit(self.memory_limit)?;

        // The base library is always loaded; drop its file, stdout and chunk loading access
        {
            let globals = lua.globals();
            for name in ["dofile", "loadfile", "load", "print"] {
                globals.set(name, LuaValue::Nil)?;
            }
            let string: Table = globals.get("string")?;
            string.set("dump", LuaValue::Nil)?;
            let math: Table = globals.get("math")?;
            for name in ["random", "randomseed"] {
                math.set(name, LuaValue::Nil)?;
            }
        }
        Ok(lua)
    }
}

/// Convert JSON-like content to a Lua value, mapping null to nil
fn to_lua<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> Result<LuaValue, EvaluateError> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    Ok(lua.to_value_with(value, options)?)
}

fn call_entry_point(lua: &Lua, script: &str, arg: LuaValue) -> Result<LuaValue, EvaluateError> {
    lua.load(script)
        .set_name("evaluate")
        .set_mode(ChunkMode::Text)
        .exec()?;

    let entry = match lua.globals().get::<LuaValue>(ENTRY_POINT)? {
        LuaValue::Function(f) => f,
        _ => return Err(EvaluateError::MissingEntryPoint),
    };
    Ok(entry.call::<LuaValue>(arg)?)
}

fn expect_table(value: LuaValue) -> Result<Table, EvaluateError> {
    match value {
        LuaValue::Table(t) => Ok(t),
        other => Err(EvaluateError::NotATable(other.type_name())),
    }
}
