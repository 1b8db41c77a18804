//! Type conversions between JSON and Lua.
//!
//! Hand-rolled rather than serde-bridged so the event round-trip keeps its
//! shape: an empty Lua table converts to an empty JSON object (state bags
//! start empty and must stay objects), and non-serializable values
//! (functions, userdata) are dropped instead of failing the whole event.

use mlua::{Lua, Table, Value};
use serde_json::Value as JsonValue;

/// Maximum table nesting accepted when reading state back from a script.
const MAX_DEPTH: usize = 32;

pub fn json_to_lua(lua: &Lua, value: &JsonValue) -> mlua::Result<Value> {
    match value {
        JsonValue::Null => Ok(Value::Nil),
        JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(Value::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        JsonValue::String(s) => Ok(Value::String(lua.create_string(s)?)),
        JsonValue::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i as i64 + 1, json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        JsonValue::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

pub fn lua_to_json(value: &Value) -> mlua::Result<JsonValue> {
    lua_to_json_depth(value, 0)
}

fn lua_to_json_depth(value: &Value, depth: usize) -> mlua::Result<JsonValue> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::RuntimeError(format!(
            "table nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    match value {
        Value::Nil => Ok(JsonValue::Null),
        Value::Boolean(b) => Ok(JsonValue::Bool(*b)),
        Value::Integer(i) => Ok(JsonValue::from(*i)),
        Value::Number(n) => Ok(JsonValue::from(*n)),
        Value::String(s) => Ok(JsonValue::String(
            s.to_str()
                .map_or_else(|_| "<invalid utf8>".to_string(), |s| s.to_string()),
        )),
        Value::Table(table) => table_to_json(table, depth),
        // Functions, userdata and threads do not serialize
        _ => Ok(JsonValue::Null),
    }
}

fn table_to_json(table: &Table, depth: usize) -> mlua::Result<JsonValue> {
    let len = table.raw_len();
    if len > 0 && is_sequence(table, len)? {
        let mut array = Vec::with_capacity(len);
        for i in 1..=len {
            array.push(lua_to_json_depth(&table.get::<Value>(i as i64)?, depth + 1)?);
        }
        return Ok(JsonValue::Array(array));
    }

    // Empty tables and mixed tables serialize as objects
    let mut map = serde_json::Map::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, item) = pair?;
        let key = match key {
            Value::String(s) => match s.to_str() {
                Ok(s) => s.to_string(),
                Err(_) => continue,
            },
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            _ => continue,
        };
        if matches!(item, Value::Function(_) | Value::UserData(_) | Value::Thread(_)) {
            continue;
        }
        map.insert(key, lua_to_json_depth(&item, depth + 1)?);
    }
    Ok(JsonValue::Object(map))
}

fn is_sequence(table: &Table, len: usize) -> mlua::Result<bool> {
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, _) = pair?;
        match key {
            Value::Integer(i) if i >= 1 && i as usize <= len => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}
