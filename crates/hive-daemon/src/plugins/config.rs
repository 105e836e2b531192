//! Per-instance variable store.
//!
//! Instances report their variables as `VARIABLE_SET <key> <type> <value>`.
//! The plugin keeps the latest typed value of each key in the `config`
//! export and raises `CONFIG_CHANGED <key> <value>` on the same instance
//! whenever a value actually changes. Other plugins write a variable back
//! through the `set` method export.

use std::cell::RefCell;

use anyhow::Context;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::export::Export;
use crate::handler::{Callback, EventArgs};
use crate::instance::Instance;
use crate::plugin::PluginSpec;

pub const NAME: &str = "config";

/// Event raised after a variable changed.
pub const CONFIG_CHANGED: &str = "CONFIG_CHANGED";

/// Shape of the `config` export.
pub type Settings = RefCell<Map<String, Value>>;

pub fn spec() -> PluginSpec {
    let on_variable_set = Callback::new("variable_set", variable_set);
    PluginSpec::new(NAME).init(move |ctx| {
        ctx.export_dict([
            ("config", Export::object(Settings::default())),
            ("set", Export::method(set)),
        ])?;
        ctx.connect("VARIABLE_SET", &on_variable_set, EventArgs::new())?;
        Ok(())
    })
}

/// Typed value as reported on the wire. Unknown types and unparsable
/// numbers are kept as strings.
fn typed_value(kind: &str, raw: &str) -> Value {
    match kind {
        "int" => raw.parse::<i64>().map_or_else(|_| Value::from(raw), Value::from),
        "float" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or_else(|| Value::from(raw), Value::Number),
        _ => Value::from(raw),
    }
}

fn variable_set(inst: &mut Instance, args: &EventArgs) -> anyhow::Result<()> {
    let payload = args.payload().context("VARIABLE_SET without arguments")?;
    let mut fields = payload.splitn(3, ' ');
    let key = fields.next().unwrap_or_default();
    let kind = fields.next().unwrap_or("str");
    let raw = fields.next().unwrap_or_default();
    if key.is_empty() {
        anyhow::bail!("VARIABLE_SET without a key");
    }

    let settings = inst
        .export_object::<Settings>("config")
        .context("config store not exported")?;
    let value = typed_value(kind, raw);
    let previous = settings.borrow_mut().insert(key.to_string(), value.clone());

    if previous.as_ref() == Some(&value) {
        return Ok(());
    }

    debug!("{} = {}", key, value);
    inst.dispatch(
        CONFIG_CHANGED,
        &EventArgs::from_payload(Some(&format!("{key} {raw}"))),
    )?;
    Ok(())
}

/// `set(key, value)`: ask the instance to change a variable.
fn set(inst: &mut Instance, args: &[Value]) -> anyhow::Result<Value> {
    let key = args
        .first()
        .and_then(Value::as_str)
        .context("set: missing key")?;
    let value = match args.get(1) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    inst.enqueue(&format!("set {key} = {value}"));
    Ok(Value::Null)
}
