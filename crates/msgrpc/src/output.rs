use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use msgrpc_frame::{ExtensionRegistry, Value};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    method: &'a str,
    result: serde_json::Value,
    elapsed_ms: u64,
}

pub fn print_result(
    method: &str,
    result: &Value,
    elapsed: Duration,
    registry: &ExtensionRegistry,
    format: OutputFormat,
) {
    let json = value_to_json(result, registry);
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                method,
                result: json,
                elapsed_ms: elapsed.as_millis() as u64,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "RESULT", "ELAPSED"]);
            match &json {
                serde_json::Value::Array(items) if !items.is_empty() => {
                    for item in items {
                        table.add_row(vec![method.to_string(), compact(item), String::new()]);
                    }
                }
                other => {
                    table.add_row(vec![method.to_string(), compact(other), String::new()]);
                }
            }
            table.add_row(vec![
                String::new(),
                String::new(),
                format!("{}ms", elapsed.as_millis()),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{method} = {}",
                serde_json::to_string_pretty(&json).unwrap_or_else(|_| "null".to_string())
            );
        }
        OutputFormat::Raw => match result {
            Value::String(text) => print_raw(text.as_bytes()),
            Value::Binary(data) => print_raw(data),
            _ => println!("{}", compact(&json)),
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn compact(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Render a MessagePack value as JSON.
///
/// Extension values known to `registry` become `{"type": name, "value": ...}`;
/// unknown ones keep their code and payload bytes.
pub fn value_to_json(value: &Value, registry: &ExtensionRegistry) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Json::from(i),
            (None, Some(u)) => Json::from(u),
            (None, None) => Json::Null,
        },
        Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(s) => Json::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        Value::Binary(data) => Json::String(String::from_utf8_lossy(data).into_owned()),
        Value::Array(items) => {
            Json::Array(items.iter().map(|v| value_to_json(v, registry)).collect())
        }
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k, registry), value_to_json(v, registry)))
                .collect(),
        ),
        Value::Ext(code, data) => match registry.decode(value) {
            Some(Ok(ext)) => serde_json::json!({
                "type": ext.name(),
                "value": ext.to_string(),
            }),
            _ => serde_json::json!({
                "type": "ext",
                "code": code,
                "data": data,
            }),
        },
    }
}

fn map_key(key: &Value, registry: &ExtensionRegistry) -> String {
    match key {
        Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        other => compact(&value_to_json(other, registry)),
    }
}

/// Parse a JSON command-line argument into a MessagePack value.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    use serde_json::Value as Json;

    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::from(s.as_str()),
        Json::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        Json::Object(fields) => Value::Map(
            fields
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), json_to_value(v)))
                .collect(),
        ),
    }
}
