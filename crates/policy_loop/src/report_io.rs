use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Converts to a JSON value with every float rounded to `precision`
/// decimals. Object keys come out sorted (serde_json's default map).
pub fn stable_value<T: Serialize>(value: &T, precision: u32) -> Result<Value> {
    let raw = serde_json::to_value(value).context("encode stable json")?;
    Ok(round_floats(raw, precision))
}

fn round_floats(value: Value, precision: u32) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => {
            let Some(x) = n.as_f64() else {
                return Value::Number(n);
            };
            let scale = 10f64.powi(precision as i32);
            let mut rounded = (x * scale).round() / scale;
            if rounded == 0.0 {
                // Collapse -0.0 so signs never leak into checksums.
                rounded = 0.0;
            }
            Number::from_f64(rounded).map_or(Value::Null, Value::Number)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| round_floats(v, precision))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, round_floats(v, precision)))
                .collect(),
        ),
        other => other,
    }
}

/// Pretty stable form, for files humans read.
pub fn to_stable_json<T: Serialize>(value: &T, precision: u32) -> Result<String> {
    let v = stable_value(value, precision)?;
    serde_json::to_string_pretty(&v).context("render stable json")
}

/// SHA-256 of the compact stable form.
pub fn checksum<T: Serialize>(value: &T, precision: u32) -> Result<String> {
    let v = stable_value(value, precision)?;
    let compact = serde_json::to_string(&v).context("render stable json")?;
    Ok(sha256_hex(&compact))
}

pub fn write_stable_json<T: Serialize>(path: &Path, value: &T, precision: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    let mut body = to_stable_json(value, precision)?;
    body.push('\n');
    fs::write(path, body).with_context(|| format!("write {}", path.display()))
}

/// Writes `<dir>/<name>.json` and returns the path.
pub fn write_report<T: Serialize>(dir: &Path, name: &str, value: &T, precision: u32) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.json"));
    write_stable_json(&path, value, precision)?;
    tracing::info!(path = %path.display(), "report written");
    Ok(path)
}
