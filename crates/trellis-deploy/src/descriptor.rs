//! Descriptor file handling
//!
//! Descriptors are accepted as JSON or YAML, detected by trial. The output
//! format is sticky: an explicit `--output` choice wins, otherwise whatever
//! the input parsed as. All loading goes through `serde_json::Value` so the
//! rule evaluator can inspect raw maps before entities are constructed.
//!
//! Field conventions: byte arrays are lowercase hex strings, IP addresses are
//! dotted quads, paths are accepted relative and written absolute.

use serde_json::{Map, Value};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Descriptor serialization format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorFormat {
    Json,
    Yaml,
}

impl DescriptorFormat {
    pub fn from_str_tag(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            _ => Err(Error::descriptor(format!("bad descriptor type: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    /// Parse `path` in this format.
    pub fn load(&self, path: &Path) -> Result<Value> {
        let contents = std::fs::read_to_string(path)?;
        match self {
            Self::Json => Ok(serde_json::from_str(&contents)?),
            Self::Yaml => {
                let value: serde_yaml::Value = serde_yaml::from_str(&contents)?;
                Ok(serde_json::to_value(value)?)
            }
        }
    }

    /// Write `data` to `path` in this format.
    pub fn dump(&self, path: &Path, data: &Value) -> Result<()> {
        let file = std::fs::File::create(path)?;
        match self {
            Self::Json => serde_json::to_writer_pretty(file, data)?,
            Self::Yaml => serde_yaml::to_writer(file, data)?,
        }
        Ok(())
    }

    /// Detect the format of `path` by trial, JSON first.
    pub fn load_any(path: &Path) -> Result<(Value, Self)> {
        if !path.exists() {
            return Err(Error::descriptor(format!(
                "input file {} does not exist",
                path.display()
            )));
        }

        if let Ok(value) = Self::Json.load(path) {
            return Ok((value, Self::Json));
        }
        if let Ok(value) = Self::Yaml.load(path) {
            return Ok((value, Self::Yaml));
        }
        Err(Error::descriptor(format!(
            "input file {} is not a JSON, nor a YAML",
            path.display()
        )))
    }
}

// --- Raw value accessors used by the entity loaders --- //

pub fn as_map<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::descriptor(format!("{what} must be a mapping")))
}

fn req<'a>(map: &'a Map<String, Value>, key: &str, what: &str) -> Result<&'a Value> {
    map.get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::descriptor(format!("{what}: missing {key}")))
}

pub fn req_str(map: &Map<String, Value>, key: &str, what: &str) -> Result<String> {
    req(map, key, what)?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::descriptor(format!("{what}: {key} must be a string")))
}

pub fn opt_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Endpoint names may be written as strings or as bare indices; a numeric
/// literal is carried through as its decimal spelling.
pub fn opt_endpoint(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub fn req_u16(map: &Map<String, Value>, key: &str, what: &str) -> Result<u16> {
    let v = req(map, key, what)?
        .as_u64()
        .ok_or_else(|| Error::descriptor(format!("{what}: {key} must be an integer")))?;
    u16::try_from(v).map_err(|_| Error::descriptor(format!("{what}: {key} out of range")))
}

pub fn opt_u16(map: &Map<String, Value>, key: &str, what: &str) -> Result<Option<u16>> {
    match map.get(key).filter(|v| !v.is_null()) {
        None => Ok(None),
        Some(_) => req_u16(map, key, what).map(Some),
    }
}

pub fn req_u32(map: &Map<String, Value>, key: &str, what: &str) -> Result<u32> {
    let v = req(map, key, what)?
        .as_u64()
        .ok_or_else(|| Error::descriptor(format!("{what}: {key} must be an integer")))?;
    u32::try_from(v).map_err(|_| Error::descriptor(format!("{what}: {key} out of range")))
}

pub fn opt_u32(map: &Map<String, Value>, key: &str, what: &str) -> Result<Option<u32>> {
    match map.get(key).filter(|v| !v.is_null()) {
        None => Ok(None),
        Some(_) => req_u32(map, key, what).map(Some),
    }
}

pub fn opt_bool(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub fn req_ip(map: &Map<String, Value>, key: &str, what: &str) -> Result<Ipv4Addr> {
    req_str(map, key, what)?
        .parse()
        .map_err(|_| Error::descriptor(format!("{what}: malformed IP address")))
}

pub fn opt_hex(map: &Map<String, Value>, key: &str) -> Result<Option<Vec<u8>>> {
    match map.get(key).and_then(Value::as_str) {
        None => Ok(None),
        Some(s) => Ok(Some(hex::decode(s)?)),
    }
}

/// Hex key of an exact size (e.g. a vendor key or module key).
pub fn opt_hex_sized(
    map: &Map<String, Value>,
    key: &str,
    size: usize,
    what: &str,
) -> Result<Option<Vec<u8>>> {
    match opt_hex(map, key)? {
        None => Ok(None),
        Some(bytes) if bytes.len() == size => Ok(Some(bytes)),
        Some(bytes) => Err(Error::descriptor(format!(
            "{what}: {key} must be {size} bytes, got {}",
            bytes.len()
        ))),
    }
}

pub fn str_list(map: &Map<String, Value>, key: &str, what: &str) -> Result<Vec<String>> {
    match map.get(key).filter(|v| !v.is_null()) {
        None => Ok(Vec::new()),
        Some(v) => v
            .as_array()
            .ok_or_else(|| Error::descriptor(format!("{what}: {key} must be a list")))?
            .iter()
            .map(|e| {
                e.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| Error::descriptor(format!("{what}: {key} entries must be strings")))
            })
            .collect(),
    }
}

/// Endpoint-name → index table (TrustZone descriptor tables).
pub fn opt_index_table(
    map: &Map<String, Value>,
    key: &str,
    what: &str,
) -> Result<std::collections::HashMap<String, u16>> {
    match map.get(key).filter(|v| !v.is_null()) {
        None => Ok(Default::default()),
        Some(v) => {
            let table = v
                .as_object()
                .ok_or_else(|| Error::descriptor(format!("{what}: {key} must be a mapping")))?;
            table
                .iter()
                .map(|(name, idx)| {
                    let idx = idx
                        .as_u64()
                        .and_then(|i| u16::try_from(i).ok())
                        .ok_or_else(|| {
                            Error::descriptor(format!("{what}: {key}.{name} must be a u16"))
                        })?;
                    Ok((name.clone(), idx))
                })
                .collect()
        }
    }
}

/// Resolve a path field against the current workspace; absolute on write.
pub fn absolutize(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

pub fn req_path(map: &Map<String, Value>, key: &str, what: &str) -> Result<PathBuf> {
    Ok(absolutize(req_str(map, key, what)?))
}

pub fn opt_path(map: &Map<String, Value>, key: &str) -> Option<PathBuf> {
    opt_str(map, key).map(absolutize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_format_detection() {
        let dir = tempdir().unwrap();

        let json_path = dir.path().join("net.json");
        std::fs::write(&json_path, r#"{"nodes": []}"#).unwrap();
        let (_, format) = DescriptorFormat::load_any(&json_path).unwrap();
        assert_eq!(format, DescriptorFormat::Json);

        let yaml_path = dir.path().join("net.yaml");
        std::fs::write(&yaml_path, "nodes:\n  - name: alpha\n").unwrap();
        let (value, format) = DescriptorFormat::load_any(&yaml_path).unwrap();
        assert_eq!(format, DescriptorFormat::Yaml);
        assert_eq!(value["nodes"][0]["name"], "alpha");
    }

    #[test]
    fn test_missing_file() {
        assert!(DescriptorFormat::load_any(Path::new("/nonexistent/net.json")).is_err());
    }

    #[test]
    fn test_roundtrip_both_formats() {
        let dir = tempdir().unwrap();
        let data = json!({
            "nodes": [{"type": "native", "name": "n", "ip_address": "127.0.0.1"}],
            "connections_current_id": 3,
        });

        for (format, name) in [(DescriptorFormat::Json, "a.json"), (DescriptorFormat::Yaml, "a.yaml")] {
            let path = dir.path().join(name);
            format.dump(&path, &data).unwrap();
            let (loaded, detected) = DescriptorFormat::load_any(&path).unwrap();
            assert_eq!(loaded, data);
            assert_eq!(detected, format);
        }
    }

    #[test]
    fn test_hex_fields() {
        let map = as_map(&json!({"key": "00112233", "bad": "zz"}), "test")
            .unwrap()
            .clone();
        assert_eq!(opt_hex(&map, "key").unwrap().unwrap(), vec![0x00, 0x11, 0x22, 0x33]);
        assert!(opt_hex(&map, "missing").unwrap().is_none());
        assert!(opt_hex(&map, "bad").is_err());
        assert!(opt_hex_sized(&map, "key", 16, "test").is_err());
    }

    #[test]
    fn test_null_counts_as_absent() {
        let map = as_map(&json!({"priority": null}), "test").unwrap().clone();
        assert_eq!(opt_u32(&map, "priority", "test").unwrap(), None);
    }
}
