//! # JSON File Helpers
//!
//! Every JSON artifact in the repository (bloblists, session properties,
//! recipes) is written with 4-space indentation and UTF-8 encoding. That
//! formatting is part of the on-disk contract: `session.md5` seals the bytes
//! of the metadata files, so rewriting them with different whitespace would
//! break existing checksums.
//!
//! `write_json` refuses to overwrite. Metadata files are written exactly once
//! and are immutable afterwards.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Serializes `value` as 4-space-indented JSON to a new file at `path`.
/// Fails if the file already exists.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::options().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut writer, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| anyhow::anyhow!("failed to serialize {}: {e}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Serializes `value` as a 4-space-indented JSON string.
pub fn to_json_string<T: Serialize>(value: &T) -> Result<String> {
    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| anyhow::anyhow!("failed to serialize value: {e}"))?;
    String::from_utf8(out).map_err(|e| anyhow::anyhow!("serializer produced invalid utf-8: {e}").into())
}

/// Reads and deserializes a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.json");
        let value = json!({"name": "main", "count": 3});
        write_json(&path, &value).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.json");
        write_json(&path, &json!({"key": "value"})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"key\""));
    }

    #[test]
    fn refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.json");
        write_json(&path, &json!(1)).unwrap();
        assert!(write_json(&path, &json!(2)).is_err());
    }

    #[test]
    fn non_ascii_preserved_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.json");
        write_json(&path, &json!({"påfågel öga.txt": "x"})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("påfågel öga.txt"));
    }
}
