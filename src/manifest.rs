//! Samples-manifest reader, per `spec.md` §6: "a flat sequence of records
//! `{id, files:[path,…], <user attributes>}`. Read once at startup."
//! Peripheral plumbing — the manifest format itself isn't spec'd beyond
//! this shape, so JSON and YAML are both accepted.

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::sample::{Sample, SampleCollection};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct ManifestRecord {
    id: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(flatten)]
    attrs: IndexMap<String, Value>,
}

/// Reads a JSON or YAML samples manifest into a [`SampleCollection`]. An
/// empty manifest is valid — `spec.md` §8 requires pre/post hooks still
/// run and the dispatcher simply does nothing.
pub fn read(path: &Path) -> Result<SampleCollection> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<ManifestRecord> = match ext {
        "json" => serde_json::from_str(&raw)?,
        "yaml" | "yml" => serde_yaml::from_str(&raw)?,
        other => return Err(Error::ConfigPath(format!("unsupported samples manifest extension: {other}"))),
    };

    let samples = records
        .into_iter()
        .map(|record| {
            let mut sample = Sample::new(record.id, record.files);
            for (k, v) in record.attrs {
                sample.set(k, v);
            }
            sample
        })
        .collect();

    Ok(SampleCollection::new(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_json_manifest_with_user_attributes() {
        let file = NamedTempFile::with_suffix(".json").unwrap();
        std::fs::write(
            file.path(),
            r#"[{"id":"a","files":["a.fq"],"custom_prop":"x"},{"id":"b","files":[]}]"#,
        )
        .unwrap();
        let collection = read(file.path()).unwrap();
        assert_eq!(collection.samples.len(), 2);
        assert_eq!(collection.samples[0].get("custom_prop").unwrap(), "x");
    }

    #[test]
    fn empty_manifest_yields_empty_collection() {
        let file = NamedTempFile::with_suffix(".json").unwrap();
        std::fs::write(file.path(), "[]").unwrap();
        let collection = read(file.path()).unwrap();
        assert!(collection.samples.is_empty());
    }
}
