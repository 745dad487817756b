//! Declarative output description and resolver, per `spec.md` §4.6.
//! Pattern expansion, glob expansion, destination construction, and the
//! copy itself all live here; the dispatcher calls [`resolve_and_copy`]
//! once per returned shard.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::sample::Sample;

/// A declared output: a source pattern resolved against a runner's
/// workdir, plus optional rename/redirect and checkpoint binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub source: String,
    #[serde(default)]
    pub dest_name: Option<String>,
    #[serde(default)]
    pub dest_dir: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// `true` if this output was declared at sample scope (substituted
    /// once per sample) rather than collection scope (expanded for every
    /// sample), per `spec.md` §4.6 step 1.
    #[serde(default)]
    pub per_sample: bool,
}

impl Output {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), dest_name: None, dest_dir: None, checkpoint: None, per_sample: false }
    }

    pub fn dest_name(mut self, name: impl Into<String>) -> Self {
        self.dest_name = Some(name.into());
        self
    }

    pub fn dest_dir(mut self, dir: impl Into<String>) -> Self {
        self.dest_dir = Some(dir.into());
        self
    }

    pub fn checkpoint(mut self, label: impl Into<String>) -> Self {
        self.checkpoint = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSet {
    pub outputs: Vec<Output>,
}

impl OutputSet {
    pub fn push(&mut self, output: Output) {
        self.outputs.push(output);
    }

    /// Outputs whose `checkpoint` attribute equals `label`, per
    /// `spec.md` §4.4.
    pub fn for_checkpoint<'a>(&'a self, label: &str) -> Vec<&'a Output> {
        self.outputs.iter().filter(|o| o.checkpoint.as_deref() == Some(label)).collect()
    }
}

fn has_glob_metachars(s: &str) -> bool {
    s.chars().any(|c| matches!(c, '*' | '?' | '['))
}

fn expand_placeholders(source: &str, sample: &Sample) -> String {
    let mut out = source.replace("{sample.id}", &sample.id);
    for (k, v) in &sample.attrs {
        let placeholder = format!("{{sample.{k}}}");
        if out.contains(&placeholder) {
            let rendered = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
            out = out.replace(&placeholder, &rendered);
        }
    }
    out
}

/// Resolves a set of declared outputs against `workdir` and copies them
/// into `resultdir`. Returns the count of successful copies, which the
/// dispatcher logs as `"Copying N outputs"`.
pub fn resolve_and_copy(outputs: &[Output], workdir: &Path, resultdir: &Path, samples: &[Sample]) -> crate::Result<usize> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut copied = 0usize;

    for output in outputs {
        let patterns: Vec<String> = if output.per_sample {
            samples.iter().map(|s| expand_placeholders(&output.source, s)).collect()
        } else if samples.is_empty() {
            vec![output.source.clone()]
        } else {
            samples.iter().map(|s| expand_placeholders(&output.source, s)).collect()
        };

        for pattern in patterns {
            let matches = expand_matches(&pattern, workdir)?;
            if matches.is_empty() {
                warn!("No files matched pattern '{pattern}'");
                continue;
            }
            let dest_name = if matches.len() > 1 && output.dest_name.is_some() {
                warn!("Destination name will be ignored as '{pattern}' matched multiple files");
                None
            } else {
                output.dest_name.clone()
            };

            for src in matches {
                match copy_one(&src, workdir, resultdir, dest_name.as_deref(), output.dest_dir.as_deref(), &mut seen) {
                    Ok(()) => copied += 1,
                    Err(CopySkip::NotFound(path)) => warn!("{} does not exist", path.display()),
                    Err(CopySkip::NotRelative(path)) => warn!("{} is not relative to {}", path.display(), resultdir.display()),
                    Err(CopySkip::AlreadyExists(path)) => warn!("{} already exists", path.display()),
                    Err(CopySkip::Io(e)) => warn!("{e}"),
                }
            }
        }
    }

    info!("Copying {copied} outputs");
    Ok(copied)
}

pub(crate) fn expand_matches(pattern: &str, workdir: &Path) -> crate::Result<Vec<PathBuf>> {
    let full = workdir.join(pattern);
    if !has_glob_metachars(pattern) {
        return Ok(if full.exists() { vec![full] } else { vec![] });
    }
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(pattern)?);
    let set = builder.build()?;
    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(workdir).into_iter().filter_map(|e| e.ok()) {
        let rel = entry.path().strip_prefix(workdir).unwrap_or(entry.path());
        if set.is_match(rel) {
            matches.push(entry.path().to_path_buf());
        }
    }
    matches.sort();
    Ok(matches)
}

enum CopySkip {
    NotFound(PathBuf),
    NotRelative(PathBuf),
    AlreadyExists(PathBuf),
    Io(std::io::Error),
}

fn copy_one(
    src: &Path,
    workdir: &Path,
    resultdir: &Path,
    dest_name: Option<&str>,
    dest_dir: Option<&str>,
    seen: &mut HashSet<PathBuf>,
) -> std::result::Result<(), CopySkip> {
    if !src.exists() {
        return Err(CopySkip::NotFound(src.to_path_buf()));
    }

    let rel = src.strip_prefix(workdir).unwrap_or(src);
    let dest = if let Some(name) = dest_name {
        resultdir.join(name)
    } else if let Some(dir) = dest_dir {
        let basename = rel.file_name().map(PathBuf::from).unwrap_or_default();
        resultdir.join(dir).join(basename)
    } else {
        resultdir.join(rel)
    };

    let dest = normalize(&dest);
    if !dest.starts_with(resultdir) {
        return Err(CopySkip::NotRelative(dest));
    }
    if dest.exists() || seen.contains(&dest) {
        return Err(CopySkip::AlreadyExists(dest));
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(CopySkip::Io)?;
    }
    if src.is_dir() {
        copy_dir_recursive(src, &dest).map_err(CopySkip::Io)?;
    } else {
        debug!("Copying {} to {}", src.display(), dest.display());
        std::fs::copy(src, &dest).map_err(CopySkip::Io)?;
    }
    seen.insert(dest);
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

/// Lexically normalizes `..`/`.` components without touching the
/// filesystem, so `starts_with` comparisons below aren't fooled by a
/// non-canonical destination path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copies_single_file_preserving_relative_path() {
        let workdir = tempdir().unwrap();
        let resultdir = tempdir().unwrap();
        std::fs::write(workdir.path().join("single.txt"), b"hi").unwrap();

        let outputs = vec![Output::new("single.txt")];
        let copied = resolve_and_copy(&outputs, workdir.path(), resultdir.path(), &[]).unwrap();
        assert_eq!(copied, 1);
        assert!(resultdir.path().join("single.txt").exists());
    }

    #[test]
    fn missing_glob_match_is_skipped_not_fatal() {
        let workdir = tempdir().unwrap();
        let resultdir = tempdir().unwrap();
        let outputs = vec![Output::new("missing.txt")];
        let copied = resolve_and_copy(&outputs, workdir.path(), resultdir.path(), &[]).unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn second_overwrite_is_rejected() {
        let workdir = tempdir().unwrap();
        let resultdir = tempdir().unwrap();
        std::fs::write(workdir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(workdir.path().join("b.txt"), b"b").unwrap();

        let outputs = vec![
            Output::new("a.txt").dest_name("overwrite.txt"),
            Output::new("b.txt").dest_name("overwrite.txt"),
        ];
        let copied = resolve_and_copy(&outputs, workdir.path(), resultdir.path(), &[]).unwrap();
        assert_eq!(copied, 1);
    }

    #[test]
    fn literal_source_expanded_per_sample_dedups_to_one_copy() {
        // spec.md §4.6 item 1: a source with no placeholder is still
        // "expanded for every sample", so a two-sample collection yields
        // the same pattern twice; the second resolves to the same
        // destination and is rejected as already-existing, not double-copied.
        let workdir = tempdir().unwrap();
        let resultdir = tempdir().unwrap();
        std::fs::write(workdir.path().join("single.txt"), b"hi").unwrap();

        let samples = vec![crate::sample::Sample::new("a", vec![]), crate::sample::Sample::new("b", vec![])];
        let outputs = vec![Output::new("single.txt")];
        let copied = resolve_and_copy(&outputs, workdir.path(), resultdir.path(), &samples).unwrap();
        assert_eq!(copied, 1);
    }

    #[test]
    fn multi_match_dest_name_is_dropped() {
        let workdir = tempdir().unwrap();
        let resultdir = tempdir().unwrap();
        std::fs::create_dir_all(workdir.path().join("glob")).unwrap();
        std::fs::write(workdir.path().join("glob/a.txt"), b"a").unwrap();
        std::fs::write(workdir.path().join("glob/b.txt"), b"b").unwrap();

        let outputs = vec![Output::new("glob/*.txt").dest_name("invalid_rename.txt")];
        let copied = resolve_and_copy(&outputs, workdir.path(), resultdir.path(), &[]).unwrap();
        assert_eq!(copied, 2);
        assert!(resultdir.path().join("glob/a.txt").exists());
        assert!(resultdir.path().join("glob/b.txt").exists());
    }
}
