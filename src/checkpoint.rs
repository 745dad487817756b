//! Content-addressed fingerprint store, per `spec.md` §4.4. A checkpoint
//! is scoped to one runner invocation's workdir; its live fingerprint is a
//! commutative combine over per-file hashes of its declared outputs, so
//! file order never affects the result.

use std::path::PathBuf;

use crate::output::{Output, expand_matches};
use crate::{Error, Result};

const CHECKPOINTS_DIR: &str = ".checkpoints";

pub struct Checkpoint {
    label: String,
    workdir: PathBuf,
    outputs: Vec<Output>,
}

impl Checkpoint {
    pub(crate) fn new(label: impl Into<String>, workdir: PathBuf, outputs: Vec<Output>) -> Self {
        Self { label: label.into(), workdir, outputs }
    }

    fn stored_path(&self) -> PathBuf {
        self.workdir.join(CHECKPOINTS_DIR).join(&self.label)
    }

    /// The live fingerprint: XOR-combine of `blake3(relpath || content)`
    /// over every file matched by this checkpoint's outputs. XOR makes the
    /// combine commutative and associative, so multiset order never
    /// matters; directory outputs are walked recursively by
    /// `collect_files`.
    pub fn live_fingerprint(&self) -> Result<[u8; 32]> {
        let mut acc = [0u8; 32];
        for file in self.collect_files()? {
            let rel = file.strip_prefix(&self.workdir).unwrap_or(&file);
            let mut hasher = blake3::Hasher::new();
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            let bytes = std::fs::read(&file)?;
            hasher.update(&bytes);
            let digest = hasher.finalize();
            for (a, b) in acc.iter_mut().zip(digest.as_bytes()) {
                *a ^= b;
            }
        }
        Ok(acc)
    }

    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for output in &self.outputs {
            for m in expand_matches(&output.source, &self.workdir)? {
                if m.is_dir() {
                    for entry in walkdir::WalkDir::new(&m).into_iter().filter_map(|e| e.ok()) {
                        if entry.file_type().is_file() {
                            files.push(entry.path().to_path_buf());
                        }
                    }
                } else {
                    files.push(m);
                }
            }
        }
        Ok(files)
    }

    fn stored_fingerprint(&self) -> Result<Option<[u8; 32]>> {
        let path = self.stored_path();
        if !path.exists() {
            return Ok(None);
        }
        let hex = std::fs::read_to_string(&path)?;
        let bytes = hex::decode(hex.trim()).map_err(|e| Error::ConfigType { path: path.display().to_string(), cause: e.to_string() })?;
        let mut out = [0u8; 32];
        if bytes.len() == 32 {
            out.copy_from_slice(&bytes);
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    /// `stored == live` and the stored fingerprint exists.
    pub fn check(&self) -> Result<bool> {
        let live = self.live_fingerprint()?;
        Ok(self.stored_fingerprint()?.is_some_and(|stored| stored == live))
    }

    /// Snapshots the current live fingerprint to disk. A no-op state
    /// change if the fingerprint hasn't moved: writing the same bytes
    /// keeps `check()` true either way.
    pub fn store(&self) -> Result<()> {
        let live = self.live_fingerprint()?;
        let path = self.stored_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(live))?;
        Ok(())
    }

    pub fn hexdigest(&self) -> Result<String> {
        Ok(hex::encode(self.live_fingerprint()?))
    }
}

/// Roots checkpoints for one runner invocation's workdir.
pub struct CheckpointStore {
    workdir: PathBuf,
}

impl CheckpointStore {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }

    pub fn checkpoint(&self, label: &str, all_outputs: &crate::output::OutputSet) -> Checkpoint {
        let outputs = all_outputs.for_checkpoint(label).into_iter().cloned().collect();
        Checkpoint::new(label, self.workdir.clone(), outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputSet;
    use tempfile::tempdir;

    #[test]
    fn store_then_check_is_true_until_mutated() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("out_a.txt"), b"v1").unwrap();

        let mut outputs = OutputSet::default();
        outputs.push(Output::new("out_a.txt").checkpoint("a"));

        let store = CheckpointStore::new(dir.path());
        let cp = store.checkpoint("a", &outputs);

        assert!(!cp.check().unwrap());
        let before = cp.hexdigest().unwrap();
        cp.store().unwrap();
        assert!(cp.check().unwrap());

        std::fs::write(dir.path().join("out_a.txt"), b"v2").unwrap();
        let after = cp.hexdigest().unwrap();
        assert_ne!(before, after);
        assert!(!cp.check().unwrap());

        cp.store().unwrap();
        let repeat_store = cp.hexdigest().unwrap();
        cp.store().unwrap();
        assert_eq!(repeat_store, cp.hexdigest().unwrap());
        assert!(cp.check().unwrap());
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let dir1 = tempdir().unwrap();
        std::fs::write(dir1.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir1.path().join("b.txt"), b"b").unwrap();
        let mut outputs1 = OutputSet::default();
        outputs1.push(Output::new("a.txt").checkpoint("x"));
        outputs1.push(Output::new("b.txt").checkpoint("x"));
        let store1 = CheckpointStore::new(dir1.path());
        let cp1 = store1.checkpoint("x", &outputs1);

        let dir2 = tempdir().unwrap();
        std::fs::write(dir2.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir2.path().join("a.txt"), b"a").unwrap();
        let mut outputs2 = OutputSet::default();
        outputs2.push(Output::new("b.txt").checkpoint("x"));
        outputs2.push(Output::new("a.txt").checkpoint("x"));
        let store2 = CheckpointStore::new(dir2.path());
        let cp2 = store2.checkpoint("x", &outputs2);

        assert_eq!(cp1.hexdigest().unwrap(), cp2.hexdigest().unwrap());
    }
}
