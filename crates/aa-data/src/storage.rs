use std::path::{Path, PathBuf};

use aa_types::{AaError, AaResult, Checkpoint, CheckpointStore, StoredCheckpoint};
use tracing::debug;

/// JSON checkpoint files, written atomically via a sibling temp file.
#[derive(Debug, Clone, Default)]
pub struct FileCheckpointStore;

impl FileCheckpointStore {
    pub fn new() -> Self {
        Self
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, path: &Path) -> AaResult<Option<Checkpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let transient = |message: String| AaError::TransientIo {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| transient(e.to_string()))?;
        let stored: StoredCheckpoint =
            serde_json::from_str(&text).map_err(|e| transient(e.to_string()))?;
        Ok(Some(stored.into()))
    }

    fn save(&self, path: &Path, checkpoint: &Checkpoint) -> AaResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = Self::temp_path(path);
        std::fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), epoch = ?checkpoint.epoch, "checkpoint saved");
        Ok(())
    }
}

/// Deterministic checkpoint paths under the models directory.
///
/// Base models (pre-training folds) live directly in `<root>`; final
/// comparison runs live in `<root>/<exp_name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLayout {
    pub root: PathBuf,
    pub exp_name: String,
}

impl CheckpointLayout {
    pub fn new(root: impl Into<PathBuf>, exp_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            exp_name: exp_name.into(),
        }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.root.join(&self.exp_name)
    }

    /// `<dir>/<dataset>_<model>_<tag>.model`, creating `<dir>` on demand.
    pub fn path(&self, dataset: &str, model: &str, tag: &str, base_model: bool) -> AaResult<PathBuf> {
        let dir = if base_model {
            self.root.clone()
        } else {
            self.experiment_dir()
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{dataset}_{model}_{tag}.model")))
    }

    pub fn fold_tag(cv_ratio: f64, fold: usize) -> String {
        format!("ratio{cv_ratio:.1}_fold{fold}")
    }

    pub fn default_tag(cv_ratio: f64, replicate: usize) -> String {
        format!("ratio{cv_ratio:.1}_default{replicate}")
    }

    pub fn augment_tag(cv_ratio: f64, replicate: usize) -> String {
        format!("ratio{cv_ratio:.1}_augment{replicate}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_types::ModelState;
    use tempfile::tempdir;

    fn state() -> ModelState {
        let mut state = ModelState::new();
        state.insert("w".into(), vec![0.25; 4]);
        state
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new();
        let path = temp_dir.path().join("nested").join("a.model");

        let ckpt = Checkpoint::at_epoch(4, state()).with_metric("top1_valid", 0.75);
        store.save(&path, &ckpt).unwrap();

        let loaded = store.load(&path).unwrap().unwrap();
        assert_eq!(loaded, ckpt);
        assert!(!FileCheckpointStore::temp_path(&path).exists());
    }

    #[test]
    fn test_missing_file_is_not_ready() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new();
        assert!(store.load(&temp_dir.path().join("none.model")).unwrap().is_none());
    }

    #[test]
    fn test_partial_file_is_transient() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("half.model");
        std::fs::write(&path, r#"{"epoch": 3, "model": {"w": [0.1, "#).unwrap();

        let err = FileCheckpointStore::new().load(&path).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_layout_paths() {
        let temp_dir = tempdir().unwrap();
        let layout = CheckpointLayout::new(temp_dir.path(), "exp1");

        let base = layout
            .path("cifar10", "wresnet40_2", &CheckpointLayout::fold_tag(0.4, 2), true)
            .unwrap();
        assert_eq!(base, temp_dir.path().join("cifar10_wresnet40_2_ratio0.4_fold2.model"));

        let final_run = layout
            .path("cifar10", "wresnet40_2", &CheckpointLayout::augment_tag(0.4, 0), false)
            .unwrap();
        assert_eq!(
            final_run,
            temp_dir.path().join("exp1").join("cifar10_wresnet40_2_ratio0.4_augment0.model")
        );
        assert!(temp_dir.path().join("exp1").is_dir());
        assert_eq!(CheckpointLayout::default_tag(0.0, 3), "ratio0.0_default3");
    }
}
