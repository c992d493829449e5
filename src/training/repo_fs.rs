//! Filesystem repository for model artifacts.
//!
//! Artifacts are content-addressed: the id is derived from the SHA-256 of the
//! serialized model, so writing the same model twice lands on the same file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::common::config::AppCfg;
use crate::common::error::{PipelineError, PipelineResult};
use crate::common::ids::sha256_hex;

use super::domain::{ArtifactRef, ArtifactRepo, StoredModel};

const FILE_NAME: &str = "model.json";

/// Stores each artifact as `<root>/<id>/model.json`.
pub struct FsArtifactRepo {
    root: PathBuf,
}

impl FsArtifactRepo {
    pub fn new(cfg: &AppCfg) -> Self {
        Self::at(cfg.models_root())
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(FILE_NAME)
    }
}

fn io_err(path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::artifact(format!("{}: {err}", path.display()))
}

impl ArtifactRepo for FsArtifactRepo {
    fn put_artifact(&self, model: &StoredModel) -> PipelineResult<ArtifactRef> {
        let bytes = serde_json::to_vec_pretty(model)?;
        let sha256 = sha256_hex(&bytes);
        let artifact = ArtifactRef {
            id: format!("{}-{}", model.algorithm, &sha256[..16]),
            sha256,
        };
        let path = self.artifact_path(&artifact.id);
        if path.exists() && self.get_artifact(&artifact).is_ok() {
            return Ok(artifact);
        }
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        // unique per writer; concurrent puts of one model each rename their own file
        let tmp = dir.join(format!("{FILE_NAME}.tmp-{}-{:016x}", std::process::id(), rand::random::<u64>()));
        let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        tracing::debug!(artifact = %artifact.id, bytes = bytes.len(), "artifact written");
        Ok(artifact)
    }

    fn get_artifact(&self, artifact: &ArtifactRef) -> PipelineResult<StoredModel> {
        let path = self.artifact_path(&artifact.id);
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        let actual = sha256_hex(&bytes);
        if actual != artifact.sha256 {
            return Err(PipelineError::artifact(format!(
                "{}: digest {actual} does not match recorded {}",
                artifact.id, artifact.sha256
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::artifact(format!("{}: {e}", artifact.id)))
    }
}
