//! Training stage: candidate algorithms, run snapshots and model artifacts.

pub mod domain;
pub mod ensemble;
pub mod linear;
pub mod repo_fs;
pub mod service;
pub mod tree;

pub use domain::{
    Algorithm, AlgorithmId, ArtifactRef, ArtifactRepo, Candidate, CandidateOutcome, FittedModel,
    StoredModel, TrainConfig, TrainingSnapshot, TrainingWindow,
};
pub use repo_fs::FsArtifactRepo;
