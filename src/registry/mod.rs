//! Model registry: versioned champion history, the current pointer and the
//! promotion stage that is its only writer.

pub mod domain;
pub mod repo_sqlite;
pub mod service;

pub use domain::{
    ChampionDraft, ChampionRecord, ModelRegistry, Precondition, RegistryRead, RunAudit, RunOutcome,
    VersionId,
};
pub use repo_sqlite::SqliteRegistry;
pub use service::PromotionOutcome;
