//! Structured logging: JSON lines via `tracing`.
//!
//! Stage events share one schema: `ev` names the event, `code` is the
//! [`ErrorCode`](super::error::ErrorCode) (0 on success) and `dur_ms` the
//! wall time of the unit of work.

use std::time::Instant;

use tracing_subscriber::EnvFilter;

use super::config::{AppCfg, LogFormat};
use super::error::{ErrorCode, PipelineError};

/// Install the global subscriber. Safe to call more than once.
pub fn init(cfg: &AppCfg) {
    let filter = EnvFilter::try_new(&cfg.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = match cfg.log_format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Pretty => builder.compact().try_init(),
    };
}

/// Times a unit of work and emits one stage event when it completes.
pub struct StageTimer {
    module: &'static str,
    started: Instant,
}

impl StageTimer {
    pub fn start(module: &'static str) -> Self {
        Self {
            module,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Emit a success event.
    pub fn ok(&self, event: &str) {
        tracing::info!(
            module = self.module,
            ev = event,
            code = ErrorCode::Ok as u32,
            dur_ms = self.elapsed_ms() as u64,
        );
    }

    /// Emit a failure event; alert-worthy failures log at error level.
    pub fn fail(&self, event: &str, err: &PipelineError) {
        let code = err.code() as u32;
        let dur_ms = self.elapsed_ms() as u64;
        if err.is_alert_worthy() {
            tracing::error!(module = self.module, ev = event, code, dur_ms, error = %err);
        } else {
            tracing::warn!(module = self.module, ev = event, code, dur_ms, error = %err);
        }
    }
}
