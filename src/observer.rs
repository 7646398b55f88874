// 📡 Pipeline observer - injected diagnostics
// Every stage reports through a PipelineObserver handed in by the caller.
// LogObserver forwards to the `log` facade; NoopObserver discards everything.

use crate::aggregate::AggregateKey;
use crate::error::{PipelineError, RowCoercionIssue, StoreError, UpsertIssue};
use crate::loader::LoadState;
use crate::parser::CleanStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Transform,
    Load,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

/// Receives progress events from the stages.
///
/// All methods default to doing nothing, so implementors only override what
/// they care about.
pub trait PipelineObserver {
    fn stage_started(&self, _stage: Stage) {}

    fn stage_finished(&self, _stage: Stage, _summary: &str) {}

    fn stage_failed(&self, _stage: Stage, _error: &PipelineError) {}

    fn row_dropped(&self, _line: usize, _issue: RowCoercionIssue) {}

    fn rows_cleaned(&self, _stats: &CleanStats) {}

    fn row_staged(&self, _key: &AggregateKey) {}

    fn row_skipped(&self, _issue: &UpsertIssue) {}

    fn load_state(&self, _state: LoadState) {}

    fn rollback_failed(&self, _error: &StoreError) {}
}

pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Forwards events to the `log` crate under a fixed target.
pub struct LogObserver {
    target: String,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::with_target("bank_aggregates")
    }

    pub fn with_target(target: &str) -> Self {
        LogObserver {
            target: target.to_string(),
        }
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineObserver for LogObserver {
    fn stage_started(&self, stage: Stage) {
        log::info!(target: self.target.as_str(), "starting {} stage", stage.name());
    }

    fn stage_finished(&self, stage: Stage, summary: &str) {
        log::info!(target: self.target.as_str(), "✓ {} stage done: {}", stage.name(), summary);
    }

    fn stage_failed(&self, stage: Stage, error: &PipelineError) {
        log::error!(target: self.target.as_str(), "❌ {} stage failed: {}", stage.name(), error);
    }

    fn row_dropped(&self, line: usize, issue: RowCoercionIssue) {
        log::debug!(target: self.target.as_str(), "dropped line {}: {}", line, issue);
    }

    fn rows_cleaned(&self, stats: &CleanStats) {
        log::info!(
            target: self.target.as_str(),
            "row count after cleaning: {} of {} retained",
            stats.retained,
            stats.seen
        );
    }

    fn row_staged(&self, key: &AggregateKey) {
        log::trace!(target: self.target.as_str(), "staged {}", key);
    }

    fn row_skipped(&self, issue: &UpsertIssue) {
        log::warn!(target: self.target.as_str(), "skipped row {}", issue);
    }

    fn load_state(&self, state: LoadState) {
        log::debug!(target: self.target.as_str(), "loader state -> {:?}", state);
    }

    fn rollback_failed(&self, error: &StoreError) {
        log::warn!(target: self.target.as_str(), "rollback after abandoned load failed: {}", error);
    }
}
