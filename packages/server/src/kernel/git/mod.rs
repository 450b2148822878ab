//! Git workflow infrastructure: the per-job branch/commit/push/PR engine and
//! the suggestion batcher built on top of it.

pub mod suggestions;
pub mod workflow;

pub use suggestions::{
    BatchReport, RefactorSuggestion, SuggestionApplier, SuggestionBatcher,
    DEFAULT_MAX_SUGGESTIONS_PER_PR, MIN_IMPACT_SCORE,
};
pub use workflow::{
    BranchContext, ChangeDescriber, DefaultChangeDescriber, GitWorkflowConfig, GitWorkflowEngine,
    WorkflowOutcome, DRY_RUN_PREFIX,
};
