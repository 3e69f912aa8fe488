//! Routing predicates for the conditional edges of the workflow graph.
//!
//! All predicates are pure functions of the request state except
//! [`RetryPolicy::route`], which also records regeneration attempts and
//! clears the outstanding reflection when it sends the run on to execution.

use crate::config::MAX_REGENERATE_ATTEMPTS;
use crate::graph::{StageId, Target};
use crate::state::{RegenerateAttempt, RequestState};
use tracing::{debug, warn};

/// `generate` for relevant queries, straight to `summarize` otherwise.
pub fn route_after_analyze(state: &RequestState) -> Target {
    if state.is_query_relevant {
        StageId::Generate.into()
    } else {
        StageId::Summarize.into()
    }
}

/// `check_visualization` for relevant results, `correct` otherwise.
pub fn route_after_evaluate(state: &RequestState) -> Target {
    if state.is_result_relevant {
        StageId::CheckVisualization.into()
    } else {
        StageId::Correct.into()
    }
}

/// `visualize` only when a chart was requested and there are rows to draw.
pub fn route_after_check_visualization(state: &RequestState) -> Target {
    let wants_chart = state
        .evaluation_result
        .as_ref()
        .is_some_and(|e| e.requires_visualization);
    if wants_chart && state.execution_succeeded() {
        StageId::Visualize.into()
    } else {
        StageId::Summarize.into()
    }
}

/// What the validation router decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationDecision {
    /// Invalid SQL with attempts left: loop back to generation.
    Regenerate,
    /// SQL passed validation.
    Execute,
    /// Attempts used up: execute the latest SQL as-is.
    Exhausted,
}

/// Bounds the `generate`/`validate` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_REGENERATE_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Values above [`MAX_REGENERATE_ATTEMPTS`] are clamped.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.min(MAX_REGENERATE_ATTEMPTS),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide without touching the state. A missing validation result
    /// counts as invalid.
    pub fn decide(&self, state: &RequestState) -> ValidationDecision {
        let valid = state
            .validation_result
            .as_ref()
            .is_some_and(|v| v.is_valid);
        let attempts = state.regenerate_attempts.len() as u32;

        if !valid && attempts < self.max_attempts {
            ValidationDecision::Regenerate
        } else if !valid {
            ValidationDecision::Exhausted
        } else {
            ValidationDecision::Execute
        }
    }

    /// Decide and apply the bookkeeping for the decision.
    pub fn route(&self, state: &mut RequestState) -> Target {
        match self.decide(state) {
            ValidationDecision::Regenerate => {
                let attempt = state.regenerate_attempts.len() as u32 + 1;
                let issues = state
                    .validation_result
                    .as_ref()
                    .map(|v| v.issues.clone())
                    .unwrap_or_default();
                debug!(attempt, max = self.max_attempts, "regenerating SQL");
                state
                    .regenerate_attempts
                    .push(RegenerateAttempt { attempt, issues });
                StageId::Generate.into()
            }
            ValidationDecision::Exhausted => {
                warn!(
                    attempts = state.regenerate_attempts.len(),
                    "regeneration budget used up, executing last SQL"
                );
                state.reflection = None;
                StageId::Execute.into()
            }
            ValidationDecision::Execute => {
                state.reflection = None;
                StageId::Execute.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        EvaluationResult, ExecutionResult, Reflection, ReflectionKind, ValidationResult,
    };

    fn state() -> RequestState {
        RequestState::new("How many orders?", "s", "r").unwrap()
    }

    fn invalid(issue: &str) -> Option<ValidationResult> {
        Some(ValidationResult {
            is_valid: false,
            issues: vec![issue.to_string()],
            suggested_fix: String::new(),
        })
    }

    #[test]
    fn test_analyze_routes_on_relevance() {
        let mut s = state();
        assert_eq!(route_after_analyze(&s), Target::Stage(StageId::Summarize));
        s.is_query_relevant = true;
        assert_eq!(route_after_analyze(&s), Target::Stage(StageId::Generate));
    }

    #[test]
    fn test_evaluate_routes_on_relevance() {
        let mut s = state();
        assert_eq!(route_after_evaluate(&s), Target::Stage(StageId::Correct));
        s.is_result_relevant = true;
        assert_eq!(route_after_evaluate(&s), Target::Stage(StageId::CheckVisualization));
    }

    #[test]
    fn test_missing_validation_regenerates() {
        let mut s = state();
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(&s), ValidationDecision::Regenerate);
        assert_eq!(policy.route(&mut s), Target::Stage(StageId::Generate));
        assert_eq!(s.regenerate_attempts.len(), 1);
        assert_eq!(s.regenerate_attempts[0].attempt, 1);
    }

    #[test]
    fn test_attempts_never_exceed_cap() {
        let mut s = state();
        s.validation_result = invalid("syntax error");
        s.reflection = Some(Reflection::new(ReflectionKind::SqlValidation, "syntax error", "fix it"));
        let policy = RetryPolicy::default();

        let mut targets = Vec::new();
        for _ in 0..6 {
            targets.push(policy.route(&mut s));
            assert!(s.regenerate_attempts.len() <= 3);
        }
        assert_eq!(&targets[..3], &[Target::Stage(StageId::Generate); 3]);
        assert!(targets[3..].iter().all(|t| *t == Target::Stage(StageId::Execute)));
        assert_eq!(s.regenerate_attempts.len(), 3);
        assert!(s.reflection.is_none());
        assert_eq!(s.regenerate_attempts[2].issues, vec!["syntax error"]);
    }

    #[test]
    fn test_valid_sql_clears_reflection_without_counting() {
        let mut s = state();
        s.regenerate_attempts.push(RegenerateAttempt {
            attempt: 1,
            issues: vec![],
        });
        s.validation_result = Some(ValidationResult {
            is_valid: true,
            issues: vec![],
            suggested_fix: String::new(),
        });
        s.reflection = Some(Reflection::new(ReflectionKind::SqlValidation, "old", "old"));
        assert_eq!(RetryPolicy::default().route(&mut s), Target::Stage(StageId::Execute));
        assert_eq!(s.regenerate_attempts.len(), 1);
        assert!(s.reflection.is_none());
    }

    #[test]
    fn test_policy_clamped() {
        assert_eq!(RetryPolicy::new(9).max_attempts(), 3);
        let mut s = state();
        s.validation_result = invalid("x");
        assert_eq!(RetryPolicy::new(0).route(&mut s), Target::Stage(StageId::Execute));
        assert!(s.regenerate_attempts.is_empty());
    }

    #[test]
    fn test_check_visualization_needs_rows_and_request() {
        let mut s = state();
        s.evaluation_result = Some(EvaluationResult {
            is_relevant: true,
            explanation: String::new(),
            requires_visualization: false,
            summary: String::new(),
        });
        s.execution_result = Some(ExecutionResult::succeeded(vec!["n".into()], vec![]));
        for _ in 0..3 {
            assert_eq!(route_after_check_visualization(&s), Target::Stage(StageId::Summarize));
        }

        if let Some(e) = s.evaluation_result.as_mut() {
            e.requires_visualization = true;
        }
        assert_eq!(route_after_check_visualization(&s), Target::Stage(StageId::Visualize));

        s.execution_result = Some(ExecutionResult::failed("boom"));
        assert_eq!(route_after_check_visualization(&s), Target::Stage(StageId::Summarize));
    }
}
