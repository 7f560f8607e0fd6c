use super::Evaluator;
use crate::models::{Action, EvalScore, RunStatus, Scenario, ScenarioResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Compares the decided actions with `expected_actions`, in order.
///
/// Score is the matching prefix length over the expected length; only a
/// complete match of a completed run passes.
#[derive(Debug, Clone)]
pub struct ExactPathEvaluator {
    check_parameters: bool,
}

impl Default for ExactPathEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExactPathEvaluator {
    pub fn new() -> Self {
        Self {
            check_parameters: true,
        }
    }

    /// When false, only action names are compared
    pub fn with_check_parameters(mut self, check_parameters: bool) -> Self {
        self.check_parameters = check_parameters;
        self
    }

    fn matches(&self, expected: &Action, actual: &Action) -> bool {
        if self.check_parameters {
            expected == actual
        } else {
            expected.name == actual.name
        }
    }
}

#[async_trait]
impl Evaluator for ExactPathEvaluator {
    fn name(&self) -> &str {
        "exact_path"
    }

    async fn evaluate(&self, scenario: &Scenario, result: &ScenarioResult) -> Result<EvalScore> {
        let expected = &scenario.expected_actions;
        let actual = result.actions();

        let prefix = expected
            .iter()
            .zip(actual.iter())
            .take_while(|(exp, act)| self.matches(exp, act))
            .count();
        let full_match = prefix == expected.len() && actual.len() == expected.len();
        let completed = result.status == RunStatus::Completed;

        // an empty expectation is only met by a run that actually completed
        let score = if full_match && completed {
            1.0
        } else if expected.is_empty() {
            0.0
        } else {
            prefix as f64 / expected.len() as f64
        };
        let passed = full_match && completed;

        let mismatch = if full_match {
            None
        } else {
            Some(json!({
                "step": prefix,
                "expected": expected.get(prefix).map(Action::describe),
                "actual": actual.get(prefix).map(|a| a.describe()),
            }))
        };

        let explanation = if !completed {
            format!(
                "run did not complete; {} of {} expected actions matched",
                prefix,
                expected.len()
            )
        } else if full_match {
            format!("all {} actions matched", expected.len())
        } else if actual.len() != expected.len() && prefix == expected.len().min(actual.len()) {
            format!(
                "length mismatch: expected {} actions, got {}",
                expected.len(),
                actual.len()
            )
        } else {
            format!(
                "first mismatch at step {}; {} of {} expected actions matched",
                prefix,
                prefix,
                expected.len()
            )
        };

        Ok(EvalScore::new(self.name(), score, passed, explanation).with_details(json!({
            "matched_prefix": prefix,
            "expected_count": expected.len(),
            "actual_count": actual.len(),
            "check_parameters": self.check_parameters,
            "mismatch": mismatch,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::frame::Frame;
    use crate::models::{StepResult, VlmResponse};
    use std::sync::Arc;

    fn pick_up_cup() -> Scenario {
        Scenario::new("pick_up_cup", "A robot near a table with a cup").with_expected_actions(vec![
            Action::new("move_forward").with_param("distance", 0.5),
            Action::new("pick_up").with_param("object", "cup"),
        ])
    }

    fn run_with(scenario: &Scenario, actions: Vec<Action>) -> ScenarioResult {
        let mut result = ScenarioResult::new(scenario.clone());
        for (i, action) in actions.into_iter().enumerate() {
            result.push_step(StepResult::new(
                i,
                String::new(),
                Arc::new(Frame::solid(1, 1, [0, 0, 0])),
                VlmResponse::new(action),
            ));
        }
        result
    }

    #[tokio::test]
    async fn test_identical_path_scores_one() {
        let scenario = pick_up_cup();
        let result = run_with(&scenario, scenario.expected_actions.clone());
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert_eq!(score.score, Some(1.0));
        assert!(score.passed);
    }

    #[tokio::test]
    async fn test_wrong_second_action_scores_half() {
        let scenario = pick_up_cup();
        let result = run_with(
            &scenario,
            vec![
                Action::new("move_forward").with_param("distance", 0.5),
                Action::new("move_backward").with_param("distance", 0.2),
            ],
        );
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert_eq!(score.score, Some(0.5));
        assert!(!score.passed);
        assert_eq!(score.details["mismatch"]["step"], 1);
        assert_eq!(score.details["mismatch"]["actual"], "move_backward(distance=0.2)");
    }

    #[tokio::test]
    async fn test_extra_actions_fail() {
        let scenario = pick_up_cup();
        let mut actions = scenario.expected_actions.clone();
        actions.push(Action::new("turn").with_param("angle", 90));
        let result = run_with(&scenario, actions);
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert!(!score.passed);
        assert_eq!(score.score, Some(1.0));
        assert!(score.explanation.contains("length mismatch"));
    }

    #[tokio::test]
    async fn test_truncated_path_fails() {
        let scenario = pick_up_cup();
        let result = run_with(&scenario, vec![scenario.expected_actions[0].clone()]);
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert!(!score.passed);
        assert_eq!(score.score, Some(0.5));
    }

    #[tokio::test]
    async fn test_name_only_comparison() {
        let scenario = pick_up_cup();
        let result = run_with(
            &scenario,
            vec![
                Action::new("move_forward").with_param("distance", 0.7),
                Action::new("pick_up").with_param("object", "mug"),
            ],
        );
        let strict = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert!(!strict.passed);
        let lenient = ExactPathEvaluator::new()
            .with_check_parameters(false)
            .evaluate(&scenario, &result)
            .await
            .unwrap();
        assert!(lenient.passed);
    }

    #[tokio::test]
    async fn test_zero_steps() {
        let scenario = pick_up_cup();
        let result = run_with(&scenario, vec![]);
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert_eq!(score.score, Some(0.0));
        assert!(!score.passed);
    }

    #[tokio::test]
    async fn test_empty_expectation() {
        let scenario = Scenario::new("free", "Explore");
        let empty = run_with(&scenario, vec![]);
        let score = ExactPathEvaluator::new().evaluate(&scenario, &empty).await.unwrap();
        assert_eq!(score.score, Some(1.0));
        assert!(score.passed);

        let busy = run_with(&scenario, vec![Action::new("turn")]);
        let score = ExactPathEvaluator::new().evaluate(&scenario, &busy).await.unwrap();
        assert_eq!(score.score, Some(0.0));
        assert!(!score.passed);
    }

    #[tokio::test]
    async fn test_failed_run_never_passes() {
        let scenario = Scenario::new("free", "Explore");
        let mut result = run_with(&scenario, vec![]);
        result.fail(0, StepError::Adapter { message: "boom".to_string() });
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert!(!score.passed);
        assert_eq!(score.score, Some(0.0));
        assert!(score.explanation.contains("did not complete"));
    }

    #[tokio::test]
    async fn test_failed_run_keeps_partial_credit() {
        let scenario = pick_up_cup();
        let mut result = run_with(&scenario, vec![scenario.expected_actions[0].clone()]);
        result.fail(1, StepError::Decode { message: "bad clip".to_string() });
        let score = ExactPathEvaluator::new().evaluate(&scenario, &result).await.unwrap();
        assert!(!score.passed);
        assert_eq!(score.score, Some(0.5));
    }
}
