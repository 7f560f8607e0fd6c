use super::{Evaluator, numbered_actions};
use crate::judge::Judge;
use crate::models::{EvalScore, Scenario, ScenarioResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Asks a judge how close the decided path is to the intended one
pub struct SemanticEvaluator {
    judge: Arc<dyn Judge>,
    threshold: f64,
}

impl SemanticEvaluator {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self {
            judge,
            threshold: 0.7,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn build_prompt(&self, scenario: &Scenario, result: &ScenarioResult) -> String {
        let criteria = if scenario.success_criteria.is_empty() {
            "(not specified)"
        } else {
            scenario.success_criteria.as_str()
        };
        format!(
            "You are evaluating whether a robot's action sequence is semantically equivalent \
to the expected sequence for a given task.\n\n\
Task: {}\n\
Success criteria: {}\n\n\
Expected actions:\n{}\n\n\
Actual actions:\n{}\n\n\
Score from 0.0 to 1.0 how semantically similar the actual path is to the expected path. \
Consider action intent, ordering, and overall task completion.\n\
Respond with ONLY a JSON object: {{\"score\": <float>, \"reasoning\": \"<brief explanation>\"}}",
            scenario.prompt,
            criteria,
            numbered_actions(&scenario.expected_actions, "(none specified)"),
            numbered_actions(result.actions(), "(none)"),
        )
    }
}

#[async_trait]
impl Evaluator for SemanticEvaluator {
    fn name(&self) -> &str {
        "semantic"
    }

    async fn evaluate(&self, scenario: &Scenario, result: &ScenarioResult) -> Result<EvalScore> {
        if result.steps.is_empty() {
            return Ok(EvalScore::new(self.name(), 0.0, false, "no actions were taken")
                .with_details(json!({ "threshold": self.threshold })));
        }

        let verdict = self.judge.judge(&self.build_prompt(scenario, result), None).await?;
        let passed = verdict.score >= self.threshold;
        Ok(
            EvalScore::new(self.name(), verdict.score, passed, verdict.reasoning.clone()).with_details(json!({
                "reasoning": verdict.reasoning,
                "threshold": self.threshold,
            })),
        )
    }
}
