use super::Evaluator;
use crate::judge::Judge;
use crate::models::{EvalScore, Scenario, ScenarioResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Judges only the end state: the final frame, the last action and how the run ended
pub struct OutcomeEvaluator {
    judge: Arc<dyn Judge>,
    threshold: f64,
}

impl OutcomeEvaluator {
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
        let last_action = result
            .steps
            .last()
            .map(|step| step.action().describe())
            .unwrap_or_else(|| "(none)".to_string());

        format!(
            "You are evaluating whether a robot successfully completed a task. \
The attached image, if any, is the final camera frame.\n\n\
Task: {}\n\
Success criteria: {}\n\
Last action: {}\n\
Termination reason: {}\n\n\
Does the final state satisfy the success criteria? Score from 0.0 to 1.0.\n\
Respond with ONLY a JSON object: {{\"score\": <float>, \"reasoning\": \"<brief explanation>\"}}",
            scenario.prompt,
            criteria,
            last_action,
            result.termination.as_str(),
        )
    }
}

#[async_trait]
impl Evaluator for OutcomeEvaluator {
    fn name(&self) -> &str {
        "outcome"
    }

    async fn evaluate(&self, scenario: &Scenario, result: &ScenarioResult) -> Result<EvalScore> {
        if result.steps.is_empty() {
            return Ok(EvalScore::new(self.name(), 0.0, false, "no steps were executed")
                .with_details(json!({ "threshold": self.threshold })));
        }

        let final_frame = result
            .final_frame
            .as_deref()
            .or_else(|| result.steps.last().map(|step| step.frame.as_ref()));
        let prompt = self.build_prompt(scenario, result);
        let verdict = self.judge.judge(&prompt, final_frame).await?;
        let passed = verdict.score >= self.threshold;

        Ok(
            EvalScore::new(self.name(), verdict.score, passed, verdict.reasoning.clone()).with_details(json!({
                "reasoning": verdict.reasoning,
                "threshold": self.threshold,
                "final_frame": final_frame.is_some(),
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::test_support::FixedJudge;
    use crate::frame::Frame;
    use crate::models::{Action, StepResult, TerminationReason, VlmResponse};

    fn finished_run(scenario: &Scenario) -> ScenarioResult {
        let mut result = ScenarioResult::new(scenario.clone());
        for (i, name) in ["move_forward", "pick_up"].iter().enumerate() {
            result.push_step(StepResult::new(
                i,
                String::new(),
                Arc::new(Frame::solid(1, 1, [0, 0, 0])),
                VlmResponse::new(Action::new(*name)),
            ));
        }
        result.termination = TerminationReason::Done;
        result.final_frame = Some(Arc::new(Frame::solid(2, 2, [255, 255, 255])));
        result
    }

    #[tokio::test]
    async fn test_sends_final_frame_and_last_action() {
        let judge = Arc::new(FixedJudge::new(0.9));
        let evaluator = OutcomeEvaluator::new(judge.clone());
        let scenario = Scenario::new("s", "A cup on a table").with_success_criteria("The cup is lifted");

        let score = evaluator.evaluate(&scenario, &finished_run(&scenario)).await.unwrap();
        assert!(score.passed);
        assert_eq!(score.details["final_frame"], true);

        let prompts = judge.prompts.lock().unwrap();
        let (prompt, with_image) = &prompts[0];
        assert!(*with_image);
        assert!(prompt.contains("Last action: pick_up()"));
        assert!(prompt.contains("Termination reason: done"));
        assert!(!prompt.contains("move_forward"));
    }

    #[tokio::test]
    async fn test_low_score_fails() {
        let evaluator = OutcomeEvaluator::new(Arc::new(FixedJudge::new(0.3)));
        let scenario = Scenario::new("s", "p");
        let score = evaluator.evaluate(&scenario, &finished_run(&scenario)).await.unwrap();
        assert!(!score.passed);
        assert_eq!(score.score, Some(0.3));
    }

    #[tokio::test]
    async fn test_zero_steps_fails_without_judge() {
        let judge = Arc::new(FixedJudge::new(1.0));
        let evaluator = OutcomeEvaluator::new(judge.clone());
        let scenario = Scenario::new("s", "p");
        let score = evaluator
            .evaluate(&scenario, &ScenarioResult::new(scenario.clone()))
            .await
            .unwrap();
        assert!(!score.passed);
        assert_eq!(judge.calls(), 0);
    }
}
