//! Scorers applied to a finished trajectory.
//!
//! Every evaluator is read-only over the [`ScenarioResult`] and reports one
//! [`EvalScore`]. An evaluator that fails (e.g. the judge is unreachable) is
//! recorded as a scoreless failing entry and never hides the other scores.

mod composite;
mod exact;
mod outcome;
mod semantic;

pub use composite::{CombineMode, CompositeEvaluator};
pub use exact::ExactPathEvaluator;
pub use outcome::OutcomeEvaluator;
pub use semantic::SemanticEvaluator;

use crate::config::{CombineKind, EvaluationConfig, EvaluatorKind};
use crate::judge::Judge;
use crate::models::{Action, EvalScore, Scenario, ScenarioResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Name recorded on the produced score
    fn name(&self) -> &str;

    async fn evaluate(&self, scenario: &Scenario, result: &ScenarioResult) -> Result<EvalScore>;
}

/// Run every evaluator over the trajectory, in order.
///
/// Failures become scoreless entries carrying the error text.
pub async fn score_trajectory(evaluators: &[Arc<dyn Evaluator>], result: &ScenarioResult) -> Vec<EvalScore> {
    let mut scores = Vec::with_capacity(evaluators.len());
    for evaluator in evaluators {
        let score = match evaluator.evaluate(&result.scenario, result).await {
            Ok(score) => score,
            Err(e) => {
                warn!(
                    evaluator = evaluator.name(),
                    scenario = %result.scenario.name,
                    error = %format!("{:#}", e),
                    "evaluator failed"
                );
                EvalScore::errored(evaluator.name(), &e)
            }
        };
        scores.push(score);
    }
    scores
}

/// Build the evaluator list described by configuration.
///
/// Judge-based evaluators require `judge`; asking for them without one is an error.
pub fn build_evaluators(config: &EvaluationConfig, judge: Option<Arc<dyn Judge>>) -> Result<Vec<Arc<dyn Evaluator>>> {
    let mut evaluators: Vec<Arc<dyn Evaluator>> = Vec::with_capacity(config.evaluators.len());
    for kind in &config.evaluators {
        let evaluator: Arc<dyn Evaluator> = match kind {
            EvaluatorKind::ExactPath => {
                Arc::new(ExactPathEvaluator::new().with_check_parameters(config.check_parameters))
            }
            EvaluatorKind::Semantic => {
                let judge = required_judge(&judge, "semantic")?;
                Arc::new(SemanticEvaluator::new(judge).with_threshold(config.threshold))
            }
            EvaluatorKind::Outcome => {
                let judge = required_judge(&judge, "outcome")?;
                Arc::new(OutcomeEvaluator::new(judge).with_threshold(config.threshold))
            }
        };
        evaluators.push(evaluator);
    }

    let Some(kind) = config.composite else {
        return Ok(evaluators);
    };
    let mode = match kind {
        CombineKind::And => CombineMode::And,
        CombineKind::Or => CombineMode::Or,
        CombineKind::Weighted => CombineMode::WeightedThreshold {
            threshold: config.composite_threshold,
        },
    };
    let mut composite = CompositeEvaluator::new(evaluators, mode);
    if !config.weights.is_empty() {
        composite = composite.with_weights(config.weights.clone())?;
    }
    Ok(vec![Arc::new(composite)])
}

fn required_judge(judge: &Option<Arc<dyn Judge>>, evaluator: &str) -> Result<Arc<dyn Judge>> {
    match judge {
        Some(judge) => Ok(Arc::clone(judge)),
        None => anyhow::bail!("Evaluator '{}' requires a judge model", evaluator),
    }
}

/// Numbered action list used in judge prompts
pub(crate) fn numbered_actions<'a>(actions: impl IntoIterator<Item = &'a Action>, empty: &str) -> String {
    let lines: Vec<String> = actions
        .into_iter()
        .enumerate()
        .map(|(i, action)| format!("  {}. {}", i + 1, action.describe()))
        .collect();
    if lines.is_empty() {
        format!("  {}", empty)
    } else {
        lines.join("\n")
    }
}
