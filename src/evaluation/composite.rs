use super::Evaluator;
use crate::models::{EvalScore, Scenario, ScenarioResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Tolerance for comparing a weighted mean against its threshold
const THRESHOLD_EPSILON: f64 = 1e-9;

/// How child verdicts are combined
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CombineMode {
    /// Every child must pass
    And,
    /// At least one child must pass
    Or,
    /// Weighted mean of child scores must reach the threshold
    WeightedThreshold { threshold: f64 },
}

impl CombineMode {
    fn label(&self) -> &'static str {
        match self {
            CombineMode::And => "and",
            CombineMode::Or => "or",
            CombineMode::WeightedThreshold { .. } => "weighted",
        }
    }
}

/// Combines child evaluators into one score.
///
/// The combined score is always the weighted mean of the child scores; the
/// mode only decides `passed`. A child that errors counts as failed with score 0.
pub struct CompositeEvaluator {
    name: String,
    children: Vec<Arc<dyn Evaluator>>,
    weights: Option<Vec<f64>>,
    mode: CombineMode,
}

impl CompositeEvaluator {
    pub fn new(children: Vec<Arc<dyn Evaluator>>, mode: CombineMode) -> Self {
        Self {
            name: "composite".to_string(),
            children,
            weights: None,
            mode,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// One non-negative weight per child, with a positive total
    pub fn with_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.children.len() {
            anyhow::bail!(
                "Composite evaluator has {} children but {} weights",
                self.children.len(),
                weights.len()
            );
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            anyhow::bail!("Composite weights must be finite and non-negative");
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            anyhow::bail!("Composite weights must not all be zero");
        }
        self.weights = Some(weights);
        Ok(self)
    }

    fn weight(&self, index: usize) -> f64 {
        self.weights.as_ref().map_or(1.0, |w| w[index])
    }
}

#[async_trait]
impl Evaluator for CompositeEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, scenario: &Scenario, result: &ScenarioResult) -> Result<EvalScore> {
        if self.children.is_empty() {
            return Ok(EvalScore::new(self.name(), 1.0, true, "no child evaluators")
                .with_details(json!({ "mode": self.mode.label(), "children": [] })));
        }

        let mut child_scores = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let score = match child.evaluate(scenario, result).await {
                Ok(score) => score,
                Err(e) => EvalScore::errored(child.name(), &e),
            };
            child_scores.push(score);
        }

        let total_weight: f64 = (0..child_scores.len()).map(|i| self.weight(i)).sum();
        let weighted_mean = child_scores
            .iter()
            .enumerate()
            .map(|(i, s)| self.weight(i) * s.value())
            .sum::<f64>()
            / total_weight;

        let passed = match self.mode {
            CombineMode::And => child_scores.iter().all(|s| s.passed),
            CombineMode::Or => child_scores.iter().any(|s| s.passed),
            CombineMode::WeightedThreshold { threshold } => weighted_mean >= threshold - THRESHOLD_EPSILON,
        };

        let explanation = child_scores
            .iter()
            .map(|s| {
                let verdict = if s.passed { "PASS" } else { "FAIL" };
                match s.score {
                    Some(value) => format!("{}: {} ({:.2}) {}", s.evaluator, verdict, value, s.explanation),
                    None => format!("{}: {} {}", s.evaluator, verdict, s.explanation),
                }
            })
            .collect::<Vec<_>>()
            .join("; ");

        let children: Vec<_> = child_scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                json!({
                    "evaluator": s.evaluator,
                    "score": s.score,
                    "passed": s.passed,
                    "weight": self.weight(i),
                })
            })
            .collect();
        let mut details = json!({ "mode": self.mode.label(), "children": children });
        if let CombineMode::WeightedThreshold { threshold } = self.mode {
            details["threshold"] = json!(threshold);
        }

        Ok(EvalScore::new(self.name(), weighted_mean, passed, explanation).with_details(details))
    }
}
