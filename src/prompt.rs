use crate::models::{Action, Scenario};

/// Turns (scenario, step index, action history) into the next clip prompt.
///
/// Implementations must be deterministic: the same inputs always produce the
/// same text, so a retried step renders the same instruction.
pub trait PromptStrategy: Send + Sync {
    fn build(&self, scenario: &Scenario, step_index: usize, history: &[Action]) -> String;
}

/// Base prompt followed by every prior action's instruction text, in order
#[derive(Debug, Clone, Default)]
pub struct AccumulatingPrompt;

impl PromptStrategy for AccumulatingPrompt {
    fn build(&self, scenario: &Scenario, _step_index: usize, history: &[Action]) -> String {
        let mut parts = Vec::with_capacity(history.len() + 1);
        parts.push(scenario.prompt.clone());
        parts.extend(history.iter().map(Action::to_interact_prompt));
        parts.join("\n\n")
    }
}

/// Base prompt plus only the most recent action
#[derive(Debug, Clone, Default)]
pub struct LatestActionPrompt;

impl PromptStrategy for LatestActionPrompt {
    fn build(&self, scenario: &Scenario, _step_index: usize, history: &[Action]) -> String {
        match history.last() {
            Some(action) => format!("{}\n\n{}", scenario.prompt, action.to_interact_prompt()),
            None => scenario.prompt.clone(),
        }
    }
}
