use crate::models::{Scenario, ScenarioResult, StepResult};
use crate::runner::StepObserver;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Summary statistics per evaluator across scenarios
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Mean score per evaluator
    pub mean: BTreeMap<String, f64>,
    /// Median score per evaluator
    pub median: BTreeMap<String, f64>,
    /// Most frequent score per evaluator, rounded to one decimal
    pub mode: BTreeMap<String, f64>,
}

/// Calculate statistics for every evaluator seen in `results`.
///
/// Scoreless entries (failed evaluators) are ignored; an evaluator with no
/// numeric score at all reports zeros.
pub fn calculate_statistics(results: &[ScenarioResult]) -> Statistics {
    let evaluators: BTreeSet<&str> = results
        .iter()
        .flat_map(|r| r.scores.iter().map(|s| s.evaluator.as_str()))
        .collect();

    let mut stats = Statistics::default();
    for evaluator in evaluators {
        let scores: Vec<f64> = results
            .iter()
            .filter_map(|r| r.score(evaluator).and_then(|s| s.score))
            .collect();

        let (mean, median, mode) = if scores.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (calculate_mean(&scores), calculate_median(&scores), calculate_mode(&scores))
        };
        stats.mean.insert(evaluator.to_string(), mean);
        stats.median.insert(evaluator.to_string(), median);
        stats.mode.insert(evaluator.to_string(), mode);
    }
    stats
}

fn calculate_mean(scores: &[f64]) -> f64 {
    scores.iter().sum::<f64>() / scores.len() as f64
}

fn calculate_median(scores: &[f64]) -> f64 {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Most frequent value after rounding to one decimal; ties go to the lowest value
fn calculate_mode(scores: &[f64]) -> f64 {
    let mut frequency: HashMap<i64, usize> = HashMap::new();
    for &score in scores {
        *frequency.entry((score * 10.0).round() as i64).or_insert(0) += 1;
    }

    frequency
        .into_iter()
        .max_by(|(a_value, a_count), (b_value, b_count)| a_count.cmp(b_count).then(b_value.cmp(a_value)))
        .map(|(tenths, _)| tenths as f64 / 10.0)
        .unwrap_or(0.0)
}

/// Persists run results and frames under one output root.
///
/// Layout per scenario: `<root>/<scenario>_<UTC timestamp>/result.json`,
/// `final.png` and `frames/step_XXXX/frame_0000.png`.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
    stamp: String,
    save_frames: bool,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>, save_frames: bool) -> Self {
        Self {
            root: root.into(),
            stamp: chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            save_frames,
        }
    }

    /// Directory holding the outputs of one scenario
    pub fn run_dir(&self, scenario_name: &str) -> PathBuf {
        self.root.join(format!("{}_{}", sanitize(scenario_name), self.stamp))
    }

    /// Write `result.json` (and the final frame when enabled); returns the run directory
    pub fn write_result(&self, result: &ScenarioResult) -> Result<PathBuf> {
        let dir = self.run_dir(&result.scenario.name);
        ensure_dir(&dir)?;

        let json = serde_json::to_string_pretty(result).context("Failed to serialize scenario result to JSON")?;
        let path = dir.join("result.json");
        std::fs::write(&path, json).with_context(|| format!("Failed to write results to: {}", path.display()))?;

        if self.save_frames {
            if let Some(frame) = &result.final_frame {
                let png = frame.to_png().context("Failed to encode final frame")?;
                let final_path = dir.join("final.png");
                std::fs::write(&final_path, png)
                    .with_context(|| format!("Failed to write frame: {}", final_path.display()))?;
            }
        }

        debug!(path = %path.display(), "wrote scenario result");
        Ok(dir)
    }

    fn write_step_frame(&self, scenario: &Scenario, step: &StepResult) -> Result<PathBuf> {
        let dir = self
            .run_dir(&scenario.name)
            .join("frames")
            .join(format!("step_{:04}", step.step_index));
        ensure_dir(&dir)?;

        let png = step.frame.to_png().context("Failed to encode step frame")?;
        let path = dir.join("frame_0000.png");
        std::fs::write(&path, png).with_context(|| format!("Failed to write frame: {}", path.display()))?;
        Ok(path)
    }
}

impl StepObserver for ReportWriter {
    fn on_step(&self, scenario: &Scenario, step: &StepResult) {
        if !self.save_frames {
            return;
        }
        if let Err(e) = self.write_step_frame(scenario, step) {
            warn!(scenario = %scenario.name, step = step.step_index, error = %format!("{:#}", e), "could not save frame");
        }
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {}", dir.display()))
}

/// Keep names filesystem-safe
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
