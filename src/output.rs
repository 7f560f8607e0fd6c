use crate::models::{RunStatus, ScenarioResult};
use crate::report::{Statistics, calculate_statistics};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Aggregate report printed in JSON mode
#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    passed: usize,
    total: usize,
    statistics: Statistics,
    results: &'a [ScenarioResult],
}

/// Print run results in the specified format
pub fn print_results(results: &[ScenarioResult], format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(results)),
        OutputFormat::Json => print_json(results),
    }
}

/// Number of passing scenarios
pub fn passed_count(results: &[ScenarioResult]) -> usize {
    results.iter().filter(|r| r.passed()).count()
}

/// Render results as a console report
pub fn render_plain(results: &[ScenarioResult]) -> String {
    let mut out = String::new();

    for result in results {
        let verdict = if result.passed() { "PASS" } else { "FAIL" };
        let _ = writeln!(
            out,
            "[{}] {}  ({}, {} steps, {:.1}s, ${:.4})",
            verdict,
            result.scenario.name,
            result.termination.as_str(),
            result.steps.len(),
            result.wall_time_ms / 1000.0,
            result.total_cost_usd
        );

        for step in &result.steps {
            let _ = writeln!(out, "    {:>3}. {}", step.step_index, step.action().describe());
        }

        for score in &result.scores {
            let marker = if score.passed { "PASS" } else { "FAIL" };
            match score.score {
                Some(value) => {
                    let _ = writeln!(out, "  • {}: {:.3} {} {}", score.evaluator, value, marker, score.explanation);
                }
                None => {
                    let _ = writeln!(out, "  • {}: n/a {} {}", score.evaluator, marker, score.explanation);
                }
            }
        }

        if result.status == RunStatus::Failed {
            if let Some(error) = result.error_message() {
                let _ = writeln!(out, "  error: {}", error);
            }
        }
        out.push('\n');
    }

    out.push_str(&render_statistics(&calculate_statistics(results)));
    let _ = writeln!(out, "{}/{} scenarios passed", passed_count(results), results.len());
    out
}

/// Render statistics as a table
fn render_statistics(stats: &Statistics) -> String {
    let mut out = String::new();
    if stats.mean.is_empty() {
        return out;
    }

    let _ = writeln!(out, "{:<15} {:<8} {:<8} {:<8}", "Evaluator", "Mean", "Median", "Mode");
    let _ = writeln!(out, "{}", "-".repeat(45));
    for (evaluator, mean) in &stats.mean {
        let median = stats.median.get(evaluator).unwrap_or(&0.0);
        let mode = stats.mode.get(evaluator).unwrap_or(&0.0);
        let _ = writeln!(out, "{:<15} {:<8.3} {:<8.3} {:<8.3}", evaluator, mean, median, mode);
    }
    out.push('\n');
    out
}

/// Render results as a JSON document
pub fn render_json(results: &[ScenarioResult]) -> serde_json::Result<String> {
    let report = JsonReport {
        passed: passed_count(results),
        total: results.len(),
        statistics: calculate_statistics(results),
        results,
    };
    serde_json::to_string_pretty(&report)
}

/// Print results in JSON format
fn print_json(results: &[ScenarioResult]) {
    match render_json(results) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::frame::Frame;
    use crate::models::{Action, EvalScore, Scenario, StepResult, VlmResponse};
    use std::sync::Arc;

    fn create_test_results() -> Vec<ScenarioResult> {
        let mut passing = ScenarioResult::new(Scenario::new("pick_up_cup", "A cup"));
        passing.push_step(StepResult::new(
            0,
            "A cup".to_string(),
            Arc::new(Frame::solid(1, 1, [0, 0, 0])),
            VlmResponse::new(Action::new("pick_up").with_param("object", "cup")),
        ));
        passing.record_scores(vec![EvalScore::new("exact_path", 1.0, true, "all 1 actions matched")]);

        let mut failing = ScenarioResult::new(Scenario::new("open_door", "A door"));
        failing.fail(0, StepError::Adapter { message: "render crashed".to_string() });
        let err = anyhow::anyhow!("judge down");
        failing.record_scores(vec![
            EvalScore::new("exact_path", 0.0, false, "run did not complete"),
            EvalScore::errored("semantic", &err),
        ]);

        vec![passing, failing]
    }

    #[test]
    fn test_plain_output_lists_verdicts_and_footer() {
        let text = render_plain(&create_test_results());
        assert!(text.contains("[PASS] pick_up_cup"));
        assert!(text.contains("pick_up(object=cup)"));
        assert!(text.contains("[FAIL] open_door"));
        assert!(text.contains("error: world model error: render crashed"));
        assert!(text.contains("semantic: n/a FAIL"));
        assert!(text.contains("Evaluator"));
        assert!(text.trim_end().ends_with("1/2 scenarios passed"));
    }

    #[test]
    fn test_plain_output_empty() {
        assert_eq!(render_plain(&[]), "0/0 scenarios passed\n");
    }

    #[test]
    fn test_json_output() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&create_test_results()).unwrap()).unwrap();
        assert_eq!(json["passed"], 1);
        assert_eq!(json["total"], 2);
        assert_eq!(json["results"][1]["failure"]["error"]["kind"], "adapter");
        assert_eq!(json["statistics"]["mean"]["exact_path"], 0.5);
        assert!(json["results"][1]["scores"][1]["score"].is_null());
    }
}
