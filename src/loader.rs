use crate::models::Scenario;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk layout of a scenario file: one or more `[[scenarios]]` tables
#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenarios: Vec<Scenario>,
}

/// Load every scenario defined in one TOML file
pub fn load_scenario_file(path: &Path) -> Result<Vec<Scenario>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;

    let file: ScenarioFile =
        toml::from_str(&content).with_context(|| format!("Failed to parse TOML scenarios: {}", path.display()))?;

    if file.scenarios.is_empty() {
        anyhow::bail!("No [[scenarios]] defined in {}", path.display());
    }
    for scenario in &file.scenarios {
        if scenario.name.trim().is_empty() {
            anyhow::bail!("Scenario with empty name in {}", path.display());
        }
        if let Some(0) = scenario.max_steps {
            anyhow::bail!("Scenario '{}' has max_steps = 0", scenario.name);
        }
    }

    debug!(path = %path.display(), count = file.scenarios.len(), "loaded scenario file");
    Ok(file.scenarios)
}

/// Load scenarios from a file, or from every `*.toml` file in a directory.
///
/// Directory entries are read in file-name order; files starting with `_`
/// are skipped. Scenario names must be unique across everything loaded.
pub fn load_scenarios(path: &Path) -> Result<Vec<Scenario>> {
    let scenarios = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to read scenario directory: {}", path.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('_'))
            })
            .collect();
        files.sort();

        let mut all = Vec::new();
        for file in &files {
            all.extend(load_scenario_file(file)?);
        }
        all
    } else {
        load_scenario_file(path)?
    };

    let mut seen = HashSet::new();
    for scenario in &scenarios {
        if !seen.insert(scenario.name.as_str()) {
            anyhow::bail!("Duplicate scenario name '{}' in {}", scenario.name, path.display());
        }
    }
    Ok(scenarios)
}

/// Find a scenario file by path or bare name.
///
/// Tries `name` as given, then `scenarios/<name>.toml`, then `<name>.toml`.
pub fn resolve_scenario_path(name: &str) -> Result<PathBuf> {
    let candidates = [
        PathBuf::from(name),
        Path::new("scenarios").join(format!("{}.toml", name)),
        PathBuf::from(format!("{}.toml", name)),
    ];

    candidates
        .iter()
        .find(|candidate| candidate.exists())
        .cloned()
        .with_context(|| format!("Scenario '{}' not found (tried {})", name, display_candidates(&candidates)))
}

fn display_candidates(candidates: &[PathBuf]) -> String {
    candidates
        .iter()
        .map(|c| c.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
