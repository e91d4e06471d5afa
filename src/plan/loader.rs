//! Plan loading (C9): reads YAML plan source from a path or an in-memory
//! string, mirroring the source project's `loader::load_plan_from_file` but
//! switching the wire format from JSON to YAML.

use std::path::Path;

use anyhow::{Context, Result};

use super::Plan;

/// Where the plan's YAML source comes from.
pub enum PlanSource<'a> {
    Path(&'a Path),
    Str(&'a str),
}

impl<'a> From<&'a Path> for PlanSource<'a> {
    fn from(p: &'a Path) -> Self {
        PlanSource::Path(p)
    }
}

impl<'a> From<&'a str> for PlanSource<'a> {
    fn from(s: &'a str) -> Self {
        PlanSource::Str(s)
    }
}

pub fn load_plan(source: PlanSource<'_>) -> Result<Plan> {
    match source {
        PlanSource::Path(path) => load_plan_from_file(path),
        PlanSource::Str(text) => parse_plan(text),
    }
}

pub fn load_plan_from_file<P: AsRef<Path>>(path: P) -> Result<Plan> {
    let content = std::fs::read_to_string(path).context("failed to read plan file")?;
    parse_plan(&content)
}

pub fn parse_plan(yaml: &str) -> Result<Plan> {
    serde_yaml::from_str(yaml).context("failed to parse plan YAML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_rejects_malformed_yaml() {
        let result = parse_plan("steps: [");
        assert!(result.is_err());
    }

    #[test]
    fn parse_plan_accepts_minimal_document() {
        let yaml = "rootContext: {}\nsteps:\n  - type: request\n    request:\n      url: https://x\n";
        let plan = parse_plan(yaml).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }
}
