//! Engine prompt construction.
//!
//! Every prompt carries the task, the workspace summary, and the artifacts
//! earlier phases produced, then asks for a single JSON object back.

use serde_json::Value;
use shipyard_common::{AcceptanceCriterion, Feature};
use std::fmt::Write as _;

use super::testing::TestReport;
use crate::state::Artifact;
use crate::util::tail_chars;

const ARTIFACT_LIMIT: usize = 6000;

/// Shared context for every engine call in a task.
pub struct PromptContext {
    pub task: String,
    pub workspace: String,
    pub artifacts: Vec<(Artifact, Value)>,
}

impl PromptContext {
    fn base(&self) -> String {
        let mut out = format!(
            "## TASK\n{}\n\n## WORKSPACE\n{}\n",
            self.task.trim(),
            self.workspace.trim_end()
        );
        if !self.artifacts.is_empty() {
            out.push_str("\n## CONTEXT FROM EARLIER PHASES\n");
            for (artifact, value) in &self.artifacts {
                let text = serde_json::to_string_pretty(value).unwrap_or_default();
                let _ = write!(out, "\n### {}\n{}\n", artifact.name(), tail_chars(&text, ARTIFACT_LIMIT));
            }
        }
        out
    }
}

pub fn analysis(ctx: &PromptContext) -> String {
    format!(
        r#"You are analysing a change request before any code is written. Do not modify files.

{}
## INSTRUCTIONS
1. Classify the task as "trivial" (a few obvious lines), "standard" (one coherent change),
   or "complex" (several independently verifiable features).
2. For "complex", decompose it into features in dependency order. `depends_on` holds the
   zero-based indices of earlier features. Each feature lists acceptance criteria of kind
   "test" (target: a test path or filter), "assert" (a structural condition), or "manual".

Reply with one JSON object:
{{"complexity": "trivial|standard|complex", "summary": "...",
  "features": [{{"title": "...", "task": "...", "depends_on": [],
                 "criteria": [{{"kind": "test", "target": "..."}}]}}]}}
"#,
        ctx.base()
    )
}

pub fn develop(ctx: &PromptContext, feature: Option<&Feature>, extra: Option<&str>) -> String {
    let mut out = format!(
        "You are implementing a change in the repositories listed below.\n\n{}",
        ctx.base()
    );
    if let Some(feature) = feature {
        let _ = write!(
            out,
            "\n## CURRENT FEATURE ({} of the plan)\n{}\n\n{}\n",
            feature.index, feature.title, feature.task
        );
    }
    if let Some(extra) = extra.filter(|e| !e.trim().is_empty()) {
        let _ = write!(out, "\n## ADDITIONAL CONTEXT\n{}\n", extra.trim());
    }
    out.push_str(
        r#"
## RULES
1. Stay on the checked-out branch; do not commit, push, or switch branches.
2. Keep the change focused on the task.
3. Add or update tests for the behaviour you change.

Reply with one JSON object: {"summary": "...", "changed_files": ["..."]}
"#,
    );
    out
}

pub fn fix(ctx: &PromptContext, report: &TestReport) -> String {
    let mut failures = String::new();
    for repo in &report.repositories {
        for outcome in repo.failures() {
            let _ = write!(
                failures,
                "\n### {} `{}` in {}\n{}\n",
                outcome.kind,
                outcome.command,
                repo.repository,
                tail_chars(&outcome.output, 3000)
            );
        }
    }
    let scope = if report.lint_only {
        "Only lint is failing. Fix the lint findings without changing behaviour."
    } else {
        "Tests are failing. Fix the code (or a wrong test) so the checks pass."
    };
    format!(
        r#"{scope}

{}
## FAILING CHECKS
{failures}
Reply with one JSON object: {{"summary": "...", "changed_files": ["..."]}}
"#,
        ctx.base()
    )
}

pub fn criteria_fix(ctx: &PromptContext, feature: &Feature, unmet: &[AcceptanceCriterion]) -> String {
    let mut list = String::new();
    for criterion in unmet {
        let _ = writeln!(
            list,
            "- {} ({:?}): {}",
            criterion.id, criterion.kind, criterion.target_or_description
        );
    }
    format!(
        r#"Feature {} "{}" does not meet its acceptance criteria yet.

{}
## FEATURE TASK
{}

## UNMET CRITERIA
{list}
Change the code so every criterion above holds.
Reply with one JSON object: {{"summary": "...", "changed_files": ["..."]}}
"#,
        feature.index,
        feature.title,
        ctx.base(),
        feature.task
    )
}

pub fn assertion(feature: &Feature, criterion: &AcceptanceCriterion) -> String {
    format!(
        r#"Inspect the working tree without modifying it and judge one condition for
feature "{}".

## CONDITION
{}

Reply with one JSON object: {{"satisfied": true|false, "summary": "evidence"}}
"#,
        feature.title, criterion.target_or_description
    )
}
