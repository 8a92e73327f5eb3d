//! Manifest-based detection of language, build tool, and default commands.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::registry::RepositoryConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tooling {
    pub language: Option<String>,
    pub build_tool: Option<String>,
    /// Every recognised manifest present at the repository root.
    #[serde(default)]
    pub manifests: Vec<String>,
    pub test_command: Option<String>,
    pub lint_command: Option<String>,
}

struct Rule {
    manifests: &'static [&'static str],
    language: Option<&'static str>,
    build_tool: fn(&Path) -> &'static str,
    test: fn(&str) -> Option<String>,
    lint: fn(&str) -> Option<String>,
}

fn has(dir: &Path, name: &str) -> bool {
    if name.contains('*') {
        let pattern = dir.join(name);
        glob::glob(&pattern.to_string_lossy())
            .map(|mut paths| paths.any(|p| p.is_ok()))
            .unwrap_or(false)
    } else {
        dir.join(name).exists()
    }
}

fn js_tool(dir: &Path) -> &'static str {
    if dir.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if dir.join("yarn.lock").exists() {
        "yarn"
    } else {
        "npm"
    }
}

fn py_tool(dir: &Path) -> &'static str {
    if dir.join("poetry.lock").exists() {
        "poetry"
    } else if dir.join("uv.lock").exists() {
        "uv"
    } else {
        "pip"
    }
}

fn py_run(tool: &str, cmd: &str) -> String {
    match tool {
        "poetry" => format!("poetry run {cmd}"),
        "uv" => format!("uv run {cmd}"),
        _ => cmd.to_string(),
    }
}

const RULES: &[Rule] = &[
    Rule {
        manifests: &["Cargo.toml"],
        language: Some("rust"),
        build_tool: |_| "cargo",
        test: |_| Some("cargo test".into()),
        lint: |_| Some("cargo clippy -- -D warnings".into()),
    },
    Rule {
        manifests: &["package.json"],
        language: Some("javascript"),
        build_tool: js_tool,
        test: |tool| Some(format!("{tool} test")),
        lint: |tool| Some(format!("{tool} run lint")),
    },
    Rule {
        manifests: &["pyproject.toml", "requirements.txt"],
        language: Some("python"),
        build_tool: py_tool,
        test: |tool| Some(py_run(tool, "pytest")),
        lint: |tool| Some(py_run(tool, "ruff check .")),
    },
    Rule {
        manifests: &["go.mod"],
        language: Some("go"),
        build_tool: |_| "go",
        test: |_| Some("go test ./...".into()),
        lint: |_| Some("go vet ./...".into()),
    },
    Rule {
        manifests: &["pom.xml"],
        language: Some("java"),
        build_tool: |_| "maven",
        test: |_| Some("mvn -q test".into()),
        lint: |_| None,
    },
    Rule {
        manifests: &["build.gradle", "build.gradle.kts"],
        language: Some("java"),
        build_tool: |_| "gradle",
        test: |_| Some("./gradlew test".into()),
        lint: |_| None,
    },
    Rule {
        manifests: &["Gemfile"],
        language: Some("ruby"),
        build_tool: |_| "bundler",
        test: |_| Some("bundle exec rake test".into()),
        lint: |_| Some("bundle exec rubocop".into()),
    },
    Rule {
        manifests: &["*.csproj", "*.sln"],
        language: Some("csharp"),
        build_tool: |_| "dotnet",
        test: |_| Some("dotnet test".into()),
        lint: |_| Some("dotnet format --verify-no-changes".into()),
    },
    Rule {
        manifests: &["composer.json"],
        language: Some("php"),
        build_tool: |_| "composer",
        test: |_| Some("composer test".into()),
        lint: |_| None,
    },
    Rule {
        manifests: &["CMakeLists.txt"],
        language: Some("cpp"),
        build_tool: |_| "cmake",
        test: |_| Some("ctest --test-dir build".into()),
        lint: |_| None,
    },
    Rule {
        manifests: &["Makefile"],
        language: None,
        build_tool: |_| "make",
        test: |_| Some("make test".into()),
        lint: |_| None,
    },
];

/// First matching rule wins; every present manifest is listed.
pub fn detect(dir: &Path) -> Tooling {
    let mut tooling = Tooling::default();
    for rule in RULES {
        let present: Vec<&str> = rule.manifests.iter().copied().filter(|m| has(dir, m)).collect();
        if present.is_empty() {
            continue;
        }
        tooling.manifests.extend(present.iter().map(|m| m.to_string()));
        if tooling.build_tool.is_none() {
            let tool = (rule.build_tool)(dir);
            tooling.language = rule.language.map(str::to_string);
            tooling.build_tool = Some(tool.to_string());
            tooling.test_command = (rule.test)(tool);
            tooling.lint_command = (rule.lint)(tool);
        }
    }
    tooling
}

/// Detection with the repository's registry overrides applied.
pub fn detect_for(dir: &Path, repo: &RepositoryConfig) -> Tooling {
    let mut tooling = detect(dir);
    if repo.test_command.is_some() {
        tooling.test_command = repo.test_command.clone();
    }
    if repo.lint_command.is_some() {
        tooling.lint_command = repo.lint_command.clone();
    }
    tooling
}
