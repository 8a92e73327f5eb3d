//! End-to-end orchestration scenarios against in-memory collaborators.
//!
//! Real files are used for the registry, lease and artifacts; git, checks,
//! the environment and the engine are fakes that count their calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shipyard::checks::{CheckKind, CheckOutcome, CheckRunner};
use shipyard::common::{Complexity, CriterionKind, CriterionSpec, FeatureSpec, FeatureStatus, Phase};
use shipyard::config::Config;
use shipyard::engine::{CodeEngine, EngineFactory, EngineRequest, EngineResponse, EngineTask};
use shipyard::common::LeaseParams;
use shipyard::envprobe::{EnvironmentProbe, Observation};
use shipyard::errors::{Result, ShipyardError};
use shipyard::lease::LeaseLock;
use shipyard::orchestrator::{Collaborators, Orchestrator};
use shipyard::registry::{EntryKind, EnvironmentConfig, Registry};
use shipyard::vcs::{PullRequestSpec, RepoStatus, VersionControl};
use shipyard::workspace::AcquireRequest;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeVcs {
    pushed: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    prs: AtomicUsize,
    /// Scripted `commit_all` results; a fresh commit once exhausted.
    commits: Mutex<VecDeque<Option<String>>>,
    fail_next_pr: AtomicBool,
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(&self, _url: &str, dest: &Path, _branch: &str) -> Result<()> {
        std::fs::create_dir_all(dest.join(".git")).map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn sync(&self, _path: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _path: &Path) -> Result<RepoStatus> {
        Ok(RepoStatus {
            current_branch: Some("main".to_string()),
            ..RepoStatus::default()
        })
    }

    async fn hard_reset(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn create_branch(&self, _path: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn checkout(&self, _path: &Path, _branch: &str, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn delete_branch(&self, _path: &Path, branch: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn commit_all(&self, _path: &Path, _message: &str) -> Result<Option<String>> {
        match self.commits.lock().unwrap().pop_front() {
            Some(scripted) => Ok(scripted),
            None => Ok(Some("abc1234".to_string())),
        }
    }

    async fn push(&self, _path: &Path, branch: &str) -> Result<()> {
        self.pushed.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn delete_remote_branch(&self, _path: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn create_pull_request(&self, _path: &Path, _pr: &PullRequestSpec<'_>) -> Result<String> {
        if self.fail_next_pr.swap(false, Ordering::SeqCst) {
            return Err(ShipyardError::vcs("api", "gh: HTTP 502"));
        }
        let n = self.prs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("https://example.test/pr/{n}"))
    }
}

/// Passes every check unless `failing` is set.
#[derive(Default)]
struct FakeChecks {
    failing: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl CheckRunner for FakeChecks {
    async fn run(&self, _dir: &Path, command: &str, kind: CheckKind, _target: Option<&str>) -> Result<CheckOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let passed = !self.failing.load(Ordering::SeqCst);
        let output = if passed { "3 passed" } else { "1 failed, 2 passed" };
        Ok(CheckOutcome::new(
            kind,
            command,
            passed,
            Some(if passed { 0 } else { 1 }),
            output.to_string(),
        ))
    }
}

struct FakeProbe {
    output: Mutex<String>,
}

#[async_trait]
impl EnvironmentProbe for FakeProbe {
    async fn observe(&self, _env: &EnvironmentConfig, command: &str) -> Result<Observation> {
        Ok(Observation {
            command: command.to_string(),
            success: true,
            exit_code: Some(0),
            output: self.output.lock().unwrap().clone(),
        })
    }
}

struct FakeEngine {
    complexity: Mutex<Option<Complexity>>,
    features: Mutex<Vec<FeatureSpec>>,
    satisfied: AtomicBool,
    calls: Mutex<Vec<EngineTask>>,
    /// When set, a develop call hands the slot at this root to another caller.
    reclaim_during_develop: Mutex<Option<PathBuf>>,
}

impl FakeEngine {
    fn calls_for(&self, task: EngineTask) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| **t == task).count()
    }
}

#[async_trait]
impl CodeEngine for FakeEngine {
    fn id(&self) -> &str {
        "fake"
    }

    async fn run(&self, request: &EngineRequest) -> Result<EngineResponse> {
        self.calls.lock().unwrap().push(request.purpose);
        if request.purpose == EngineTask::Develop
            && let Some(root) = self.reclaim_during_develop.lock().unwrap().take()
        {
            // Long enough later that the running command's lease has lapsed.
            let later = Utc::now() + Duration::hours(3);
            let params = LeaseParams {
                slot: "env0".to_string(),
                task_description: "second task".to_string(),
                repository_names: vec!["api".to_string()],
                engine_id: "fake".to_string(),
                associated_environment: None,
                owner: "bob".to_string(),
            };
            LeaseLock::new("env0", &root).acquire(params, later, Duration::hours(2))?;
        }
        Ok(match request.purpose {
            EngineTask::Analyze => EngineResponse {
                summary: "analysed".to_string(),
                complexity: *self.complexity.lock().unwrap(),
                features: self.features.lock().unwrap().clone(),
                ..EngineResponse::default()
            },
            EngineTask::Develop | EngineTask::Fix => EngineResponse {
                summary: format!("{} done", request.purpose),
                changed_files: vec!["src/lib.rs".to_string()],
                ..EngineResponse::default()
            },
            EngineTask::Assert => EngineResponse {
                summary: "checked".to_string(),
                satisfied: Some(self.satisfied.load(Ordering::SeqCst)),
                ..EngineResponse::default()
            },
        })
    }
}

struct FakeEngines(Arc<FakeEngine>);

impl EngineFactory for FakeEngines {
    fn engine(&self, _key: &str) -> Result<Arc<dyn CodeEngine>> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    _home: TempDir,
    slots: Vec<PathBuf>,
    orchestrator: Orchestrator,
    vcs: Arc<FakeVcs>,
    checks: Arc<FakeChecks>,
    probe: Arc<FakeProbe>,
    engine: Arc<FakeEngine>,
}

fn harness(slot_count: usize) -> Harness {
    let home = TempDir::new().unwrap();
    let config = Config::load(Some(home.path().to_path_buf())).unwrap();

    let mut registry = Registry::load(&config.registry_file).unwrap();
    registry
        .add(EntryKind::Repository, "api", "https://example.test/api.git")
        .unwrap();
    registry
        .set_field(EntryKind::Repository, "api", "test_command", "make test")
        .unwrap();
    registry
        .add(EntryKind::Environment, "staging", "deploy@staging.test")
        .unwrap();
    let mut slots = Vec::new();
    for i in 0..slot_count {
        let root = home.path().join(format!("slots/env{i}"));
        registry
            .add(EntryKind::Workspace, &format!("env{i}"), &root.display().to_string())
            .unwrap();
        slots.push(root);
    }

    let vcs = Arc::new(FakeVcs::default());
    let checks = Arc::new(FakeChecks::default());
    let probe = Arc::new(FakeProbe {
        output: Mutex::new("load average: 0.10".to_string()),
    });
    let engine = Arc::new(FakeEngine {
        complexity: Mutex::new(Some(Complexity::Trivial)),
        features: Mutex::new(Vec::new()),
        satisfied: AtomicBool::new(true),
        calls: Mutex::new(Vec::new()),
        reclaim_during_develop: Mutex::new(None),
    });
    let collab = Collaborators {
        vcs: vcs.clone(),
        checks: checks.clone(),
        probe: probe.clone(),
        engines: Arc::new(FakeEngines(engine.clone())),
    };

    Harness {
        orchestrator: Orchestrator::new(config, registry, collab),
        _home: home,
        slots,
        vcs,
        checks,
        probe,
        engine,
    }
}

fn request(task: &str) -> AcquireRequest {
    AcquireRequest {
        repositories: vec!["api".to_string()],
        task_description: task.to_string(),
        engine: "fake".to_string(),
        environment: Some("staging".to_string()),
        owner: "alice".to_string(),
        ..AcquireRequest::default()
    }
}

fn two_feature_plan() -> Vec<FeatureSpec> {
    vec![
        FeatureSpec {
            title: "Schema".to_string(),
            task: "Add the orders table".to_string(),
            depends_on: vec![],
            criteria: vec![CriterionSpec {
                id: None,
                kind: CriterionKind::Test,
                target: "tests/schema".to_string(),
                auto: None,
            }],
        },
        FeatureSpec {
            title: "Endpoint".to_string(),
            task: "Expose GET /orders".to_string(),
            depends_on: vec![0],
            criteria: vec![CriterionSpec {
                id: Some("handler".to_string()),
                kind: CriterionKind::Assert,
                target: "an orders handler is routed".to_string(),
                auto: None,
            }],
        },
    ]
}

fn make_complex(h: &Harness) {
    *h.engine.complexity.lock().unwrap() = Some(Complexity::Complex);
    *h.engine.features.lock().unwrap() = two_feature_plan();
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_trivial_task_full_lifecycle() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;

    let acquired = orch.acquire(&request("Fix typo in README"), now).await.unwrap();
    assert_eq!(acquired.lease.slot, "env0");
    assert_eq!(acquired.lease.phase, Phase::WorkspaceCheck);
    assert!(h.slots[0].join(".lock").exists());
    assert!(acquired.snapshot.repositories[0].freshly_cloned);

    let probe = orch.probe_env("env0", Some("alice"), now).await.unwrap();
    assert!(probe.errors.is_clean());

    let analysis = orch.analyze("env0", Some("alice"), now).await.unwrap();
    assert_eq!(analysis.phase, Phase::Confirmed);
    assert!(!analysis.awaiting_confirmation);

    let developed = orch.develop("env0", None, None, now).await.unwrap();
    assert!(developed.test.passed);
    assert_eq!(h.checks.calls.load(Ordering::SeqCst), 1);

    let submitted = orch.submit("env0", None, false, now).await.unwrap();
    assert_eq!(submitted.repositories.len(), 1);
    let pr = submitted.repositories[0].pull_request.clone().unwrap();
    assert_eq!(pr, "https://example.test/pr/1");
    assert!(!submitted.remaining_work);
    assert_eq!(h.vcs.pushed.lock().unwrap().len(), 1);

    let verified = orch.verify_env("env0", None, now).await.unwrap();
    assert!(verified.report.passed);
    assert_eq!(verified.phase, Phase::EnvVerified);

    let lease = orch.lease("env0", None, now).unwrap();
    let phases: Vec<Phase> = lease.phase_history.iter().map(|r| r.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::WorkspaceCheck,
            Phase::EnvProbe,
            Phase::Analyzing,
            Phase::Confirmed,
            Phase::Developing,
            Phase::Testing,
            Phase::Submitted,
            Phase::EnvVerified,
        ]
    );
    assert!(lease.history_is_monotonic());

    let released = orch.release("env0", None, true, now).await.unwrap();
    assert_eq!(released.lease.phase, Phase::Released);
    assert!(released.cleanup_errors.is_empty());
    assert!(!h.slots[0].join(".lock").exists());
    assert!(!h.slots[0].join(".state").exists());
    assert!(h.vcs.deleted.lock().unwrap().iter().any(|b| b.starts_with("shipyard/")));
}

#[tokio::test]
async fn test_failed_env_verification_offers_options() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("Tune cache"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();
    orch.develop("env0", None, None, now).await.unwrap();
    orch.submit("env0", None, false, now).await.unwrap();

    *h.probe.output.lock().unwrap() = "ERROR: connection refused".to_string();
    let verified = orch.verify_env("env0", None, now).await.unwrap();
    assert!(!verified.report.passed);
    assert_eq!(verified.phase, Phase::Submitted);
    assert!(verified.options.contains(&"accept".to_string()));

    // A failed verification reopens development on the same branch.
    *h.probe.output.lock().unwrap() = "all quiet".to_string();
    orch.develop("env0", None, Some("the cache port is wrong"), now).await.unwrap();
    let resubmitted = orch.submit("env0", None, false, now).await.unwrap();
    // The pull request from the first round is reused.
    assert_eq!(
        resubmitted.repositories[0].pull_request.as_deref(),
        Some("https://example.test/pr/1")
    );
    assert_eq!(h.vcs.prs.load(Ordering::SeqCst), 1);

    // Leaving submitted for another round is a loop-back.
    let lease = orch.lease("env0", None, now).unwrap();
    assert_eq!(lease.round, 1);
    assert!(lease.history_is_monotonic());
}

#[tokio::test]
async fn test_submit_retry_opens_pull_request_after_failure() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("Add health check"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();
    orch.develop("env0", None, None, now).await.unwrap();

    // The commit and push land, then the pull request call fails. The retry
    // finds nothing new to commit.
    h.vcs
        .commits
        .lock()
        .unwrap()
        .extend([Some("abc1234".to_string()), None]);
    h.vcs.fail_next_pr.store(true, Ordering::SeqCst);
    let err = orch.submit("env0", None, false, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::Vcs { .. }));

    let lease = orch.lease("env0", None, now).unwrap();
    assert_eq!(lease.phase, Phase::Testing);
    assert!(lease.pushed_to_remote);
    assert!(lease.pending_pull_requests.contains_key("api"));

    let submitted = orch.submit("env0", None, false, now).await.unwrap();
    assert_eq!(submitted.repositories[0].commit, None);
    assert_eq!(
        submitted.repositories[0].pull_request.as_deref(),
        Some("https://example.test/pr/1")
    );
    assert_eq!(h.vcs.prs.load(Ordering::SeqCst), 1);

    let lease = orch.lease("env0", None, now).unwrap();
    assert_eq!(lease.phase, Phase::Submitted);
    assert!(lease.pending_pull_requests.is_empty());
    assert_eq!(
        lease.pull_requests.get("api").map(String::as_str),
        Some("https://example.test/pr/1")
    );
}

#[tokio::test]
async fn test_develop_never_overwrites_a_reclaimed_slot() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("first task"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();

    *h.engine.reclaim_during_develop.lock().unwrap() = Some(h.slots[0].clone());
    let err = orch.develop("env0", None, None, now).await.unwrap_err();
    match err {
        ShipyardError::WorkspaceLocked { holder } => assert_eq!(holder.task_description, "second task"),
        other => panic!("expected WorkspaceLocked, got {other:?}"),
    }
    // No check ran for the task that lost its lease.
    assert_eq!(h.checks.calls.load(Ordering::SeqCst), 0);

    let later = Utc::now() + Duration::hours(3);
    let lease = LeaseLock::new("env0", &h.slots[0]).load_active(later).unwrap();
    assert_eq!(lease.task_description, "second task");
    assert_eq!(lease.owner, "bob");
    assert_eq!(lease.phase, Phase::WorkspaceCheck);
}

#[tokio::test]
async fn test_accept_after_failed_verification() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("Bump timeout"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();
    orch.develop("env0", None, None, now).await.unwrap();
    orch.submit("env0", None, false, now).await.unwrap();

    // Nothing failed yet, so there is nothing to accept.
    let err = orch.accept("env0", None, now).unwrap_err();
    assert!(matches!(err, ShipyardError::InvalidTransition { .. }));

    *h.probe.output.lock().unwrap() = "panic: nil map".to_string();
    orch.verify_env("env0", None, now).await.unwrap();
    let lease = orch.accept("env0", None, now).unwrap();
    assert_eq!(lease.phase, Phase::EnvVerified);
}

#[tokio::test]
async fn test_standard_task_waits_for_confirmation() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    *h.engine.complexity.lock().unwrap() = None;
    orch.acquire(&request("Add pagination"), now).await.unwrap();

    let analysis = orch.analyze("env0", None, now).await.unwrap();
    assert_eq!(analysis.report.complexity, Complexity::Standard);
    assert_eq!(analysis.phase, Phase::Analyzing);
    assert!(analysis.awaiting_confirmation);

    let err = orch.develop("env0", None, None, now).await.unwrap_err();
    assert!(matches!(
        err,
        ShipyardError::InvalidTransition {
            phase: Phase::Analyzing,
            ..
        }
    ));
    // A rejected command leaves the phase alone.
    assert_eq!(orch.lease("env0", None, now).unwrap().phase, Phase::Analyzing);

    let lease = orch.confirm("env0", None, now).unwrap();
    assert_eq!(lease.phase, Phase::Confirmed);
    assert!(!lease.awaiting_confirmation);

    let err = orch.confirm("env0", None, now).unwrap_err();
    assert!(matches!(err, ShipyardError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_complex_task_runs_feature_by_feature() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    make_complex(&h);
    orch.acquire(&request("Orders service"), now).await.unwrap();

    let analysis = orch.analyze("env0", None, now).await.unwrap();
    assert_eq!(analysis.report.complexity, Complexity::Complex);
    assert!(analysis.awaiting_confirmation);
    assert_eq!(analysis.plan.as_ref().map(|p| p.total), Some(2));
    orch.confirm("env0", None, now).unwrap();

    // Round 1: feature 0.
    let first = orch.develop("env0", None, None, now).await.unwrap();
    assert_eq!(first.develop.feature, Some(0));
    let branch = first.develop.branches.get("api").cloned().unwrap();
    assert!(branch.contains("/f0-schema"), "unexpected branch {branch}");

    let submitted = orch.submit("env0", None, false, now).await.unwrap();
    let done = submitted.feature.unwrap();
    assert_eq!(done.index, 0);
    assert_eq!(done.status, FeatureStatus::Done);
    assert!(!done.forced);
    assert_eq!(done.pr_reference.as_deref(), Some("https://example.test/pr/1"));
    assert!(submitted.remaining_work);

    // Round 2: feature 1 becomes runnable once 0 is done.
    let second = orch.develop("env0", None, None, now).await.unwrap();
    assert_eq!(second.develop.feature, Some(1));
    let submitted = orch.submit("env0", None, false, now).await.unwrap();
    assert_eq!(submitted.feature.map(|f| f.index), Some(1));
    assert!(!submitted.remaining_work);
    assert_eq!(h.engine.calls_for(EngineTask::Assert), 1);

    let view = orch.feature_list("env0", None, now).unwrap();
    assert!(view.summary.all_settled());
    assert_eq!(view.summary.done, 2);

    // Nothing left and the environment was never found broken.
    let err = orch.develop("env0", None, None, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_complex_without_features_is_engine_error() {
    let h = harness(1);
    let now = Utc::now();
    *h.engine.complexity.lock().unwrap() = Some(Complexity::Complex);
    h.orchestrator.acquire(&request("Big rewrite"), now).await.unwrap();

    let err = h.orchestrator.analyze("env0", None, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::EngineError { .. }));
    let lease = h.orchestrator.lease("env0", None, now).unwrap();
    assert_eq!(lease.phase, Phase::WorkspaceCheck);
}

#[tokio::test]
async fn test_unmet_criteria_block_submit_until_forced() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    make_complex(&h);
    h.engine.satisfied.store(false, Ordering::SeqCst);
    orch.acquire(&request("Orders service"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();
    orch.confirm("env0", None, now).unwrap();

    // Dependencies gate completion unless forced.
    let err = orch.feature_done("env0", None, 1, None, None, false, now).unwrap_err();
    assert!(matches!(err, ShipyardError::InvalidInput(_)));

    orch.develop("env0", None, None, now).await.unwrap();
    orch.submit("env0", None, false, now).await.unwrap();
    orch.develop("env0", None, None, now).await.unwrap();

    let err = orch.submit("env0", None, false, now).await.unwrap_err();
    match err {
        ShipyardError::CriteriaNotMet { index, unmet } => {
            assert_eq!(index, 1);
            assert_eq!(unmet, vec!["handler".to_string()]);
        }
        other => panic!("expected CriteriaNotMet, got {other:?}"),
    }
    assert_eq!(orch.lease("env0", None, now).unwrap().phase, Phase::Testing);

    let submitted = orch.submit("env0", None, true, now).await.unwrap();
    let feature = submitted.feature.unwrap();
    assert_eq!(feature.status, FeatureStatus::Done);
    assert!(feature.forced);
}

#[tokio::test]
async fn test_feature_verify_escalates_after_max_attempts() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("Orders service"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();

    let mut plan = two_feature_plan();
    plan[0].criteria = vec![CriterionSpec {
        id: None,
        kind: CriterionKind::Assert,
        target: "migrations are reversible".to_string(),
        auto: None,
    }];
    orch.feature_create("env0", None, &plan, now).unwrap();
    assert!(orch.lease("env0", None, now).unwrap().complexity == Some(Complexity::Complex));
    h.engine.satisfied.store(false, Ordering::SeqCst);

    let result = orch.feature_verify("env0", None, 0, true, now).await.unwrap();
    assert!(!result.outcome.all_auto_passed);
    assert!(result.outcome.needs_escalation);
    // Default ceiling is 3 failed attempts; the fourth flags it.
    assert_eq!(result.outcome.attempts, 4);
    assert_eq!(result.fix_rounds, 3);
    assert_eq!(h.engine.calls_for(EngineTask::Fix), 3);

    // Escalation never fails the feature on its own.
    let view = orch.feature_list("env0", None, now).unwrap();
    assert_eq!(view.plan.features[0].status, FeatureStatus::Pending);
}

#[tokio::test]
async fn test_auto_fix_exhaustion_requires_decision() {
    let h = harness(1);
    let now = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("Fix flaky test"), now).await.unwrap();
    orch.analyze("env0", None, now).await.unwrap();
    h.checks.failing.store(true, Ordering::SeqCst);

    let err = orch.develop("env0", None, None, now).await.unwrap_err();
    match err {
        ShipyardError::TestFailed {
            fix_rounds,
            lint_only,
            decision_required,
            failing_repositories,
        } => {
            assert_eq!(fix_rounds, 2);
            assert!(!lint_only);
            assert!(decision_required);
            assert_eq!(failing_repositories, vec!["api".to_string()]);
        }
        other => panic!("expected TestFailed, got {other:?}"),
    }
    // One run plus two fix-and-retest rounds.
    assert_eq!(h.checks.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.engine.calls_for(EngineTask::Fix), 2);

    let lease = orch.lease("env0", None, now).unwrap();
    assert_eq!(lease.phase, Phase::Testing);
    assert_eq!(lease.test_fix_rounds, 2);

    // Red reports cannot be submitted.
    let err = orch.submit("env0", None, false, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::TestFailed { .. }));

    // Without a retry the budget stays spent.
    let err = orch.test("env0", None, false, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::TestFailed { fix_rounds: 2, .. }));
    assert_eq!(h.engine.calls_for(EngineTask::Fix), 2);

    h.checks.failing.store(false, Ordering::SeqCst);
    let report = orch.test("env0", None, true, now).await.unwrap();
    assert!(report.passed);
    assert_eq!(report.fix_rounds, 0);
    orch.submit("env0", None, false, now).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    let h = Arc::new(harness(1));
    let now = Utc::now();

    let mut handles = Vec::new();
    for i in 0..4 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            let req = AcquireRequest {
                slot: Some("env0".to_string()),
                ..request(&format!("task {i}"))
            };
            h.orchestrator.acquire(&req, now).await
        }));
    }
    let mut winners = 0;
    let mut locked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(ShipyardError::WorkspaceLocked { .. }) => locked += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(locked, 3);
}

#[tokio::test]
async fn test_scan_reports_every_holder() {
    let h = harness(1);
    let now = Utc::now();
    h.orchestrator.acquire(&request("first"), now).await.unwrap();
    let err = h.orchestrator.acquire(&request("second"), now).await.unwrap_err();
    match err {
        ShipyardError::AllSlotsLocked { holders } => {
            assert_eq!(holders.len(), 1);
            assert_eq!(holders[0].owner.as_deref(), Some("alice"));
        }
        other => panic!("expected AllSlotsLocked, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_task_takes_next_free_slot() {
    let h = harness(2);
    let now = Utc::now();
    let first = h.orchestrator.acquire(&request("one"), now).await.unwrap();
    let second = h.orchestrator.acquire(&request("two"), now).await.unwrap();
    assert_eq!(first.lease.slot, "env0");
    assert_eq!(second.lease.slot, "env1");

    let err = h.orchestrator.acquire(&request("three"), now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::AllSlotsLocked { ref holders } if holders.len() == 2));
}

#[tokio::test]
async fn test_stale_lease_is_reclaimed() {
    let h = harness(1);
    let start: DateTime<Utc> = Utc::now();
    let orch = &h.orchestrator;
    orch.acquire(&request("abandoned"), start).await.unwrap();
    orch.analyze("env0", None, start).await.unwrap();

    let later = start + Duration::hours(3);
    let err = orch.develop("env0", None, None, later).await.unwrap_err();
    assert!(matches!(err, ShipyardError::LeaseExpired { .. }));

    let old = orch.lease("env0", None, start).unwrap();
    let fresh = orch.acquire(&request("new work"), later).await.unwrap();
    assert_ne!(fresh.lease.lease_id, old.lease_id);
    assert!(fresh.lease.started_at > old.updated_at);
    assert_eq!(fresh.lease.task_description, "new work");
    assert_eq!(fresh.lease.phase, Phase::WorkspaceCheck);
    // The abandoned task's analysis went with it.
    assert!(!h.slots[0].join(".state/phase2_analysis").exists());
    assert!(!fresh.snapshot.repositories[0].freshly_cloned);
}

#[tokio::test]
async fn test_renew_extends_a_live_lease() {
    let h = harness(1);
    let start = Utc::now();
    let acquired = h.orchestrator.acquire(&request("long task"), start).await.unwrap();

    let later = start + Duration::minutes(90);
    let renewed = h.orchestrator.renew("env0", Some("alice"), later).unwrap();
    assert!(renewed.lease_expires_at > acquired.lease.lease_expires_at);
    assert_eq!(renewed.phase_history.len(), 1);

    let err = h.orchestrator.renew("env0", Some("mallory"), later).unwrap_err();
    assert!(matches!(err, ShipyardError::WorkspaceLocked { .. }));
}

#[tokio::test]
async fn test_release_is_not_repeatable() {
    let h = harness(1);
    let now = Utc::now();
    h.orchestrator.acquire(&request("short"), now).await.unwrap();

    h.orchestrator.release("env0", None, false, now).await.unwrap();
    let err = h.orchestrator.release("env0", None, false, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::NoActiveLease { .. }));

    let err = h.orchestrator.analyze("env0", None, now).await.unwrap_err();
    assert!(matches!(err, ShipyardError::NoActiveLease { .. }));

    // The slot is immediately reusable.
    h.orchestrator.acquire(&request("next"), now).await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_can_still_be_released() {
    let h = harness(1);
    let start = Utc::now();
    h.orchestrator.acquire(&request("forgotten"), start).await.unwrap();

    let later = start + Duration::hours(5);
    let released = h.orchestrator.release("env0", None, false, later).await.unwrap();
    assert_eq!(released.lease.phase, Phase::Released);
    assert!(!h.slots[0].join(".lock").exists());
}
