//! Slot-level commands: acquire, status, renew, search and release.

use chrono::Utc;
use console::style;
use serde::Serialize;
use serde_json::json;
use shipyard::common::PlanSummary;
use shipyard::errors::Result;
use shipyard::orchestrator::{Orchestrator, allowed_commands};
use shipyard::plan::FeaturePlanManager;
use shipyard::state::StateStore;
use shipyard::workspace::{self, AcquireRequest, SlotStatus};
use std::fmt::Write;
use tracing::info;

use super::super::Cli;
use super::{Reply, data};

pub struct AcquireArgs<'a> {
    pub repos: &'a [String],
    pub task: &'a str,
    pub engine: Option<&'a str>,
    pub environment: Option<&'a str>,
    pub auto_clean: bool,
}

pub async fn cmd_acquire(orchestrator: &Orchestrator, cli: &Cli, args: AcquireArgs<'_>) -> Result<Reply> {
    let config = orchestrator.config();
    let request = AcquireRequest {
        repositories: args.repos.to_vec(),
        task_description: args.task.to_string(),
        engine: args
            .engine
            .map(str::to_string)
            .unwrap_or_else(|| config.default_engine.clone()),
        slot: cli.slot.clone(),
        environment: args.environment.map(str::to_string),
        owner: cli.owner.clone().unwrap_or_else(|| config.owner.clone()),
        auto_clean: args.auto_clean,
    };
    let acquisition = orchestrator.acquire(&request, Utc::now()).await?;
    info!(slot = %acquisition.lease.slot, lease = %acquisition.lease.lease_id, "workspace acquired");
    data(&json!({
        "lease": acquisition.lease,
        "snapshot": acquisition.snapshot,
        "allowed_commands": allowed_commands(acquisition.lease.phase),
    }))
}

#[derive(Serialize)]
struct SlotView {
    #[serde(flatten)]
    status: SlotStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    allowed_commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<PlanSummary>,
}

fn slot_view(orchestrator: &Orchestrator, status: SlotStatus) -> SlotView {
    let allowed = status
        .lease
        .as_ref()
        .map(|l| allowed_commands(l.phase))
        .unwrap_or_default();
    let manager = FeaturePlanManager::new(
        StateStore::new(&status.root),
        orchestrator.config().max_verify_attempts(),
    );
    let plan = if status.lease.is_some() && manager.exists() {
        manager.summary().ok()
    } else {
        None
    };
    SlotView {
        status,
        allowed_commands: allowed,
        plan,
    }
}

pub fn cmd_status(orchestrator: &Orchestrator, slot: Option<&str>, pretty: bool) -> Result<Reply> {
    let views: Vec<SlotView> = workspace::slot_statuses(orchestrator.registry(), slot, Utc::now())?
        .into_iter()
        .map(|s| slot_view(orchestrator, s))
        .collect();
    if pretty {
        return Ok(Reply::Text(render(&views)));
    }
    data(&json!({ "slots": views }))
}

fn render(views: &[SlotView]) -> String {
    let mut out = String::new();
    if views.is_empty() {
        let _ = writeln!(out, "No workspace slots are registered.");
        return out;
    }
    for view in views {
        let s = &view.status;
        let state = match s.state {
            "free" => style(s.state).green(),
            "active" => style(s.state).yellow(),
            _ => style(s.state).red(),
        };
        let _ = writeln!(out, "{} {} ({})", style(&s.slot).bold(), state, s.root.display());
        if let Some(lease) = &s.lease {
            let _ = writeln!(out, "  task:    {}", lease.task_description);
            let _ = writeln!(out, "  phase:   {}", lease.phase);
            let _ = writeln!(out, "  owner:   {}", lease.owner);
            let _ = writeln!(out, "  repos:   {}", lease.repository_names.join(", "));
            let _ = writeln!(out, "  expires: {}", lease.lease_expires_at.to_rfc3339());
        }
        if let Some(plan) = &view.plan {
            let _ = writeln!(
                out,
                "  plan:    {}/{} done, {} in progress, {} failed, {} escalated",
                plan.done, plan.total, plan.in_progress, plan.failed, plan.escalated
            );
        }
        if !view.allowed_commands.is_empty() {
            let _ = writeln!(out, "  next:    {}", view.allowed_commands.join(", "));
        }
        if let Some(detail) = &s.detail {
            let _ = writeln!(out, "  {}", style(detail).dim());
        }
    }
    out
}

pub fn cmd_renew(orchestrator: &Orchestrator, slot: &str, owner: Option<&str>) -> Result<Reply> {
    let lease = orchestrator.renew(slot, owner, Utc::now())?;
    data(&json!({ "lease": lease }))
}

pub fn cmd_search(
    orchestrator: &Orchestrator,
    slot: Option<&str>,
    repository: &str,
    pattern: &str,
    limit: usize,
) -> Result<Reply> {
    let hits = workspace::search(orchestrator.registry(), repository, pattern, slot, limit)?;
    data(&json!({
        "repository": repository,
        "pattern": pattern,
        "truncated": hits.len() >= limit,
        "hits": hits,
    }))
}

pub async fn cmd_release(orchestrator: &Orchestrator, slot: &str, owner: Option<&str>, cleanup: bool) -> Result<Reply> {
    data(&orchestrator.release(slot, owner, cleanup, Utc::now()).await?)
}
