//! Phase commands on a leased slot: probe-env through accept.

use chrono::Utc;
use serde_json::json;
use shipyard::errors::Result;
use shipyard::orchestrator::{Orchestrator, allowed_commands};

use super::super::Commands;
use super::{Reply, data};

pub async fn cmd_phase(orchestrator: &Orchestrator, slot: &str, owner: Option<&str>, command: &Commands) -> Result<Reply> {
    let now = Utc::now();
    match command {
        Commands::ProbeEnv => data(&orchestrator.probe_env(slot, owner, now).await?),
        Commands::Analyze => data(&orchestrator.analyze(slot, owner, now).await?),
        Commands::Confirm => {
            let lease = orchestrator.confirm(slot, owner, now)?;
            data(&json!({
                "allowed_commands": allowed_commands(lease.phase),
                "lease": lease,
            }))
        }
        Commands::Develop { context } => data(&orchestrator.develop(slot, owner, context.as_deref(), now).await?),
        Commands::Test { retry } => data(&orchestrator.test(slot, owner, *retry, now).await?),
        Commands::Submit { force } => data(&orchestrator.submit(slot, owner, *force, now).await?),
        Commands::VerifyEnv => data(&orchestrator.verify_env(slot, owner, now).await?),
        Commands::Accept => {
            let lease = orchestrator.accept(slot, owner, now)?;
            data(&json!({
                "allowed_commands": allowed_commands(lease.phase),
                "lease": lease,
            }))
        }
        other => Err(anyhow::anyhow!("'{}' is not a phase command", other.name()).into()),
    }
}
