//! One-shot engine commands: `init-db`, `step`, `create`, `stop`, `reset`,
//! `status`. Each prints its result as JSON on stdout.

use anyhow::{Context, Result};
use serde::Serialize;

use billing_automation::automation::Engine;
use billing_automation::automation::models::CreateOrchestrationBody;
use billing_automation::config::{AutomationToml, StoreBackend};

use super::super::CreateArgs;

async fn open_engine(config: &AutomationToml) -> Result<Engine> {
    let engine = Engine::from_config(config)
        .await
        .context("Failed to open automation engine")?;
    engine
        .ensure_defaults()
        .await
        .context("Failed to create default automation documents")?;
    Ok(engine)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn cmd_init_db(config: &AutomationToml) -> Result<()> {
    open_engine(config).await?;
    match config.store.backend {
        StoreBackend::Sqlite => {
            println!("Metadata store initialized at {}", config.store.path.display())
        }
        StoreBackend::Memory => println!("Memory store selected; nothing persisted."),
    }
    Ok(())
}

pub async fn cmd_step(config: &AutomationToml) -> Result<()> {
    let engine = open_engine(config).await?;
    let report = engine
        .manager
        .run_automation()
        .await
        .context("Automation step failed")?;
    print_json(&report)
}

pub async fn cmd_create(config: &AutomationToml, args: &CreateArgs) -> Result<()> {
    let params = CreateOrchestrationBody {
        duration_in_minutes: Some(args.duration_minutes),
        num_of_dummy_users: Some(args.dummy_users),
        min_num_of_kilo_rows_per_hour: Some(args.min_kilo_rows),
        max_num_of_kilo_rows_per_hour: args.max_kilo_rows,
    }
    .validate()?;
    let engine = open_engine(config).await?;
    let run = engine
        .orchestrator
        .create_orchestration(params)
        .await
        .context("Failed to create orchestration")?;
    print_json(&run)
}

pub async fn cmd_stop(config: &AutomationToml) -> Result<()> {
    let engine = open_engine(config).await?;
    let run = engine
        .orchestrator
        .stop_orchestration()
        .await
        .context("Failed to stop orchestration")?;
    print_json(&run)
}

pub async fn cmd_reset(config: &AutomationToml) -> Result<()> {
    let engine = open_engine(config).await?;
    let report = engine
        .orchestrator
        .delete_automation()
        .await
        .context("Failed to tear down automation")?;
    print_json(&report)
}

pub async fn cmd_status(config: &AutomationToml) -> Result<()> {
    let engine = open_engine(config).await?;
    print_json(&engine.status().await?)
}
