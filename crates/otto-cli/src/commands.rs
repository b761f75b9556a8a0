//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use otto_agent::ProcessDispatcher;
use otto_config::OttoConfig;
use otto_scheduler::{AutomationScheduler, AutomationStore, RunRecorder};
use otto_store::{KeyLocks, PersistentStore, SqliteStore};
use otto_types::{Automation, DispatchOptions, MissedRunPolicy, RunStatus};

/// How long `run-now` waits for the dispatched agent to finish.
const RUN_NOW_TIMEOUT: Duration = Duration::from_secs(600);

fn open_store(config: &OttoConfig) -> anyhow::Result<(Arc<dyn PersistentStore>, Arc<KeyLocks>)> {
    otto_config::ensure_config_dir()?;
    let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::open(&config.db_path()?)?);
    Ok((store, Arc::new(KeyLocks::new())))
}

fn build_scheduler(
    config: &OttoConfig,
    store: Arc<dyn PersistentStore>,
    locks: Arc<KeyLocks>,
) -> AutomationScheduler {
    let (status_tx, status_rx) = mpsc::channel(64);
    let dispatcher = Arc::new(ProcessDispatcher::new(config.agent.clone(), status_tx));
    AutomationScheduler::new(
        config.scheduler.clone(),
        AutomationStore::new(store.clone(), locks.clone()),
        RunRecorder::new(store, locks),
        dispatcher,
        status_rx,
    )
}

/// Run the scheduler loop until Ctrl-C.
pub async fn run_start(tick_seconds: Option<u64>) -> anyhow::Result<()> {
    let mut config = otto_config::load_config().unwrap_or_default();
    if let Some(tick) = tick_seconds {
        config.scheduler.tick_seconds = tick;
    }
    let (store, locks) = open_store(&config)?;
    let scheduler = build_scheduler(&config, store, locks);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    scheduler.run(cancel).await;
    Ok(())
}

/// Validate and persist a new automation.
pub async fn run_add(
    name: String,
    schedule: String,
    prompt: String,
    options: DispatchOptions,
    policy: &str,
    disabled: bool,
) -> anyhow::Result<()> {
    otto_cron::validate(&schedule).map_err(|e| anyhow::anyhow!("invalid schedule: {e}"))?;
    let missed_run_policy = parse_policy(policy)?;

    let config = otto_config::load_config().unwrap_or_default();
    let (store, locks) = open_store(&config)?;
    let automations = AutomationStore::new(store, locks);

    let automation = Automation {
        id: Uuid::new_v4().to_string(),
        name,
        schedule,
        prompt,
        options,
        enabled: !disabled,
        missed_run_policy,
        created_at: Utc::now(),
        last_run_at: None,
    };
    let id = automation.id.clone();
    let name = automation.name.clone();
    automations.insert(automation).await?;
    println!("Created automation {name} ({id})");
    Ok(())
}

/// Print every automation with its schedule and state.
pub async fn run_list() -> anyhow::Result<()> {
    let config = otto_config::load_config().unwrap_or_default();
    let (store, locks) = open_store(&config)?;
    let automations = AutomationStore::new(store, locks);

    let list = automations.list().await?;
    if list.is_empty() {
        println!("No automations configured");
        return Ok(());
    }
    for automation in list {
        let state = if automation.enabled { "enabled" } else { "disabled" };
        println!("{} [{state}] {}", automation.id, automation.name);
        println!("  schedule: {}", automation.schedule);
        println!("  policy: {}", policy_label(automation.missed_run_policy));
        let last_run = automation
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        println!("  last run: {last_run}");
    }
    Ok(())
}

/// Delete an automation and its run history.
pub async fn run_remove(id: &str) -> anyhow::Result<()> {
    let config = otto_config::load_config().unwrap_or_default();
    let (store, locks) = open_store(&config)?;
    let automations = AutomationStore::new(store, locks);

    if !automations.remove(id).await? {
        anyhow::bail!("no automation with id {id}");
    }
    println!("Removed automation {id}");
    Ok(())
}

/// Flip an automation's enabled flag.
pub async fn run_set_enabled(id: &str, enabled: bool) -> anyhow::Result<()> {
    let config = otto_config::load_config().unwrap_or_default();
    let (store, locks) = open_store(&config)?;
    let automations = AutomationStore::new(store, locks);

    if !automations.set_enabled(id, enabled).await? {
        anyhow::bail!("no automation with id {id}");
    }
    println!(
        "Automation {id} {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Fire one automation immediately and report how the run went.
pub async fn run_now(id: &str) -> anyhow::Result<()> {
    let config = otto_config::load_config().unwrap_or_default();
    let (store, locks) = open_store(&config)?;
    let mut scheduler = build_scheduler(&config, store.clone(), locks.clone());

    let agent_id = scheduler.run_now(id).await?;
    println!("Dispatched agent {agent_id}");

    if !scheduler.await_completion(&agent_id, RUN_NOW_TIMEOUT).await? {
        println!("Run still in progress");
        return Ok(());
    }
    let recorder = RunRecorder::new(store, locks);
    let record = recorder
        .history(id)
        .await?
        .into_iter()
        .find(|r| r.agent_id == agent_id);
    match record {
        Some(record) => match record.status {
            RunStatus::Completed => {
                println!(
                    "Completed: {}",
                    record.summary.as_deref().unwrap_or("(no summary)")
                );
            }
            RunStatus::Failed => {
                let exit = record
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".into());
                anyhow::bail!("run failed (exit code {exit})");
            }
            RunStatus::Running => println!("Run still in progress"),
        },
        None => println!("Run record no longer in history"),
    }
    Ok(())
}

/// Print an automation's run history, newest first.
pub async fn run_runs(id: &str, limit: usize) -> anyhow::Result<()> {
    let config = otto_config::load_config().unwrap_or_default();
    let (store, locks) = open_store(&config)?;
    let automations = AutomationStore::new(store.clone(), locks.clone());
    if automations.get(id).await?.is_none() {
        anyhow::bail!("no automation with id {id}");
    }

    let recorder = RunRecorder::new(store, locks);
    let history = recorder.history(id).await?;
    if history.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for record in history.iter().take(limit) {
        let status = match record.status {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        println!(
            "{} [{status}] agent {}",
            record.started_at.to_rfc3339(),
            record.agent_id
        );
        if let Some(summary) = &record.summary {
            println!("  {summary}");
        }
    }
    Ok(())
}

/// Check an expression against the schedule grammar.
pub fn run_validate(expression: &str) -> anyhow::Result<()> {
    match otto_cron::validate(expression) {
        Ok(()) => {
            println!("OK: `{expression}` is a valid schedule");
            Ok(())
        }
        Err(e) => anyhow::bail!("invalid schedule: {e}"),
    }
}

fn parse_policy(raw: &str) -> anyhow::Result<MissedRunPolicy> {
    match raw {
        "ignore" => Ok(MissedRunPolicy::Ignore),
        "run-once" => Ok(MissedRunPolicy::RunOnce),
        "run-all" => Ok(MissedRunPolicy::RunAll),
        other => anyhow::bail!(
            "unknown missed-run policy `{other}` (expected ignore, run-once, or run-all)"
        ),
    }
}

fn policy_label(policy: MissedRunPolicy) -> &'static str {
    match policy {
        MissedRunPolicy::Ignore => "ignore",
        MissedRunPolicy::RunOnce => "run-once",
        MissedRunPolicy::RunAll => "run-all",
    }
}
