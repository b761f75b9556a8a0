//! The scheduler tick loop, fire sequence, and completion handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use otto_config::SchedulerConfig;
use otto_cron::{count_missed_fires, matches};
use otto_types::{Automation, DedupPrecision, MissedRunPolicy, RunRecord, RunStatus, StatusChange};

use crate::automations::AutomationStore;
use crate::dispatch::AgentDispatcher;
use crate::recorder::{RunOutcome, RunRecorder};
use crate::{Result, SchedulerError};

/// Hard cap on catch-up fires per automation per tick.
pub const CATCHUP_FIRE_CAP: u32 = 10;

/// The automation scheduler.
///
/// Owns the in-flight agent-to-automation correlation table and the
/// refresh broadcaster; neither survives a restart. Terminal status
/// changes arriving for agents dispatched before a restart are
/// ignored, and their records stay running.
pub struct AutomationScheduler {
    config: SchedulerConfig,
    automations: AutomationStore,
    recorder: RunRecorder,
    dispatcher: Arc<dyn AgentDispatcher>,
    status_rx: mpsc::Receiver<StatusChange>,
    /// In-flight agent ID to owning automation ID.
    pending: HashMap<String, String>,
    refresh_tx: broadcast::Sender<()>,
}

impl AutomationScheduler {
    pub fn new(
        config: SchedulerConfig,
        automations: AutomationStore,
        recorder: RunRecorder,
        dispatcher: Arc<dyn AgentDispatcher>,
        status_rx: mpsc::Receiver<StatusChange>,
    ) -> Self {
        let (refresh_tx, _) = broadcast::channel(16);
        Self {
            config,
            automations,
            recorder,
            dispatcher,
            status_rx,
            pending: HashMap::new(),
            refresh_tx,
        }
    }

    /// Subscribe to refresh notifications, sent after every fire and
    /// every finalized completion.
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<()> {
        self.refresh_tx.subscribe()
    }

    /// Run until cancelled: evaluate on a fixed interval, consume
    /// dispatcher status changes as they arrive.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Automation scheduler started (tick every {}s)", self.config.tick_seconds);
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_seconds.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!("Tick aborted: {e}");
                    }
                }
                Some(change) = self.status_rx.recv() => {
                    if let Err(e) = self.handle_status_change(change, Utc::now()).await {
                        warn!("Completion handling failed: {e}");
                    }
                }
            }
        }
        info!("Automation scheduler stopped");
    }

    /// One due-ness evaluation pass over every enabled automation.
    ///
    /// A failed list read aborts the whole pass; per-automation failures
    /// are logged and do not stop the remaining evaluations.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let automations = self.automations.list().await?;
        for automation in automations.iter().filter(|a| a.enabled) {
            self.evaluate(automation, now).await;
        }
        Ok(())
    }

    /// Decide and perform this tick's fires for one automation.
    async fn evaluate(&mut self, automation: &Automation, now: DateTime<Utc>) {
        // Catch-up consumes the tick for this automation: the missed
        // count already includes the current minute when it matches.
        if automation.missed_run_policy != MissedRunPolicy::Ignore
            && let Some(last_run) = automation.last_run_at
        {
            let missed = count_missed_fires(&automation.schedule, &last_run, &now);
            if missed > 0 {
                let attempts = match automation.missed_run_policy {
                    MissedRunPolicy::RunOnce => 1,
                    _ => missed.min(CATCHUP_FIRE_CAP),
                };
                info!(
                    automation = %automation.id,
                    "Catching up {missed} missed fires with {attempts} runs"
                );
                for _ in 0..attempts {
                    if let Err(e) = self.fire(automation, now).await {
                        warn!("Catch-up run for automation {} failed: {e}", automation.id);
                    }
                }
                return;
            }
        }

        if matches(&automation.schedule, &now) && !self.fired_this_minute(automation, now) {
            if let Err(e) = self.fire(automation, now).await {
                warn!("Scheduled run for automation {} failed: {e}", automation.id);
            }
        }
    }

    /// Same-minute duplicate-fire guard. The tick period does not align
    /// to minute boundaries, so two ticks can land in one matching
    /// minute; last_run_at is the marker that the first one fired.
    fn fired_this_minute(&self, automation: &Automation, now: DateTime<Utc>) -> bool {
        let Some(last) = automation.last_run_at else {
            return false;
        };
        match self.config.dedup {
            DedupPrecision::CalendarMinute => {
                last.minute() == now.minute()
                    && last.hour() == now.hour()
                    && last.day() == now.day()
                    && last.month() == now.month()
                    && last.year() == now.year()
            }
            DedupPrecision::EpochMinute => last.timestamp() / 60 == now.timestamp() / 60,
        }
    }

    /// Dispatch one agent run and record it: running record prepended
    /// to the history, last_run_at advanced, agent ID registered as
    /// pending. The two store writes are separate documents; a crash
    /// between them strands one side.
    async fn fire(&mut self, automation: &Automation, now: DateTime<Utc>) -> Result<String> {
        let agent_id = self
            .dispatcher
            .run_quick(&automation.prompt, &automation.options)
            .await
            .map_err(SchedulerError::Dispatch)?;
        debug!(automation = %automation.id, agent = %agent_id, "Dispatched agent run");

        self.recorder
            .record_started(RunRecord {
                agent_id: agent_id.clone(),
                automation_id: automation.id.clone(),
                started_at: now,
                status: RunStatus::Running,
                summary: None,
                exit_code: None,
                completed_at: None,
            })
            .await?;
        self.automations.touch_last_run(&automation.id, now).await?;
        self.pending.insert(agent_id.clone(), automation.id.clone());
        let _ = self.refresh_tx.send(());
        Ok(agent_id)
    }

    /// React to one dispatcher status change.
    ///
    /// Only transitions out of running are terminal. Removing the
    /// pending entry first makes finalization apply at most once even
    /// if the dispatcher repeats a terminal event.
    pub async fn handle_status_change(
        &mut self,
        change: StatusChange,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(status) = change.terminal_outcome() else {
            return Ok(());
        };
        let Some(automation_id) = self.pending.remove(&change.agent_id) else {
            return Ok(());
        };

        let completed = self.dispatcher.list_completed().await;
        let details = completed.into_iter().find(|run| run.id == change.agent_id);
        let outcome = RunOutcome {
            status,
            summary: details.as_ref().and_then(|run| run.summary.clone()),
            exit_code: details.as_ref().and_then(|run| run.exit_code),
            completed_at: now,
        };
        let finalized = self
            .recorder
            .finalize(&automation_id, &change.agent_id, outcome)
            .await?;
        if finalized {
            debug!(agent = %change.agent_id, "Finalized run as {status:?}");
        } else {
            warn!("No running record to finalize for agent {}", change.agent_id);
        }
        let _ = self.refresh_tx.send(());
        Ok(())
    }

    /// Fire an automation immediately, ignoring its enabled flag and
    /// schedule. Backs the explicit "run now" action.
    pub async fn run_now(&mut self, automation_id: &str) -> Result<String> {
        let automation = self
            .automations
            .get(automation_id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownAutomation(automation_id.to_string()))?;
        info!(automation = %automation.id, "Manual run");
        self.fire(&automation, Utc::now()).await
    }

    /// Consume status changes until the given agent finalizes, the
    /// channel closes, or `timeout` elapses. Returns whether the agent
    /// finalized.
    pub async fn await_completion(&mut self, agent_id: &str, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending.contains_key(agent_id) {
            let change = tokio::select! {
                change = self.status_rx.recv() => change,
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
            };
            let Some(change) = change else {
                return Ok(false);
            };
            self.handle_status_change(change, Utc::now()).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::TimeZone;
    use otto_store::{KeyLocks, PersistentStore, SqliteStore};
    use otto_types::{AgentStatus, CompletedRun, DispatchOptions};

    #[derive(Default)]
    struct MockDispatcher {
        calls: tokio::sync::Mutex<Vec<String>>,
        completed: tokio::sync::Mutex<Vec<CompletedRun>>,
        fail: AtomicBool,
        counter: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AgentDispatcher for MockDispatcher {
        async fn run_quick(
            &self,
            prompt: &str,
            _options: &DispatchOptions,
        ) -> anyhow::Result<String> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().await.push(prompt.to_string());
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("dispatcher offline");
            }
            Ok(format!("agent-{n}"))
        }

        async fn list_completed(&self) -> Vec<CompletedRun> {
            self.completed.lock().await.clone()
        }

        async fn kill(&self, _agent_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct TestBed {
        scheduler: AutomationScheduler,
        dispatcher: Arc<MockDispatcher>,
        automations: AutomationStore,
        recorder: RunRecorder,
        status_tx: mpsc::Sender<StatusChange>,
    }

    async fn testbed(config: SchedulerConfig, list: Vec<Automation>) -> TestBed {
        let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let locks = Arc::new(KeyLocks::new());
        let automations = AutomationStore::new(store.clone(), locks.clone());
        for automation in list {
            automations.insert(automation).await.unwrap();
        }
        let dispatcher = Arc::new(MockDispatcher::default());
        let (status_tx, status_rx) = mpsc::channel(16);
        let scheduler = AutomationScheduler::new(
            config,
            AutomationStore::new(store.clone(), locks.clone()),
            RunRecorder::new(store.clone(), locks.clone()),
            dispatcher.clone(),
            status_rx,
        );
        TestBed {
            scheduler,
            dispatcher,
            automations,
            recorder: RunRecorder::new(store, locks),
            status_tx,
        }
    }

    fn automation(id: &str, schedule: &str) -> Automation {
        Automation {
            id: id.into(),
            name: format!("automation {id}"),
            schedule: schedule.into(),
            prompt: format!("prompt for {id}"),
            options: DispatchOptions::default(),
            enabled: true,
            missed_run_policy: MissedRunPolicy::Ignore,
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
            last_run_at: None,
        }
    }

    fn terminal(agent_id: &str, status: AgentStatus) -> StatusChange {
        StatusChange {
            agent_id: agent_id.into(),
            status,
            prev_status: AgentStatus::Running,
        }
    }

    async fn call_count(bed: &TestBed) -> usize {
        bed.dispatcher.calls.lock().await.len()
    }

    // 2026-02-02 is a Monday.
    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, hour, minute, second).unwrap()
    }

    #[tokio::test]
    async fn test_fires_on_matching_minute() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "0 9 * * 1")],
        )
        .await;

        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();
        assert_eq!(call_count(&bed).await, 1);

        let stored = bed.automations.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(at(9, 0, 10)));

        let history = bed.recorder.history("a1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Running);
        assert_eq!(history[0].started_at, at(9, 0, 10));
    }

    #[tokio::test]
    async fn test_skips_non_matching_minute() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "0 9 * * 1")],
        )
        .await;

        bed.scheduler.tick(at(9, 1, 10)).await.unwrap();
        assert_eq!(call_count(&bed).await, 0);
    }

    #[tokio::test]
    async fn test_same_minute_double_tick_fires_once() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;

        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();
        bed.scheduler.tick(at(9, 0, 40)).await.unwrap();
        assert_eq!(call_count(&bed).await, 1);

        // The next minute fires again.
        bed.scheduler.tick(at(9, 1, 10)).await.unwrap();
        assert_eq!(call_count(&bed).await, 2);
    }

    #[tokio::test]
    async fn test_epoch_minute_dedup() {
        let config = SchedulerConfig {
            dedup: DedupPrecision::EpochMinute,
            ..SchedulerConfig::default()
        };
        let mut bed = testbed(config, vec![automation("a1", "* * * * *")]).await;

        bed.scheduler.tick(at(9, 0, 5)).await.unwrap();
        bed.scheduler.tick(at(9, 0, 55)).await.unwrap();
        assert_eq!(call_count(&bed).await, 1);
    }

    #[tokio::test]
    async fn test_disabled_never_fires() {
        let mut disabled = automation("a1", "* * * * *");
        disabled.enabled = false;
        disabled.missed_run_policy = MissedRunPolicy::RunAll;
        disabled.last_run_at = Some(at(6, 0, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![disabled]).await;

        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();
        assert_eq!(call_count(&bed).await, 0);
    }

    #[tokio::test]
    async fn test_run_once_policy_single_catchup() {
        let mut hourly = automation("a1", "0 * * * *");
        hourly.missed_run_policy = MissedRunPolicy::RunOnce;
        hourly.last_run_at = Some(at(7, 10, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![hourly]).await;

        // Five missed instants (08:00 through 12:00 given now 12:30).
        bed.scheduler.tick(at(12, 30, 0)).await.unwrap();
        assert_eq!(call_count(&bed).await, 1);
        let stored = bed.automations.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(at(12, 30, 0)));
    }

    #[tokio::test]
    async fn test_run_all_policy_fires_each_missed() {
        let mut hourly = automation("a1", "0 * * * *");
        hourly.missed_run_policy = MissedRunPolicy::RunAll;
        hourly.last_run_at = Some(at(9, 10, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![hourly]).await;

        // Three missed instants: 10:00, 11:00, 12:00.
        bed.scheduler.tick(at(12, 30, 0)).await.unwrap();
        assert_eq!(call_count(&bed).await, 3);
        assert_eq!(bed.recorder.history("a1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_run_all_policy_capped() {
        let mut hourly = automation("a1", "0 * * * *");
        hourly.missed_run_policy = MissedRunPolicy::RunAll;
        hourly.last_run_at = Some(at(3, 20, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![hourly]).await;

        // Fifteen missed instants (04:00 through 18:00), capped at ten.
        bed.scheduler.tick(at(18, 30, 0)).await.unwrap();
        assert_eq!(call_count(&bed).await, CATCHUP_FIRE_CAP as usize);
    }

    #[tokio::test]
    async fn test_catchup_consumes_the_tick() {
        let mut hourly = automation("a1", "0 * * * *");
        hourly.missed_run_policy = MissedRunPolicy::RunAll;
        hourly.last_run_at = Some(at(11, 30, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![hourly]).await;

        // Now is itself a matching minute; the missed count (12:00 and
        // 13:00) already covers it, so no extra direct-match fire.
        bed.scheduler.tick(at(13, 0, 0)).await.unwrap();
        assert_eq!(call_count(&bed).await, 2);
    }

    #[tokio::test]
    async fn test_ignore_policy_skips_missed() {
        let mut hourly = automation("a1", "0 * * * *");
        hourly.last_run_at = Some(at(7, 10, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![hourly]).await;

        bed.scheduler.tick(at(12, 30, 0)).await.unwrap();
        assert_eq!(call_count(&bed).await, 0);
    }

    #[tokio::test]
    async fn test_catchup_failure_does_not_block_others() {
        let mut first = automation("a1", "0 * * * *");
        first.missed_run_policy = MissedRunPolicy::RunOnce;
        first.last_run_at = Some(at(7, 0, 0));
        let mut second = automation("a2", "0 * * * *");
        second.missed_run_policy = MissedRunPolicy::RunOnce;
        second.last_run_at = Some(at(7, 0, 0));
        let mut bed = testbed(SchedulerConfig::default(), vec![first, second]).await;
        bed.dispatcher.fail.store(true, Ordering::SeqCst);

        bed.scheduler.tick(at(12, 30, 0)).await.unwrap();
        // Both automations were attempted despite every dispatch failing.
        assert_eq!(call_count(&bed).await, 2);
        assert!(bed.recorder.history("a1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_finalizes_record() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;
        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();

        bed.dispatcher.completed.lock().await.push(CompletedRun {
            id: "agent-0".into(),
            summary: Some("inbox summarized".into()),
            exit_code: Some(0),
        });
        bed.scheduler
            .handle_status_change(terminal("agent-0", AgentStatus::Sleeping), at(9, 2, 0))
            .await
            .unwrap();

        let history = bed.recorder.history("a1").await.unwrap();
        assert_eq!(history[0].status, RunStatus::Completed);
        assert_eq!(history[0].summary.as_deref(), Some("inbox summarized"));
        assert_eq!(history[0].exit_code, Some(0));
        assert_eq!(history[0].completed_at, Some(at(9, 2, 0)));
    }

    #[tokio::test]
    async fn test_completion_applies_once() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;
        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();

        bed.scheduler
            .handle_status_change(terminal("agent-0", AgentStatus::Sleeping), at(9, 2, 0))
            .await
            .unwrap();
        // A repeated terminal event for the same agent changes nothing.
        bed.scheduler
            .handle_status_change(terminal("agent-0", AgentStatus::Error), at(9, 3, 0))
            .await
            .unwrap();

        let history = bed.recorder.history("a1").await.unwrap();
        assert_eq!(history[0].status, RunStatus::Completed);
        assert_eq!(history[0].completed_at, Some(at(9, 2, 0)));
    }

    #[tokio::test]
    async fn test_error_transition_marks_failed() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;
        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();

        bed.scheduler
            .handle_status_change(terminal("agent-0", AgentStatus::Error), at(9, 2, 0))
            .await
            .unwrap();

        let history = bed.recorder.history("a1").await.unwrap();
        assert_eq!(history[0].status, RunStatus::Failed);
        assert!(history[0].summary.is_none());
        assert!(history[0].exit_code.is_none());
    }

    #[tokio::test]
    async fn test_non_terminal_change_keeps_pending() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;
        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();

        // Not a running-to-terminal transition.
        bed.scheduler
            .handle_status_change(
                StatusChange {
                    agent_id: "agent-0".into(),
                    status: AgentStatus::Running,
                    prev_status: AgentStatus::Sleeping,
                },
                at(9, 1, 0),
            )
            .await
            .unwrap();
        assert_eq!(
            bed.recorder.history("a1").await.unwrap()[0].status,
            RunStatus::Running
        );

        // The real terminal transition still lands.
        bed.scheduler
            .handle_status_change(terminal("agent-0", AgentStatus::Sleeping), at(9, 2, 0))
            .await
            .unwrap();
        assert_eq!(
            bed.recorder.history("a1").await.unwrap()[0].status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unknown_agent_completion_ignored() {
        let mut bed = testbed(SchedulerConfig::default(), vec![]).await;
        bed.scheduler
            .handle_status_change(terminal("ghost", AgentStatus::Sleeping), at(9, 0, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_now_ignores_schedule_and_enabled() {
        let mut disabled = automation("a1", "0 9 * * 1");
        disabled.enabled = false;
        let mut bed = testbed(SchedulerConfig::default(), vec![disabled]).await;

        let agent_id = bed.scheduler.run_now("a1").await.unwrap();
        assert_eq!(agent_id, "agent-0");
        assert_eq!(call_count(&bed).await, 1);

        let history = bed.recorder.history("a1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(bed.automations.get("a1").await.unwrap().unwrap().last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_run_now_unknown_automation() {
        let mut bed = testbed(SchedulerConfig::default(), vec![]).await;
        let err = bed.scheduler.run_now("ghost").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownAutomation(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_await_completion() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;
        let agent_id = bed.scheduler.run_now("a1").await.unwrap();

        bed.status_tx
            .send(terminal(&agent_id, AgentStatus::Sleeping))
            .await
            .unwrap();
        let finalized = bed
            .scheduler
            .await_completion(&agent_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(finalized);
        assert_eq!(
            bed.recorder.history("a1").await.unwrap()[0].status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_refresh_notified_on_fire() {
        let mut bed = testbed(
            SchedulerConfig::default(),
            vec![automation("a1", "* * * * *")],
        )
        .await;
        let mut refresh = bed.scheduler.subscribe_refresh();

        bed.scheduler.tick(at(9, 0, 10)).await.unwrap();
        assert!(refresh.try_recv().is_ok());
    }
}
