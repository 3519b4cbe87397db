//! End-to-end scenarios against an in-memory engine with the simulated
//! warehouse and identity provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use billing_automation::automation::jobs::JobOutcome;
use billing_automation::automation::models::{
    CreateOrchestrationBody, ManagerStage, OrchestrationParams, OrchestrationRun, TaskRequest,
    TaskState,
};
use billing_automation::automation::notify::{RecordingSink, Severity};
use billing_automation::automation::services::Backend;
use billing_automation::automation::simulated::{SimulatedIdentityProvider, SimulatedWarehouse};
use billing_automation::automation::store::InMemoryStore;
use billing_automation::automation::task::{SkipReason, TaskRunReport};
use billing_automation::automation::{Collaborators, Engine, StepReport};
use billing_automation::config::{AutomationToml, StoreBackend};
use billing_automation::errors::AutomationError;

struct Harness {
    engine: Engine,
    warehouse: Arc<SimulatedWarehouse>,
    notifications: Arc<RecordingSink>,
}

async fn harness() -> Harness {
    billing_automation::logging::init_test_logging();
    let mut config = AutomationToml::default();
    config.store.backend = StoreBackend::Memory;
    config.identities.max_identities = 3;
    config.identities.provisioning_pause_ms = 0;
    config.identities.allocation_delay_ms = 1;
    config.identities.allocation_attempts = 5;

    let warehouse = SimulatedWarehouse::new();
    let notifications = Arc::new(RecordingSink::new());
    let collaborators = Collaborators::simulated(
        &warehouse,
        SimulatedIdentityProvider::new(),
        notifications.clone(),
    );
    let engine = Engine::new(Arc::new(InMemoryStore::new()), collaborators, &config);
    engine.ensure_defaults().await.unwrap();
    Harness {
        engine,
        warehouse,
        notifications,
    }
}

fn body(duration: i64, users: i64, min_kilo: i64) -> CreateOrchestrationBody {
    CreateOrchestrationBody {
        duration_in_minutes: Some(duration),
        num_of_dummy_users: Some(users),
        min_num_of_kilo_rows_per_hour: Some(min_kilo),
        max_num_of_kilo_rows_per_hour: None,
    }
}

async fn create(h: &Harness, duration: i64, users: i64) -> OrchestrationRun {
    let params = body(duration, users, 1).validate().unwrap();
    h.engine.orchestrator.create_orchestration(params).await.unwrap()
}

async fn step(h: &Harness, now: DateTime<Utc>) -> StepReport {
    h.engine.manager.run_automation_at(now).await.unwrap()
}

/// Run one step and return the stage it moved to.
async fn advance(h: &Harness, now: DateTime<Utc>) -> ManagerStage {
    match step(h, now).await {
        StepReport::Ran { next, .. } => next,
        other => panic!("Expected a step to run, got {:?}", other),
    }
}

async fn tasks(h: &Harness, version: i64) -> Vec<TaskState> {
    h.engine.metadata.tasks_for_version(version).await.unwrap()
}

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

// =============================================================================
// Orchestration lifecycle
// =============================================================================

#[tokio::test]
async fn create_orchestration_binds_each_account_to_a_distinct_identity() {
    let h = harness().await;
    let run = create(&h, 60, 3).await;
    assert_eq!(run.version, 1);

    let manager = h.engine.metadata.manager().await.unwrap().unwrap();
    assert_eq!(manager.stage, ManagerStage::Pending);
    assert_eq!(manager.version, 1);

    assert_eq!(advance(&h, Utc::now()).await, ManagerStage::Writing);

    let tasks = tasks(&h, 1).await;
    assert_eq!(tasks.len(), 3);
    let mut identities: Vec<&str> = tasks.iter().map(|t| t.worker_identity_id.as_str()).collect();
    identities.sort();
    identities.dedup();
    assert_eq!(identities.len(), 3);
    assert!(tasks.iter().all(|t| t.active && !t.running && t.rows_per_hour == 1000));
    assert_eq!(h.warehouse.onboarded_accounts().unwrap().len(), 3);
    assert_eq!(h.warehouse.progress_purges().unwrap(), 1);
}

#[tokio::test]
async fn create_while_previous_run_writes_is_rejected() {
    let h = harness().await;
    create(&h, 60, 1).await;

    let params = body(60, 1, 1).validate().unwrap();
    let err = h
        .engine
        .orchestrator
        .create_orchestration(params)
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::OrchestrationStillRunning { .. }));
    assert!(
        err.to_string()
            .starts_with("an older orchestration will run for other")
    );
}

#[tokio::test]
async fn versions_increase_across_stop_and_reset() {
    let h = harness().await;
    let mut versions = vec![create(&h, 60, 1).await.version];

    h.engine.orchestrator.stop_orchestration().await.unwrap();
    versions.push(create(&h, 60, 1).await.version);

    h.engine.orchestrator.stop_orchestration().await.unwrap();
    h.engine.orchestrator.delete_automation().await.unwrap();
    versions.push(create(&h, 60, 1).await.version);

    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn delete_automation_twice_leaves_same_default_state() {
    let h = harness().await;
    create(&h, 60, 3).await;
    advance(&h, Utc::now()).await;

    let first = h.engine.orchestrator.delete_automation().await.unwrap();
    assert_eq!(first.tasks, 3);
    let after_first = h.engine.status().await.unwrap();

    let second = h.engine.orchestrator.delete_automation().await.unwrap();
    assert_eq!(second.tasks, 0);
    assert_eq!(second.tables, 0);
    let after_second = h.engine.status().await.unwrap();

    assert_eq!(after_first.manager, after_second.manager);
    assert_eq!(after_first.tasks, after_second.tasks);
    assert_eq!(after_first.identities, after_second.identities);
    assert_eq!(after_second.identities.bound_accounts, 0);
    assert_eq!(
        after_first.orchestration.unwrap().version,
        after_second.orchestration.unwrap().version
    );
    assert!(h.warehouse.table_names().unwrap().is_empty());
    assert!(h.warehouse.onboarded_accounts().unwrap().is_empty());
}

// =============================================================================
// Manager state machine
// =============================================================================

#[tokio::test]
async fn full_run_passes_and_cleans_up() {
    let h = harness().await;
    let run = create(&h, 60, 2).await;
    let t0 = Utc::now();

    assert_eq!(advance(&h, t0).await, ManagerStage::Writing);
    assert_eq!(advance(&h, t0).await, ManagerStage::Writing);
    assert_eq!(advance(&h, t0 + minutes(61)).await, ManagerStage::WaitToVerifyRowCount);
    assert_eq!(advance(&h, t0 + minutes(61)).await, ManagerStage::WaitToVerifyRowCount);

    let written = tasks(&h, run.version).await;
    assert!(written.iter().all(|t| t.written_rows.expected == 2000));
    assert_eq!(h.warehouse.submitted_jobs().unwrap().len(), 4);

    assert_eq!(advance(&h, t0 + minutes(181)).await, ManagerStage::VerifyingRowCount);
    assert!(tasks(&h, run.version).await.iter().all(|t| t.verified));
    assert_eq!(advance(&h, t0 + minutes(182)).await, ManagerStage::Notifying);
    assert_eq!(advance(&h, t0 + minutes(183)).await, ManagerStage::Cleanup);

    let sent = h.notifications.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].severity, Severity::Info);
    assert_eq!(sent[0].subject, "Automation Suite Result for env dev");
    assert_eq!(sent[0].lines[0], "automation results:");
    assert_eq!(sent[0].lines.len(), 3);
    assert!(sent[0].lines[1..].iter().all(|line| line.contains(":PASSED Expected: 2000")));

    assert_eq!(advance(&h, t0 + minutes(184)).await, ManagerStage::Done);
    assert!(tasks(&h, run.version).await.is_empty());
    assert!(h.warehouse.table_names().unwrap().is_empty());

    match step(&h, t0 + minutes(185)).await {
        StepReport::Idle { version, stage } => {
            assert_eq!(version, run.version);
            assert_eq!(stage, ManagerStage::Done);
        }
        other => panic!("Expected Idle, got {:?}", other),
    }
}

#[tokio::test]
async fn row_count_mismatch_fails_without_cleanup() {
    let h = harness().await;
    let run = create(&h, 60, 2).await;
    let t0 = Utc::now();

    advance(&h, t0).await;
    advance(&h, t0 + minutes(61)).await;
    let victim = run.synthetic_accounts()[1].clone();
    h.warehouse.drop_rows(Backend::UnifiedCopy, &victim, 1).unwrap();

    assert_eq!(advance(&h, t0 + minutes(181)).await, ManagerStage::VerifyingRowCount);
    assert_eq!(advance(&h, t0 + minutes(181)).await, ManagerStage::Notifying);
    assert_eq!(advance(&h, t0 + minutes(181)).await, ManagerStage::Failed);

    let sent = h.notifications.sent();
    assert_eq!(sent[0].severity, Severity::Urgent);
    let failed: Vec<&String> = sent[0].lines.iter().filter(|l| l.contains(":FAILED")).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].starts_with(&format!("BA {}:FAILED Expected: 1000", victim)));
    assert!(failed[0].ends_with("Unified: 999"));

    // Failed keeps everything for investigation.
    assert_eq!(h.warehouse.table_names().unwrap().len(), 2);
    assert_eq!(tasks(&h, run.version).await.len(), 2);
    assert!(matches!(
        step(&h, t0 + minutes(300)).await,
        StepReport::Idle {
            stage: ManagerStage::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn failed_row_count_query_keeps_verifying() {
    let h = harness().await;
    let run = create(&h, 60, 1).await;
    let t0 = Utc::now();

    advance(&h, t0).await;
    advance(&h, t0 + minutes(61)).await;
    h.warehouse.fail_counts(Backend::LocalCopy, true).unwrap();

    assert_eq!(advance(&h, t0 + minutes(181)).await, ManagerStage::VerifyingRowCount);
    assert_eq!(advance(&h, t0 + minutes(182)).await, ManagerStage::VerifyingRowCount);
    assert!(tasks(&h, run.version).await.iter().all(|t| !t.verified));

    h.warehouse.fail_counts(Backend::LocalCopy, false).unwrap();
    assert_eq!(advance(&h, t0 + minutes(183)).await, ManagerStage::Notifying);
}

#[tokio::test]
async fn stuck_task_is_retired_and_skipped_by_later_iterations() {
    let h = harness().await;
    let run = create(&h, 600, 2).await;
    let accounts = run.synthetic_accounts();
    let stuck = accounts[0].clone();
    h.warehouse.script_outcomes(&stuck, &[JobOutcome::Stuck]).unwrap();
    let t0 = Utc::now();

    advance(&h, t0).await;
    advance(&h, t0).await;
    let task = h.engine.metadata.task(&stuck).await.unwrap().unwrap();
    assert!(!task.active);
    assert!(!task.running);
    assert_eq!(task.written_rows.expected, 0);
    assert_eq!(task.last_outcome, Some(JobOutcome::Stuck));

    advance(&h, t0 + minutes(60)).await;
    advance(&h, t0 + minutes(120)).await;

    let jobs = h.warehouse.submitted_jobs().unwrap();
    assert_eq!(jobs.iter().filter(|j| j.account_id == stuck).count(), 1);
    assert_eq!(jobs.iter().filter(|j| j.account_id == accounts[1]).count(), 3);
    let healthy = h.engine.metadata.task(&accounts[1]).await.unwrap().unwrap();
    assert_eq!(healthy.written_rows.expected, 3000);
}

#[tokio::test]
async fn overlapping_step_is_skipped_until_ttl_lapses() {
    let h = harness().await;
    create(&h, 60, 1).await;
    let t0 = Utc::now();
    advance(&h, t0).await;

    let held = h
        .engine
        .metadata
        .update_manager(|state| {
            state.running = true;
            state.ttl = Some(t0 + minutes(30));
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(step(&h, t0).await, StepReport::Busy { version: 1 });
    assert_eq!(h.engine.metadata.manager().await.unwrap().unwrap(), held);

    // A holder that never tore down is taken over once its ttl passes.
    let report = step(&h, t0 + minutes(31)).await;
    assert!(matches!(report, StepReport::Ran { iteration: 2, .. }));
    assert!(!h.engine.metadata.manager().await.unwrap().unwrap().running);
}

#[tokio::test]
async fn production_environment_is_refused() {
    let mut config = AutomationToml::default();
    config.store.backend = StoreBackend::Memory;
    config.environment.name = "prod".into();
    config.identities.max_identities = 1;
    config.identities.provisioning_pause_ms = 0;
    let engine = Engine::from_config(&config).await.unwrap();
    engine.ensure_defaults().await.unwrap();
    engine
        .orchestrator
        .create_orchestration(body(60, 1, 1).validate().unwrap())
        .await
        .unwrap();

    let err = engine.manager.run_automation().await.unwrap_err();
    assert!(matches!(err, AutomationError::ProductionEnvironment { .. }));
    assert!(err.is_fatal());
    let manager = engine.metadata.manager().await.unwrap().unwrap();
    assert_eq!(manager.stage, ManagerStage::Pending);
    assert_eq!(manager.iteration, 0);
}

#[tokio::test]
async fn manager_version_mismatch_is_fatal() {
    let h = harness().await;
    create(&h, 60, 1).await;
    h.engine
        .metadata
        .update_manager(|state| {
            state.version = 7;
            Ok(())
        })
        .await
        .unwrap();

    let err = h.engine.manager.run_automation().await.unwrap_err();
    assert!(matches!(
        err,
        AutomationError::VersionMismatch {
            orchestration: 1,
            manager: 7
        }
    ));
}

#[tokio::test]
async fn failed_stage_keeps_stage_and_releases_the_step() {
    let h = harness().await;
    create(&h, 60, 2).await;
    let identities = h.engine.metadata.identities().await.unwrap();
    for owner in &identities {
        h.engine
            .metadata
            .update_identity(&owner.id, |identity| {
                for n in 0..9 {
                    identity.bind(&format!("filler-{}-{}", owner.id, n), 9)?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    let err = h.engine.manager.run_automation().await.unwrap_err();
    assert!(matches!(err, AutomationError::NoAvailableIdentity));
    assert!(!err.is_fatal());
    let manager = h.engine.metadata.manager().await.unwrap().unwrap();
    assert_eq!(manager.stage, ManagerStage::Pending);
    assert!(!manager.running);
    assert_eq!(manager.iteration, 1);

    for owner in &identities {
        h.engine
            .metadata
            .update_identity(&owner.id, |identity| {
                identity.bound_accounts.clear();
                identity.is_full = false;
                Ok(())
            })
            .await
            .unwrap();
    }
    assert_eq!(advance(&h, Utc::now()).await, ManagerStage::Writing);
    assert_eq!(tasks(&h, 1).await.len(), 2);
}

#[tokio::test]
async fn oversized_throughput_fails_pending_without_wedging_the_manager() {
    let h = harness().await;
    let params = OrchestrationParams {
        duration_minutes: 60,
        num_synthetic_accounts: 1,
        min_rows_per_hour: i64::MAX / 2,
        max_rows_per_hour: i64::MAX / 2,
    };
    h.engine.orchestrator.create_orchestration(params).await.unwrap();

    let err = h.engine.manager.run_automation().await.unwrap_err();
    assert!(matches!(err, AutomationError::InvalidRequest(_)));
    let manager = h.engine.metadata.manager().await.unwrap().unwrap();
    assert_eq!(manager.stage, ManagerStage::Pending);
    assert!(!manager.running);
    assert!(tasks(&h, 1).await.is_empty());

    // The step is free again, so the next invocation runs instead of skipping.
    assert!(h.engine.manager.run_automation().await.is_err());
    assert_eq!(
        h.engine.metadata.manager().await.unwrap().unwrap().iteration,
        2
    );
}

// =============================================================================
// Task executor
// =============================================================================

/// Orchestration with one task ready for iteration 1.
async fn ready_task(h: &Harness) -> TaskRequest {
    let run = create(h, 600, 1).await;
    advance(h, Utc::now()).await;
    let account = run.synthetic_accounts()[0].clone();
    h.engine
        .metadata
        .update_task(&account, |task| {
            task.iteration = 1;
            Ok(())
        })
        .await
        .unwrap();
    TaskRequest {
        billing_account_id: account,
        iteration: 1,
        version: run.version,
    }
}

#[tokio::test]
async fn duplicate_concurrent_task_requests_submit_one_job() {
    let h = harness().await;
    let request = ready_task(&h).await;
    h.warehouse.set_job_delay(Some(Duration::from_millis(200))).unwrap();

    let (first, second) = tokio::join!(
        h.engine.executor.run_task(&request),
        h.engine.executor.run_task(&request)
    );
    let reports = [first.unwrap(), second.unwrap()];

    let completed = reports
        .iter()
        .filter(|r| matches!(r, TaskRunReport::Completed { outcome: JobOutcome::Success, .. }))
        .count();
    let skipped = reports
        .iter()
        .filter(|r| {
            matches!(
                r,
                TaskRunReport::Skipped {
                    reason: SkipReason::AlreadyRunning
                }
            )
        })
        .count();
    assert_eq!((completed, skipped), (1, 1));
    assert_eq!(h.warehouse.submitted_jobs().unwrap().len(), 1);

    let task = h.engine.metadata.task(&request.billing_account_id).await.unwrap().unwrap();
    assert_eq!(task.written_rows.expected, 1000);
    assert!(!task.running);
}

#[tokio::test]
async fn stale_task_requests_never_touch_written_rows() {
    let h = harness().await;
    let request = ready_task(&h).await;
    h.engine.executor.run_task(&request).await.unwrap();
    let before = h
        .engine
        .metadata
        .task(&request.billing_account_id)
        .await
        .unwrap()
        .unwrap();

    let stale_version = TaskRequest {
        version: request.version - 1,
        ..request.clone()
    };
    let stale_iteration = TaskRequest {
        iteration: request.iteration + 1,
        ..request.clone()
    };
    assert_eq!(
        h.engine.executor.run_task(&stale_version).await.unwrap(),
        TaskRunReport::Skipped {
            reason: SkipReason::VersionMismatch
        }
    );
    assert_eq!(
        h.engine.executor.run_task(&stale_iteration).await.unwrap(),
        TaskRunReport::Skipped {
            reason: SkipReason::IterationMismatch
        }
    );

    let after = h
        .engine
        .metadata
        .task(&request.billing_account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.written_rows, after.written_rows);
    assert_eq!(h.warehouse.submitted_jobs().unwrap().len(), 1);
}

#[tokio::test]
async fn expected_rows_never_decrease_across_iterations() {
    let h = harness().await;
    let run = create(&h, 600, 1).await;
    let account = run.synthetic_accounts()[0].clone();
    h.warehouse
        .script_outcomes(
            &account,
            &[
                JobOutcome::Success,
                JobOutcome::ExecutionFailure,
                JobOutcome::Canceled,
                JobOutcome::Success,
            ],
        )
        .unwrap();
    let t0 = Utc::now();
    advance(&h, t0).await;

    let mut seen = Vec::new();
    for hour in 0..4 {
        advance(&h, t0 + minutes(60 * hour)).await;
        let task = h.engine.metadata.task(&account).await.unwrap().unwrap();
        assert!(task.active);
        seen.push(task.written_rows.expected);
    }
    assert_eq!(seen, vec![1000, 1000, 1000, 2000]);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn submit_failure_releases_the_task() {
    let h = harness().await;
    let request = ready_task(&h).await;
    h.warehouse.fail_submissions(&request.billing_account_id).unwrap();

    let report = h.engine.executor.run_task(&request).await.unwrap();
    assert!(matches!(report, TaskRunReport::SubmitFailed { .. }));
    let task = h
        .engine
        .metadata
        .task(&request.billing_account_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!task.running);
    assert!(task.active);
    assert_eq!(task.written_rows.expected, 0);
}

// =============================================================================
// Worker-identity pool
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_capacity_holds_under_concurrent_allocation() {
    let h = harness().await;
    h.engine.pool.ensure_capacity().await.unwrap();

    let accounts: Vec<String> = (0..30).map(|i| format!("AUTO00-TEST00-{:06}", i)).collect();
    let results = futures::future::join_all(
        accounts
            .iter()
            .map(|account| h.engine.pool.allocate_with_retry(account)),
    )
    .await;
    let granted = results.iter().filter(|r| r.is_ok()).count();

    let identities = h.engine.metadata.identities().await.unwrap();
    let bound: usize = identities.iter().map(|i| i.bound_accounts.len()).sum();
    assert!(identities.iter().all(|i| i.bound_accounts.len() <= 9));
    assert_eq!(bound, granted);
    assert!(granted <= 27);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(
                e,
                AutomationError::NoAvailableIdentity
                    | AutomationError::IdentityFull { .. }
                    | AutomationError::TransactionConflict { .. }
            ))
    );
}
