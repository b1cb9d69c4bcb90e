//! End-to-end coverage of the orchestration core against mock workers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crucible::db::{Db, DbHandle};
use crucible::dispatch::AnalysisTransport;
use crucible::errors::{DispatchError, ReservationError};
use crucible::generation::{GenerationBackend, GenerationOutcome};
use crucible::models::{
    AnalysisStage, GenerationStage, PipelineConfig, PipelineStatus, ServiceType, StageOptions,
    TaskStatus,
};
use crucible::orchestrator::TaskOrchestrator;
use crucible::pool::{EndpointPool, PoolConfig, Probe, SelectionStrategy};
use crucible::protocol::{AnalysisPayload, WorkerRequest, WorkerResponse, WorkerStatus};
use crucible::reservation::ReservationStore;
use crucible::scheduler::{JobScheduler, SchedulerConfig};

// ── Mock collaborators ───────────────────────────────────────────────

struct AlwaysUpProbe;

#[async_trait]
impl Probe for AlwaysUpProbe {
    async fn probe(&self, _url: &str, _service: ServiceType) -> bool {
        true
    }
}

/// Generation backend that succeeds unless a (model, template) pair is on
/// its failure list.
struct MockGenerator {
    fail: HashSet<(String, String)>,
    calls: AtomicUsize,
}

impl MockGenerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: HashSet::new(),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            fail: pairs
                .iter()
                .map(|(m, t)| (m.to_string(), t.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl GenerationBackend for MockGenerator {
    async fn generate(
        &self,
        model: &str,
        template: &str,
        app_number: u32,
    ) -> anyhow::Result<GenerationOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.contains(&(model.to_string(), template.to_string())) {
            anyhow::bail!("mock generation failure for {}/{}", model, template);
        }
        Ok(GenerationOutcome {
            summary: format!("{} app {} from {}", model, app_number, template),
        })
    }
}

/// Worker transport that answers success unless the target app or the whole
/// service is on a failure list. Failures are worker-reported (the endpoint
/// itself stays reachable).
struct MockTransport {
    fail_apps: Mutex<HashSet<(String, u32)>>,
    fail_services: Mutex<HashSet<ServiceType>>,
    dispatches: AtomicUsize,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Self::failing_apps(&[])
    }

    fn failing_apps(apps: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            fail_apps: Mutex::new(apps.iter().map(|(m, n)| (m.to_string(), *n)).collect()),
            fail_services: Mutex::new(HashSet::new()),
            dispatches: AtomicUsize::new(0),
        })
    }

    fn failing_services(services: &[ServiceType]) -> Arc<Self> {
        Arc::new(Self {
            fail_apps: Mutex::new(HashSet::new()),
            fail_services: Mutex::new(services.iter().copied().collect()),
            dispatches: AtomicUsize::new(0),
        })
    }

    /// Clear every injected failure; later dispatches succeed.
    fn heal(&self) {
        self.fail_apps.lock().unwrap().clear();
        self.fail_services.lock().unwrap().clear();
    }
}

#[async_trait]
impl AnalysisTransport for MockTransport {
    async fn dispatch(
        &self,
        _url: &str,
        service: ServiceType,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, DispatchError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        let target = (request.target_model.clone(), request.target_app_number);
        let failing = self.fail_services.lock().unwrap().contains(&service)
            || self.fail_apps.lock().unwrap().contains(&target);
        if failing {
            return Ok(WorkerResponse {
                status: WorkerStatus::Error,
                analysis: None,
                error: Some("injected worker failure".to_string()),
            });
        }
        Ok(WorkerResponse {
            status: WorkerStatus::Success,
            analysis: Some(AnalysisPayload {
                findings: vec![json!({"severity": "low", "tool": request.tools[0]})],
                tools_used: request.tools.clone(),
                severity_breakdown: HashMap::from([("low".to_string(), 1)]),
            }),
            error: None,
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    scheduler: JobScheduler,
    reservations: ReservationStore,
    _lock_dir: tempfile::TempDir,
}

async fn harness(
    generator: Arc<dyn GenerationBackend>,
    transport: Arc<dyn AnalysisTransport>,
) -> Harness {
    let lock_dir = tempfile::tempdir().expect("tempdir");
    let db = DbHandle::new(Db::new_in_memory().expect("in-memory db"));
    let reservations = ReservationStore::new(
        db.clone(),
        lock_dir.path().to_path_buf(),
        Duration::from_secs(5),
    );

    let pool = Arc::new(EndpointPool::new(
        PoolConfig {
            cooldown: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(1),
            strategy: SelectionStrategy::RoundRobin,
        },
        Arc::new(AlwaysUpProbe),
    ));
    for service in ServiceType::ALL {
        pool.register(service, "ws://worker-a:8100").await;
        pool.register(service, "ws://worker-b:8100").await;
    }

    let orchestrator = Arc::new(TaskOrchestrator::new(db.clone(), pool, transport, 3));
    let scheduler = JobScheduler::new(
        SchedulerConfig {
            max_concurrent_generation: 2,
            max_concurrent_analysis: 2,
            poll_interval: Duration::from_millis(20),
        },
        reservations.clone(),
        generator,
        orchestrator,
    );

    Harness {
        scheduler,
        reservations,
        _lock_dir: lock_dir,
    }
}

fn pipeline_2x2(analysis_enabled: bool) -> PipelineConfig {
    PipelineConfig {
        generation: GenerationStage {
            models: vec!["gpt_mini".into(), "claude_small".into()],
            templates: vec!["flask_todo".into(), "fastapi_notes".into()],
            options: StageOptions {
                parallel: true,
                max_concurrent_tasks: 2,
            },
        },
        analysis: AnalysisStage {
            enabled: analysis_enabled,
            tools: vec!["bandit".into(), "safety".into()],
            options: StageOptions {
                parallel: true,
                max_concurrent_tasks: 2,
            },
        },
    }
}

// ── P1: allocation disjointness under concurrency ────────────────────

#[tokio::test]
async fn concurrent_allocations_yield_disjoint_contiguous_numbers() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let store = h.reservations.clone();
        handles.push(tokio::spawn(
            async move { store.allocate("gpt_mini", None).await },
        ));
    }

    let mut numbers = HashSet::new();
    for handle in handles {
        let slot = handle.await.expect("join").expect("allocate");
        assert!(numbers.insert(slot.app_number), "duplicate app number");
    }
    assert_eq!(numbers, (1..=5).collect::<HashSet<u32>>());
}

// ── P2: version linearity ────────────────────────────────────────────

#[tokio::test]
async fn version_lineage_is_linear_and_rejects_stale_branches() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;

    let v1 = h.reservations.allocate("gpt_mini", None).await.unwrap();
    let v2 = h.reservations.create_version(v1.id).await.unwrap();
    let v3 = h.reservations.create_version(v2.id).await.unwrap();

    assert_eq!((v1.version, v2.version, v3.version), (1, 2, 3));
    assert_eq!(v2.parent_slot_id, Some(v1.id));
    assert_eq!(v3.parent_slot_id, Some(v2.id));

    let err = h.reservations.create_version(v1.id).await.unwrap_err();
    assert!(matches!(err, ReservationError::StaleParent { .. }));
}

// ── P3: status rollup across subtasks ────────────────────────────────

async fn rollup_case(
    transport: Arc<dyn AnalysisTransport>,
    expected_main: TaskStatus,
    expected_subtasks: &[(ServiceType, TaskStatus)],
) {
    let db = DbHandle::new(Db::new_in_memory().expect("in-memory db"));
    let pool = Arc::new(EndpointPool::new(
        PoolConfig::default(),
        Arc::new(AlwaysUpProbe),
    ));
    for service in ServiceType::ALL {
        pool.register(service, "ws://worker-a:8100").await;
    }

    // Two services touched: static_analysis (bandit) and ai_review.
    let orchestrator = TaskOrchestrator::new(db.clone(), pool, transport, 3);
    let outcome = orchestrator
        .analyze("gpt_mini", 1, &["bandit".into(), "code_review".into()])
        .await
        .expect("analyze");

    assert_eq!(outcome.task.status, expected_main);

    let main_id = outcome.task.id;
    let subtasks = db
        .call(move |db| db.list_subtasks(main_id))
        .await
        .expect("list subtasks");
    assert_eq!(subtasks.len(), expected_subtasks.len());
    for (service, expected) in expected_subtasks {
        let subtask = subtasks
            .iter()
            .find(|t| t.service == Some(*service))
            .expect("subtask for service");
        assert_eq!(subtask.status, *expected);
    }
}

#[tokio::test]
async fn rollup_all_subtasks_completed() {
    rollup_case(
        MockTransport::new(),
        TaskStatus::Completed,
        &[
            (ServiceType::StaticAnalysis, TaskStatus::Completed),
            (ServiceType::AiReview, TaskStatus::Completed),
        ],
    )
    .await;
}

#[tokio::test]
async fn rollup_mixed_subtasks_partial_success() {
    rollup_case(
        MockTransport::failing_services(&[ServiceType::AiReview]),
        TaskStatus::PartialSuccess,
        &[
            (ServiceType::StaticAnalysis, TaskStatus::Completed),
            (ServiceType::AiReview, TaskStatus::Failed),
        ],
    )
    .await;
}

#[tokio::test]
async fn rollup_all_subtasks_failed() {
    rollup_case(
        MockTransport::failing_services(&[ServiceType::StaticAnalysis, ServiceType::AiReview]),
        TaskStatus::Failed,
        &[
            (ServiceType::StaticAnalysis, TaskStatus::Failed),
            (ServiceType::AiReview, TaskStatus::Failed),
        ],
    )
    .await;
}

// ── P5: no duplicate dispatch ────────────────────────────────────────

#[tokio::test]
async fn in_flight_job_is_never_claimed_twice() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;
    let run_id = h.scheduler.submit(pipeline_2x2(false)).await.unwrap();

    assert!(h.scheduler.try_claim(run_id, "gen:gpt_mini:flask_todo").await);
    // Second observation of the same in-flight job must not submit.
    assert!(!h.scheduler.try_claim(run_id, "gen:gpt_mini:flask_todo").await);
    // A different job key is unaffected.
    assert!(
        h.scheduler
            .try_claim(run_id, "gen:gpt_mini:fastapi_notes")
            .await
    );
}

// ── End-to-end pipeline scenarios ────────────────────────────────────

#[tokio::test]
async fn scenario_all_eight_jobs_succeed() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;
    let run_id = h.scheduler.submit(pipeline_2x2(true)).await.unwrap();
    let run = h.scheduler.execute(run_id).await.expect("execute");

    assert_eq!(run.generation.total, 4);
    assert_eq!(run.analysis.total, 4);
    assert_eq!(run.generation.completed, 4);
    assert_eq!(run.generation.failed, 0);
    assert_eq!(run.analysis.completed, 4);
    assert_eq!(run.analysis.failed, 0);
    assert_eq!(run.generation.in_flight, 0);
    assert_eq!(run.analysis.in_flight, 0);
    assert_eq!(run.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn scenario_one_analysis_failure_is_partial_success() {
    // Each model allocates app numbers 1 and 2; failing (gpt_mini, 1)
    // fails exactly one analysis job.
    let transport = MockTransport::failing_apps(&[("gpt_mini", 1)]);
    let h = harness(MockGenerator::new(), transport).await;
    let run_id = h.scheduler.submit(pipeline_2x2(true)).await.unwrap();
    let run = h.scheduler.execute(run_id).await.expect("execute");

    assert_eq!(run.generation.completed, 4);
    assert_eq!(run.analysis.completed, 3);
    assert_eq!(run.analysis.failed, 1);
    assert_eq!(run.status, PipelineStatus::PartialSuccess);
}

#[tokio::test]
async fn scenario_generation_failure_gates_analysis() {
    let generator = MockGenerator::failing(&[("gpt_mini", "flask_todo")]);
    let transport = MockTransport::new();
    let h = harness(generator, transport.clone()).await;
    let run_id = h.scheduler.submit(pipeline_2x2(true)).await.unwrap();
    let run = h.scheduler.execute(run_id).await.expect("execute");

    assert_eq!(run.generation.completed, 3);
    assert_eq!(run.generation.failed, 1);
    // The gated analysis job for the failed generation counts as failed
    // without ever dispatching.
    assert_eq!(run.analysis.completed, 3);
    assert_eq!(run.analysis.failed, 1);
    assert_eq!(transport.dispatches.load(Ordering::SeqCst), 3);
    assert_eq!(run.status, PipelineStatus::PartialSuccess);
}

#[tokio::test]
async fn scenario_total_generation_failure_is_failed() {
    let generator = MockGenerator::failing(&[
        ("gpt_mini", "flask_todo"),
        ("gpt_mini", "fastapi_notes"),
        ("claude_small", "flask_todo"),
        ("claude_small", "fastapi_notes"),
    ]);
    let h = harness(generator, MockTransport::new()).await;
    let run_id = h.scheduler.submit(pipeline_2x2(true)).await.unwrap();
    let run = h.scheduler.execute(run_id).await.expect("execute");

    assert_eq!(run.generation.completed, 0);
    assert_eq!(run.generation.failed, 4);
    assert_eq!(run.analysis.failed, 4);
    assert_eq!(run.status, PipelineStatus::Failed);
}

#[tokio::test]
async fn scenario_generation_only_pipeline() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;
    let run_id = h.scheduler.submit(pipeline_2x2(false)).await.unwrap();
    let run = h.scheduler.execute(run_id).await.expect("execute");

    assert_eq!(run.generation.total, 4);
    assert_eq!(run.analysis.total, 0);
    assert_eq!(run.generation.completed, 4);
    assert_eq!(run.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn cancelled_pending_run_executes_to_cancelled() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;
    let run_id = h.scheduler.submit(pipeline_2x2(true)).await.unwrap();
    h.scheduler.cancel(run_id).await.unwrap();

    let run = h.scheduler.execute(run_id).await.expect("execute");
    assert_eq!(run.status, PipelineStatus::Cancelled);
    assert_eq!(run.generation.completed, 0);
}

#[tokio::test]
async fn invalid_pipeline_definitions_are_rejected() {
    let h = harness(MockGenerator::new(), MockTransport::new()).await;

    let mut empty_models = pipeline_2x2(true);
    empty_models.generation.models.clear();
    assert!(h.scheduler.submit(empty_models).await.is_err());

    let mut no_tools = pipeline_2x2(true);
    no_tools.analysis.tools.clear();
    assert!(h.scheduler.submit(no_tools).await.is_err());
}

// ── Caller-driven retry ──────────────────────────────────────────────

#[tokio::test]
async fn failed_subtask_retries_within_budget_and_heals_the_main_task() {
    let db = DbHandle::new(Db::new_in_memory().expect("in-memory db"));
    let pool = Arc::new(EndpointPool::new(
        PoolConfig::default(),
        Arc::new(AlwaysUpProbe),
    ));
    for service in ServiceType::ALL {
        pool.register(service, "ws://worker-a:8100").await;
    }
    let transport = MockTransport::failing_services(&[ServiceType::AiReview]);
    let orchestrator = TaskOrchestrator::new(db.clone(), pool, transport.clone(), 3);

    let outcome = orchestrator
        .analyze("gpt_mini", 1, &["bandit".into(), "code_review".into()])
        .await
        .expect("analyze");
    assert_eq!(outcome.task.status, TaskStatus::PartialSuccess);

    let main_id = outcome.task.id;
    let failed = db
        .call(move |db| db.list_subtasks(main_id))
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.status == TaskStatus::Failed)
        .expect("one failed subtask");

    // Retrying a subtask that already succeeded is rejected.
    let completed_id = db
        .call(move |db| db.list_subtasks(main_id))
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.status == TaskStatus::Completed)
        .expect("one completed subtask")
        .id;
    assert!(orchestrator.retry_subtask(completed_id).await.is_err());

    // Worker recovers; the retry succeeds and the parent rolls up clean.
    transport.heal();
    let retried = orchestrator.retry_subtask(failed.id).await.expect("retry");
    assert_eq!(retried.status, TaskStatus::Completed);
    assert_eq!(retried.retry_count, 1);

    let main = db
        .call(move |db| db.get_task(main_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(main.status, TaskStatus::Completed);
    assert_eq!(main.progress, 100.0);
}

#[tokio::test]
async fn retry_budget_is_enforced() {
    let db = DbHandle::new(Db::new_in_memory().expect("in-memory db"));
    let pool = Arc::new(EndpointPool::new(
        PoolConfig::default(),
        Arc::new(AlwaysUpProbe),
    ));
    for service in ServiceType::ALL {
        pool.register(service, "ws://worker-a:8100").await;
    }
    let transport = MockTransport::failing_services(&[ServiceType::AiReview]);
    // Zero retries allowed.
    let orchestrator = TaskOrchestrator::new(db.clone(), pool, transport, 0);

    let outcome = orchestrator
        .analyze("gpt_mini", 1, &["bandit".into(), "code_review".into()])
        .await
        .expect("analyze");
    let main_id = outcome.task.id;
    let failed = db
        .call(move |db| db.list_subtasks(main_id))
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.status == TaskStatus::Failed)
        .expect("one failed subtask");

    let err = orchestrator.retry_subtask(failed.id).await.unwrap_err();
    assert!(matches!(
        err,
        crucible::errors::OrchestrationError::RetriesExhausted { .. }
    ));
}

// ── Capacity exhaustion surfaces as subtask failure ──────────────────

#[tokio::test]
async fn no_registered_endpoint_fails_task_without_error() {
    let db = DbHandle::new(Db::new_in_memory().unwrap());
    // A pool with nothing registered: select() always returns None.
    let pool = Arc::new(EndpointPool::new(
        PoolConfig::default(),
        Arc::new(AlwaysUpProbe),
    ));
    let transport: Arc<dyn AnalysisTransport> = MockTransport::new();
    let orchestrator = TaskOrchestrator::new(db.clone(), pool, transport, 3);

    let outcome = orchestrator
        .analyze("gpt_mini", 1, &["bandit".into()])
        .await
        .expect("capacity exhaustion is not an Err");
    assert_eq!(outcome.task.status, TaskStatus::Failed);
    assert!(
        outcome
            .task
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("No healthy")
    );
    assert_eq!(outcome.report.status, TaskStatus::Failed);
    assert!(outcome.report.findings.is_empty());
}
