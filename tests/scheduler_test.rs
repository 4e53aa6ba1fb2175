mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use orc::agent::MockAgentRunner;
use orc::executor::ExecutorContext;
use orc::host::{MockHostProvider, PrOutcome};
use orc::scheduler::{self, HaltReason, RunParams};
use orc::types::{GateType, PhaseTemplate, Priority, TaskStatus, Workflow};
use orc::workflow::WorkflowRegistry;

use common::{make_task, ok_result, setup_repo_with_origin, test_config, test_store};

fn single_phase_workflow() -> Workflow {
    let mut template = PhaseTemplate::new("implement");
    template.gate = Some(GateType::Auto);
    Workflow {
        id: "wf".to_string(),
        phases: vec![template],
    }
}

fn empty_workflow() -> Workflow {
    Workflow {
        id: "empty".to_string(),
        phases: vec![],
    }
}

async fn make_ctx(
    repo_root: std::path::PathBuf,
    store: orc::store::Store,
    results: Vec<Result<orc::types::AgentResult, String>>,
) -> Arc<ExecutorContext<MockAgentRunner>> {
    Arc::new(ExecutorContext {
        store,
        registry: Arc::new(WorkflowRegistry::from_workflows(vec![
            single_phase_workflow(),
            empty_workflow(),
        ])),
        config: Arc::new(test_config()),
        runner: Arc::new(MockAgentRunner::new(results)),
        host: Arc::new(MockHostProvider::new(vec![PrOutcome::Created(
            "https://example.test/pr/1".to_string(),
        )])),
        repo_root,
    })
}

#[tokio::test]
async fn dependent_task_runs_after_blocker_completes() {
    let (repo, _origin) = setup_repo_with_origin();
    let store = test_store().await;

    let mut a = make_task("", TaskStatus::Planned);
    a.workflow_id = "wf".to_string();
    store.create_task(&mut a, "TASK").await.unwrap();

    let mut b = make_task("", TaskStatus::Planned);
    b.workflow_id = "wf".to_string();
    b.blocked_by = vec![a.id.clone()];
    store.create_task(&mut b, "TASK").await.unwrap();

    // Mock results consumed in dispatch order: A first, then B
    let results = vec![
        ok_result(&a.id, "implement"),
        ok_result(&b.id, "implement"),
    ];
    let ctx = make_ctx(repo.path().to_path_buf(), store.clone(), results).await;

    let summary = scheduler::run_scheduler(
        Arc::clone(&ctx),
        RunParams::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::AllDoneOrBlocked);
    assert_eq!(summary.tasks_completed, vec![a.id.clone(), b.id.clone()]);
    assert!(summary.tasks_failed.is_empty());

    let a = store.load_task(&a.id).await.unwrap();
    let b = store.load_task(&b.id).await.unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Completed);

    // B's claim could only have been acquired after A turned terminal
    assert!(store.list_claims().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_workflow_task_is_not_dispatched_and_status_unchanged() {
    let (repo, _origin) = setup_repo_with_origin();
    let store = test_store().await;

    let mut task = make_task("", TaskStatus::Planned);
    task.workflow_id = "empty".to_string();
    store.create_task(&mut task, "TASK").await.unwrap();

    let ctx = make_ctx(repo.path().to_path_buf(), store.clone(), vec![]).await;
    let summary = scheduler::run_scheduler(
        Arc::clone(&ctx),
        RunParams::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(summary.tasks_failed.contains(&task.id));

    // Fail-fast happened before any claim: status untouched
    let task = store.load_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Planned);
    assert!(store.list_claims().await.unwrap().is_empty());
}

#[tokio::test]
async fn targets_restrict_and_settle_the_run() {
    let (repo, _origin) = setup_repo_with_origin();
    let store = test_store().await;

    let mut a = make_task("", TaskStatus::Planned);
    a.workflow_id = "wf".to_string();
    store.create_task(&mut a, "TASK").await.unwrap();

    let mut other = make_task("", TaskStatus::Planned);
    other.workflow_id = "wf".to_string();
    store.create_task(&mut other, "TASK").await.unwrap();

    let results = vec![ok_result(&a.id, "implement")];
    let ctx = make_ctx(repo.path().to_path_buf(), store.clone(), results).await;

    let summary = scheduler::run_scheduler(
        Arc::clone(&ctx),
        RunParams {
            targets: vec![a.id.clone()],
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::TargetsSettled);
    assert_eq!(summary.tasks_completed, vec![a.id.clone()]);

    // The untargeted task was never touched
    let other = store.load_task(&other.id).await.unwrap();
    assert_eq!(other.status, TaskStatus::Planned);
}

#[tokio::test]
async fn cancelled_run_halts_with_shutdown_reason() {
    let (repo, _origin) = setup_repo_with_origin();
    let store = test_store().await;

    let mut task = make_task("", TaskStatus::Planned);
    task.workflow_id = "wf".to_string();
    store.create_task(&mut task, "TASK").await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let ctx = make_ctx(repo.path().to_path_buf(), store.clone(), vec![]).await;
    let summary = scheduler::run_scheduler(Arc::clone(&ctx), RunParams::default(), cancel)
        .await
        .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert!(summary.tasks_completed.is_empty());

    // Never dispatched: no claim, status untouched
    let task = store.load_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Planned);
}

#[tokio::test]
async fn higher_priority_task_dispatches_first() {
    let (repo, _origin) = setup_repo_with_origin();
    let store = test_store().await;

    let mut low = make_task("", TaskStatus::Planned);
    low.workflow_id = "wf".to_string();
    low.priority = Priority::Low;
    store.create_task(&mut low, "TASK").await.unwrap();

    let mut critical = make_task("", TaskStatus::Planned);
    critical.workflow_id = "wf".to_string();
    critical.priority = Priority::Critical;
    store.create_task(&mut critical, "TASK").await.unwrap();

    // With one executor slot, dispatch order is observable through the
    // order mock results are consumed: the critical task's result first.
    let mut config = test_config();
    config.execution.max_concurrent = 1;

    let results = vec![
        ok_result(&critical.id, "implement"),
        ok_result(&low.id, "implement"),
    ];
    let ctx = Arc::new(ExecutorContext {
        store: store.clone(),
        registry: Arc::new(WorkflowRegistry::from_workflows(vec![single_phase_workflow()])),
        config: Arc::new(config),
        runner: Arc::new(MockAgentRunner::new(results)),
        host: Arc::new(MockHostProvider::new(vec![PrOutcome::Created(
            "https://example.test/pr/1".to_string(),
        )])),
        repo_root: repo.path().to_path_buf(),
    });

    let summary = scheduler::run_scheduler(
        Arc::clone(&ctx),
        RunParams::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        summary.tasks_completed,
        vec![critical.id.clone(), low.id.clone()]
    );
    assert!(summary.tasks_failed.is_empty());
}
